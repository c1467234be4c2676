//! LLM 传输抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmTransport：complete（推理一步）、complete_stream（流式推理）、
//! summarize（压缩历史）。
//! 错误区分可重试（Transient）与不可重试（Fatal），上下文超限单独成类，由调用方决定重试或失败。

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::memory::{Message, Role};
use crate::tools::ToolContract;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// 网络抖动、限流、5xx 等，可退避重试
    #[error("Transient LLM error: {0}")]
    Transient(String),

    #[error("Context window exceeded")]
    ContextWindowExceeded,

    #[error("LLM error: {0}")]
    Fatal(String),
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::Transient(_))
    }

    /// 按错误文本归类（HTTP 客户端错误没有统一的结构化类别）
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("context_length") || lower.contains("context length") || lower.contains("maximum context") {
            LlmError::ContextWindowExceeded
        } else if ["timeout", "timed out", "rate limit", "429", "500", "502", "503", "504", "connection", "overloaded"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            LlmError::Transient(message)
        } else {
            LlmError::Fatal(message)
        }
    }
}

/// 摘要请求的指令
pub const SUMMARY_INSTRUCTION: &str = "Summarize the following conversation excerpt for your own later reference. \
Keep facts, tool results, decisions and open questions; drop pleasantries. Reply with the summary text only.";

/// LLM 传输 trait：推理完成与摘要是两种独立能力
#[async_trait]
pub trait LlmTransport: Send + Sync {
    /// 推理一步：context 为 Memory 提供的有序消息，tools 为可用工具契约
    async fn complete(&self, context: &[Message], tools: &[ToolContract]) -> Result<String, LlmError>;

    /// 流式推理：增量文本依次写入 deltas，返回拼接后的完整回复。
    /// 默认实现不支持流式，完整回复作为唯一一段发送
    async fn complete_stream(
        &self,
        context: &[Message],
        tools: &[ToolContract],
        deltas: &UnboundedSender<String>,
    ) -> Result<String, LlmError> {
        let text = self.complete(context, tools).await?;
        if !text.is_empty() {
            let _ = deltas.send(text.clone());
        }
        Ok(text)
    }

    /// 把一段历史压缩为摘要文本；默认实现复用 complete
    async fn summarize(&self, messages: &[Message]) -> Result<String, LlmError> {
        let transcript = render_transcript(messages);
        let request = [
            Message::system(SUMMARY_INSTRUCTION),
            Message::user(transcript),
        ];
        self.complete(&request, &[]).await
    }

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 共享句柄同样是传输（便于装饰器包装 `Arc<dyn LlmTransport>`）
#[async_trait]
impl<T: LlmTransport + ?Sized> LlmTransport for Arc<T> {
    async fn complete(&self, context: &[Message], tools: &[ToolContract]) -> Result<String, LlmError> {
        (**self).complete(context, tools).await
    }

    async fn complete_stream(
        &self,
        context: &[Message],
        tools: &[ToolContract],
        deltas: &UnboundedSender<String>,
    ) -> Result<String, LlmError> {
        (**self).complete_stream(context, tools, deltas).await
    }

    async fn summarize(&self, messages: &[Message]) -> Result<String, LlmError> {
        (**self).summarize(messages).await
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        (**self).token_usage()
    }
}

/// 摘要输入的纯文本形式：每条一行 `role: content`
pub fn render_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::System if m.is_summary() => "earlier summary",
                other => other.as_str(),
            };
            format!("{role}: {}", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
