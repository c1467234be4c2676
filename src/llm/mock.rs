//! Mock LLM 传输（用于测试与离线运行，无需 API）
//!
//! 有脚本时按顺序返回预设回复；脚本用完后走默认行为：若最后一条用户目标之后还没有 Observation，
//! 请求一次 echo 工具，否则把最近的 Observation 作为最终答案。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc::UnboundedSender;

use crate::llm::{LlmError, LlmTransport};
use crate::memory::{Message, Role};
use crate::tools::ToolContract;

#[derive(Debug, Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    contexts: Mutex<Vec<Vec<Message>>>,
    complete_calls: AtomicUsize,
    summarize_calls: AtomicUsize,
    fail_summaries: bool,
    latency: Option<Duration>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预设回复序列
    pub fn scripted(replies: impl IntoIterator<Item = Result<String, LlmError>>) -> Self {
        Self {
            script: Mutex::new(replies.into_iter().collect()),
            ..Self::default()
        }
    }

    /// 便捷构造：全部为成功回复
    pub fn replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::scripted(replies.into_iter().map(|r| Ok(r.into())))
    }

    /// summarize 总是失败
    pub fn with_failing_summaries(mut self) -> Self {
        self.fail_summaries = true;
        self
    }

    /// 每次 complete 前等待，模拟慢速后端
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn push_reply(&self, reply: Result<String, LlmError>) {
        lock(&self.script).push_back(reply);
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    pub fn summarize_calls(&self) -> usize {
        self.summarize_calls.load(Ordering::SeqCst)
    }

    /// 每次 complete 收到的上下文
    pub fn contexts(&self) -> Vec<Vec<Message>> {
        lock(&self.contexts).clone()
    }

    fn default_reply(context: &[Message]) -> String {
        let last_user = context.iter().rposition(|m| m.role == Role::User);
        let observation = context
            .iter()
            .skip(last_user.map_or(0, |i| i + 1))
            .rev()
            .find(|m| m.role == Role::Tool);

        match observation {
            Some(obs) => json!({
                "thought": format!("The tool returned: {}", obs.content),
                "actions": [],
                "final_answer": obs.content,
            })
            .to_string(),
            None => {
                let goal = last_user
                    .map(|i| context[i].content.as_str())
                    .unwrap_or("(no input)");
                json!({
                    "thought": "Echo the request back.",
                    "actions": [{"tool": "echo", "args": {"text": format!("Echo from Mock: {goal}")}}],
                })
                .to_string()
            }
        }
    }
}

#[async_trait]
impl LlmTransport for MockTransport {
    async fn complete(&self, context: &[Message], _tools: &[ToolContract]) -> Result<String, LlmError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.contexts).push(context.to_vec());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let scripted = lock(&self.script).pop_front();
        scripted.unwrap_or_else(|| Ok(Self::default_reply(context)))
    }

    /// 按词切分回复，逐段发送
    async fn complete_stream(
        &self,
        context: &[Message],
        tools: &[ToolContract],
        deltas: &UnboundedSender<String>,
    ) -> Result<String, LlmError> {
        let reply = self.complete(context, tools).await?;
        for piece in reply.split_inclusive(' ') {
            let _ = deltas.send(piece.to_string());
        }
        Ok(reply)
    }

    async fn summarize(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.summarize_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_summaries {
            return Err(LlmError::Fatal("summaries disabled".into()));
        }
        Ok(format!("{} earlier messages condensed.", messages.len()))
    }
}
