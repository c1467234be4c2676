//! OpenAI 兼容 API 传输
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；OpenAI、OpenRouter、DeepSeek、自建代理等。
//! 工具目录已由 planner 写入 system prompt，这里不使用原生 function calling。
//! complete_stream 走 SSE 流式接口，每个 content 增量即时转发。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc::UnboundedSender;

use crate::llm::{LlmError, LlmTransport};
use crate::memory::{Message, Role};
use crate::tools::ToolContract;

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// 请求参数
#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub model: String,
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub request_timeout: Duration,
}

/// OpenAI 兼容传输：持有 Client 与请求参数，complete 时转 Message 为 API 格式并取首条 content
pub struct OpenAiTransport {
    client: Client<OpenAIConfig>,
    settings: OpenAiSettings,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiTransport {
    pub fn new(settings: OpenAiSettings, api_key: impl Into<String>) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(api_key.into());
        if let Some(url) = &settings.base_url {
            config = config.with_api_base(url);
        }
        Self {
            client: Client::with_config(config),
            settings,
            usage: TokenUsage::new(),
        }
    }

    /// 从环境变量 OPENAI_API_KEY 读取密钥；未设置时返回 None
    pub fn from_env(settings: OpenAiSettings) -> Option<Self> {
        let key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty())?;
        Some(Self::new(settings, key))
    }

    fn to_openai_messages(messages: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let build_err = |e: async_openai::error::OpenAIError| LlmError::Fatal(e.to_string());
        messages
            .iter()
            .map(|m| {
                let message = match m.role {
                    Role::System => ChatCompletionRequestMessage::System(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(build_err)?,
                    ),
                    Role::Assistant => ChatCompletionRequestMessage::Assistant(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(build_err)?,
                    ),
                    // Observation 以用户消息回传（文本协议，无 tool_call_id）
                    Role::User | Role::Tool => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(build_err)?,
                    ),
                };
                Ok(message)
            })
            .collect()
    }

    fn build_request(&self, context: &[Message], stream: bool) -> Result<CreateChatCompletionRequest, LlmError> {
        CreateChatCompletionRequestArgs::default()
            .model(&self.settings.model)
            .messages(Self::to_openai_messages(context)?)
            .max_completion_tokens(self.settings.max_tokens)
            .temperature(self.settings.temperature)
            .stream(stream)
            .build()
            .map_err(|e| LlmError::Fatal(e.to_string()))
    }

    fn timed_out(&self) -> LlmError {
        LlmError::Transient(format!(
            "request timed out after {:?}",
            self.settings.request_timeout
        ))
    }
}

#[async_trait]
impl LlmTransport for OpenAiTransport {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(&self, context: &[Message], _tools: &[ToolContract]) -> Result<String, LlmError> {
        let request = self.build_request(context, false)?;

        let response = tokio::time::timeout(self.settings.request_timeout, self.client.chat().create(request))
            .await
            .map_err(|_| self.timed_out())?
            .map_err(|e| LlmError::classify(e.to_string()))?;

        // 提取 token 使用统计
        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        tracing::debug!(model = %self.settings.model, chars = content.len(), "completion received");
        Ok(content)
    }

    /// request_timeout 同时约束建立连接与相邻两个分片之间的间隔
    async fn complete_stream(
        &self,
        context: &[Message],
        _tools: &[ToolContract],
        deltas: &UnboundedSender<String>,
    ) -> Result<String, LlmError> {
        let request = self.build_request(context, true)?;
        let timeout = self.settings.request_timeout;

        let mut stream = tokio::time::timeout(timeout, self.client.chat().create_stream(request))
            .await
            .map_err(|_| self.timed_out())?
            .map_err(|e| LlmError::classify(e.to_string()))?;

        let mut content = String::new();
        while let Some(chunk) = tokio::time::timeout(timeout, stream.next())
            .await
            .map_err(|_| self.timed_out())?
        {
            let chunk = chunk.map_err(|e| LlmError::classify(e.to_string()))?;
            if let Some(usage) = &chunk.usage {
                self.usage
                    .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
            }
            let delta = chunk
                .choices
                .into_iter()
                .find(|c| c.index == 0)
                .and_then(|c| c.delta.content);
            if let Some(delta) = delta.filter(|d| !d.is_empty()) {
                let _ = deltas.send(delta.clone());
                content.push_str(&delta);
            }
        }

        tracing::debug!(model = %self.settings.model, chars = content.len(), "streamed completion received");
        Ok(content)
    }
}
