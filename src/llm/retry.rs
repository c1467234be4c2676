//! 带重试的传输装饰器：Transient 错误按指数退避重试，其它错误直接返回
//!
//! 退避等待不单独监听取消：调用方丢弃 future 即中止等待。流式调用重试时，已发出的增量不会撤回。

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::llm::{LlmError, LlmTransport};
use crate::memory::Message;
use crate::tools::{RetryPolicy, ToolContract};

pub struct RetryingTransport<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T: LlmTransport> RetryingTransport<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    async fn with_retry<'a, F, Fut>(&'a self, op: &str, call: F) -> Result<String, LlmError>
    where
        F: Fn(&'a T) -> Fut,
        Fut: std::future::Future<Output = Result<String, LlmError>>,
    {
        let mut attempt = 1;
        loop {
            match call(&self.inner).await {
                Err(e) if e.is_transient() && self.policy.should_retry(attempt) => {
                    let delay = self.policy.delay_for(attempt);
                    tracing::warn!(op, attempt, ?delay, error = %e, "transient LLM error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl<T: LlmTransport> LlmTransport for RetryingTransport<T> {
    async fn complete(&self, context: &[Message], tools: &[ToolContract]) -> Result<String, LlmError> {
        self.with_retry("complete", |inner| inner.complete(context, tools))
            .await
    }

    async fn complete_stream(
        &self,
        context: &[Message],
        tools: &[ToolContract],
        deltas: &UnboundedSender<String>,
    ) -> Result<String, LlmError> {
        self.with_retry("complete_stream", |inner| inner.complete_stream(context, tools, deltas))
            .await
    }

    async fn summarize(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.with_retry("summarize", |inner| inner.summarize(messages))
            .await
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}
