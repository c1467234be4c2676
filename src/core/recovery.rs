//! 错误恢复引擎
//!
//! 根据 AgentError 类型与连续失败次数返回 RecoveryAction，供 ReAct 循环决定是带提示重试、
//! 退避重试、压缩上下文还是终止。

use crate::core::{AgentError, FailureReason, RecoveryAction};
use crate::llm::LlmError;
use crate::tools::RetryPolicy;

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    max_parse_retries: u32,
    llm_retry: RetryPolicy,
}

impl RecoveryEngine {
    pub fn new(max_parse_retries: u32, llm_retry: RetryPolicy) -> Self {
        Self {
            max_parse_retries,
            llm_retry,
        }
    }

    /// `attempt`：同类错误在当前推理步内第几次出现（从 1 开始）
    pub fn handle(&self, err: &AgentError, attempt: u32) -> RecoveryAction {
        match err {
            AgentError::Parse(e) if attempt <= self.max_parse_retries => {
                RecoveryAction::RetryWithPrompt(format!(
                    "Your previous reply could not be parsed ({e}). Reply with exactly one JSON object: \
                     {{\"thought\": \"...\", \"actions\": [{{\"tool\": \"<name>\", \"args\": {{...}}}}]}}. \
                     Use an empty actions list when you have the final answer. No markdown, no extra text."
                ))
            }
            AgentError::Llm(LlmError::Transient(_)) if self.llm_retry.should_retry(attempt) => {
                RecoveryAction::Retry(self.llm_retry.delay_for(attempt))
            }
            AgentError::Llm(LlmError::ContextWindowExceeded) if attempt == 1 => {
                RecoveryAction::SummarizeAndPrune
            }
            AgentError::Cancelled => RecoveryAction::Abort(FailureReason::Cancelled),
            other => RecoveryAction::Abort(other.failure_reason()),
        }
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(2, RetryPolicy::default())
    }
}
