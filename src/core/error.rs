//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 RetryWithPrompt / Retry / SummarizeAndPrune / Abort。
//! 工具层失败不在此列：它们是 Observation 里的 ErrorKind，由 LLM 自行调整。

use std::time::Duration;

use thiserror::Error;

use crate::core::FailureReason;
use crate::llm::LlmError;
use crate::memory::{MemoryError, PersistenceError};
use crate::react::ParseError;
use crate::tools::{OrchestrationError, RegistryError};

/// Agent 运行过程中可能出现的错误（解析、LLM、编排、记忆、持久化、配置）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("Orchestration error: {0}")]
    Orchestration(#[from] OrchestrationError),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Iteration limit reached ({0})")]
    IterationLimit(usize),

    #[error("Cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),
}

impl AgentError {
    /// 该错误终止运行时对应的原因码
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            AgentError::Parse(_) => FailureReason::ParseError,
            AgentError::Llm(_) => FailureReason::LlmError,
            AgentError::Orchestration(_) | AgentError::Registry(_) => {
                FailureReason::OrchestrationError
            }
            AgentError::Memory(_) | AgentError::Persistence(_) => FailureReason::MemoryError,
            AgentError::IterationLimit(_) => FailureReason::IterationLimit,
            AgentError::Cancelled => FailureReason::Cancelled,
            // 配置错误只出现在构建 transport 时
            AgentError::Config(_) => FailureReason::LlmError,
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 将纠正提示注入下一次推理（只进本次请求的上下文，不写入对话）
    RetryWithPrompt(String),
    /// 等待后重试同一步（瞬时 LLM 错误）
    Retry(Duration),
    /// 压缩上下文后重试（上下文超限）
    SummarizeAndPrune,
    /// 终止运行
    Abort(FailureReason),
}

impl RecoveryAction {
    pub fn name(&self) -> &'static str {
        match self {
            RecoveryAction::RetryWithPrompt(_) => "RetryWithPrompt",
            RecoveryAction::Retry(_) => "Retry",
            RecoveryAction::SummarizeAndPrune => "SummarizeAndPrune",
            RecoveryAction::Abort(_) => "Abort",
        }
    }
}
