//! 状态定义：控制器状态机与运行终态
//!
//! Start → Reasoning → Acting → Observing → (Reasoning | Done | Failed)；Done / Failed 为终态。

use std::fmt;

use serde::{Deserialize, Serialize};

/// 控制器阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Start,
    Reasoning,
    Acting,
    Observing,
    Done,
    Failed,
}

impl AgentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Done | AgentState::Failed)
    }

    /// 合法转移；任何非终态都可以因取消或错误转到 Failed
    pub fn can_transition_to(&self, next: AgentState) -> bool {
        use AgentState::*;
        match (self, next) {
            (Done | Failed, _) => false,
            (_, Failed) => true,
            (Start, Reasoning) => true,
            (Reasoning, Acting | Done | Reasoning) => true,
            (Acting, Observing) => true,
            (Observing, Reasoning | Done) => true,
            _ => false,
        }
    }
}

/// 运行失败原因码
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    ParseError,
    OrchestrationError,
    IterationLimit,
    Cancelled,
    LlmError,
    MemoryError,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::ParseError => "parse-error",
            FailureReason::OrchestrationError => "orchestration-error",
            FailureReason::IterationLimit => "iteration-limit",
            FailureReason::Cancelled => "cancelled",
            FailureReason::LlmError => "llm-error",
            FailureReason::MemoryError => "memory-error",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 失败描述：原因码 + 可读信息
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl RunFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason, self.message)
    }
}

/// 运行终态
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Done { answer: String },
    Failed(RunFailure),
}

impl RunOutcome {
    pub fn failed(reason: FailureReason, message: impl Into<String>) -> Self {
        RunOutcome::Failed(RunFailure::new(reason, message))
    }

    pub fn is_done(&self) -> bool {
        matches!(self, RunOutcome::Done { .. })
    }

    pub fn answer(&self) -> Option<&str> {
        match self {
            RunOutcome::Done { answer } => Some(answer),
            RunOutcome::Failed(_) => None,
        }
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            RunOutcome::Done { .. } => None,
            RunOutcome::Failed(failure) => Some(failure.reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_do_not_transition() {
        assert!(AgentState::Done.is_terminal());
        assert!(!AgentState::Done.can_transition_to(AgentState::Reasoning));
        assert!(!AgentState::Failed.can_transition_to(AgentState::Failed));
    }

    #[test]
    fn test_loop_transitions() {
        assert!(AgentState::Start.can_transition_to(AgentState::Reasoning));
        assert!(AgentState::Reasoning.can_transition_to(AgentState::Acting));
        assert!(AgentState::Observing.can_transition_to(AgentState::Reasoning));
        assert!(!AgentState::Start.can_transition_to(AgentState::Acting));
        assert!(!AgentState::Acting.can_transition_to(AgentState::Done));
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = RunOutcome::failed(FailureReason::IterationLimit, "3 iterations");
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["reason"], "iteration-limit");
        assert_eq!(outcome.failure_reason(), Some(FailureReason::IterationLimit));
    }
}
