//! 核心编排层：错误与恢复、状态机与终态、会话监管、运行时装配

pub mod builder;
pub mod error;
pub mod recovery;
pub mod session_supervisor;
pub mod state;

pub use builder::{create_transport_from_config, AgentBuilder, AgentRuntime};
pub use error::{AgentError, RecoveryAction};
pub use recovery::RecoveryEngine;
pub use session_supervisor::SessionSupervisor;
pub use state::{AgentState, FailureReason, RunFailure, RunOutcome};
