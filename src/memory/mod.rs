//! 记忆层：对话消息序列、Token 预算、摘要压缩与快照持久化

pub mod conversation;
pub mod manager;
pub mod persistence;
pub mod token_budget;

pub use conversation::{Conversation, Message, Role, ToolPayload};
pub use manager::{CompactionOutcome, MemoryError, MemoryManager};
pub use persistence::{PersistenceError, Snapshot, SNAPSHOT_VERSION};
pub use token_budget::{TokenBudget, TokenEstimator};
