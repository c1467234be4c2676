//! 对话快照持久化
//!
//! 将 {Conversation, 迭代计数} 连同格式版本写成单个 JSON 文件；加载时区分「损坏」与「版本不兼容」。

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::memory::{Conversation, MemoryError};

/// 当前快照格式版本
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt snapshot: {0}")]
    Corrupt(String),

    #[error("Incompatible snapshot version {found} (expected {expected})")]
    IncompatibleVersion { found: u64, expected: u32 },

    /// 快照内容在当前预算下无法压缩到上下文预算以内
    #[error("Snapshot does not fit the context budget: {0}")]
    OverBudget(#[from] MemoryError),
}

impl PersistenceError {
    /// 对外的错误类别
    pub fn kind(&self) -> &'static str {
        match self {
            PersistenceError::Io(_) => "io",
            PersistenceError::Corrupt(_) => "corrupt",
            PersistenceError::IncompatibleVersion { .. } => "incompatible-version",
            PersistenceError::OverBudget(_) => "over-budget",
        }
    }
}

/// 版本化快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub saved_at: i64,
    pub iteration: u64,
    pub conversation: Conversation,
}

impl Snapshot {
    pub fn new(conversation: Conversation, iteration: u64) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: chrono::Utc::now().timestamp_millis(),
            iteration,
            conversation,
        }
    }

    pub fn encode(&self) -> Result<String, PersistenceError> {
        serde_json::to_string_pretty(self).map_err(|e| PersistenceError::Corrupt(e.to_string()))
    }

    /// 先只读 version 字段判定兼容性，再做完整反序列化
    pub fn decode(data: &str) -> Result<Self, PersistenceError> {
        let value: Value =
            serde_json::from_str(data).map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
        let version = value
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| PersistenceError::Corrupt("missing version field".to_string()))?;
        if version != u64::from(SNAPSHOT_VERSION) {
            return Err(PersistenceError::IncompatibleVersion {
                found: version,
                expected: SNAPSHOT_VERSION,
            });
        }
        let snapshot: Snapshot =
            serde_json::from_value(value).map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
        if snapshot.conversation.turn() < snapshot.conversation.len() as u64 {
            return Err(PersistenceError::Corrupt(format!(
                "turn counter {} is behind message count {}",
                snapshot.conversation.turn(),
                snapshot.conversation.len()
            )));
        }
        Ok(snapshot)
    }

    /// 写入文件；父目录不存在时自动创建，先写临时文件再重命名
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PersistenceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, self.encode()?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let data = std::fs::read_to_string(path)?;
        Self::decode(&data)
    }
}
