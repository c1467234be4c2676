//! 推理轨迹：每一轮 (Thought, Actions, Observations) 一条记录，追加后不再修改

use serde::{Deserialize, Serialize};

use crate::tools::{Action, Observation};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 从 1 开始
    pub index: usize,
    pub thought: String,
    pub actions: Vec<Action>,
    /// 与 actions 同序
    pub observations: Vec<Observation>,
}

/// 只追加的轨迹
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningTrace {
    records: Vec<IterationRecord>,
}

impl ReasoningTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, record: IterationRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[IterationRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&IterationRecord> {
        self.records.last()
    }

    /// 全部轨迹中执行过的 Action 数
    pub fn action_count(&self) -> usize {
        self.records.iter().map(|r| r.actions.len()).sum()
    }
}
