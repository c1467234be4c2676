//! 工具调用数据类型：Action（调用请求）、Observation（执行结果）、ErrorKind

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 调用 ID：在一次运行内唯一，用于把 Observation 对回 Action
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationId(String);

impl InvocationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("call_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 一次具名工具调用请求
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: InvocationId,
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

impl Action {
    pub fn new(tool: impl Into<String>, args: Value) -> Self {
        Self::with_id(InvocationId::generate(), tool, args)
    }

    pub fn with_id(id: InvocationId, tool: impl Into<String>, args: Value) -> Self {
        Self {
            id,
            tool: tool.into(),
            args,
        }
    }
}

/// Observation 失败类别（对 LLM 可见，运行不会因此中止）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    UnknownTool,
    InvalidInput,
    Timeout,
    ToolFailed,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnknownTool => "unknown-tool",
            ErrorKind::InvalidInput => "invalid-input",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ToolFailed => "tool-failed",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success { data: Value, summary: String },
    Failure { kind: ErrorKind, message: String },
}

/// 执行结果，与 Action 通过 invocation_id 一一对应
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub invocation_id: InvocationId,
    pub tool: String,
    pub outcome: Outcome,
    pub attempts: u32,
    pub duration_ms: u64,
}

impl Observation {
    pub fn success(action: &Action, output: ToolOutput, attempts: u32, duration_ms: u64) -> Self {
        Self {
            invocation_id: action.id.clone(),
            tool: action.tool.clone(),
            outcome: Outcome::Success {
                data: output.data,
                summary: output.summary,
            },
            attempts,
            duration_ms,
        }
    }

    pub fn failure(
        action: &Action,
        kind: ErrorKind,
        message: impl Into<String>,
        attempts: u32,
        duration_ms: u64,
    ) -> Self {
        Self {
            invocation_id: action.id.clone(),
            tool: action.tool.clone(),
            outcome: Outcome::Failure {
                kind,
                message: message.into(),
            },
            attempts,
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            Outcome::Success { .. } => None,
            Outcome::Failure { kind, .. } => Some(*kind),
        }
    }

    /// 写回对话时的文本形式
    pub fn to_message_content(&self) -> String {
        match &self.outcome {
            Outcome::Success { summary, .. } => {
                format!("Observation [{}] {}: {}", self.invocation_id, self.tool, summary)
            }
            Outcome::Failure { kind, message } => format!(
                "Observation [{}] {} failed ({}): {}",
                self.invocation_id, self.tool, kind, message
            ),
        }
    }
}

/// 工具成功输出：结构化数据 + 可读摘要
#[derive(Clone, Debug, PartialEq)]
pub struct ToolOutput {
    pub data: Value,
    pub summary: String,
}

impl ToolOutput {
    pub fn new(data: Value, summary: impl Into<String>) -> Self {
        Self {
            data,
            summary: summary.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            data: Value::String(text.clone()),
            summary: text,
        }
    }
}

/// 工具自报的失败：Retryable 按退避重试，Fatal 立即失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("{0}")]
    Retryable(String),
    #[error("{0}")]
    Fatal(String),
}

/// 调用上下文：本次调用 ID、第几次尝试、批次内已完成依赖的 Observation
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub invocation_id: InvocationId,
    pub attempt: u32,
    pub upstream: Vec<Observation>,
}

impl ToolContext {
    /// 查找某个上游工具的 Observation
    pub fn upstream_of(&self, tool: &str) -> Option<&Observation> {
        self.upstream.iter().find(|o| o.tool == tool)
    }
}
