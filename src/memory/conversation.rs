//! 对话：有序消息序列 + 单调递增的轮次计数
//!
//! 消息一旦追加即不可变，顺序有意义且永不重排；只有 MemoryManager 能修改 Conversation。

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::memory::TokenEstimator;
use crate::tools::{Action, InvocationId, Observation};

/// 消息角色（与 LLM API 一致，另加 tool 用于 Observation）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// 结构化工具载荷：assistant 消息携带本步请求的 Action，tool 消息指回对应的调用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolPayload {
    Calls {
        actions: Vec<Action>,
    },
    Result {
        invocation_id: InvocationId,
        tool: String,
        is_error: bool,
    },
}

/// 单条消息；token 数在首次需要时估算并缓存
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_payload: Option<ToolPayload>,
    /// 由摘要压缩生成的合成消息
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub summary: bool,
    #[serde(skip)]
    token_count: OnceLock<usize>,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.role == other.role
            && self.content == other.content
            && self.tool_payload == other.tool_payload
            && self.summary == other.summary
    }
}

impl Message {
    fn new(role: Role, content: String) -> Self {
        Self {
            role,
            content,
            tool_payload: None,
            summary: false,
            token_count: OnceLock::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content.into())
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content.into())
    }

    /// 带本步 Action 列表的 assistant 消息（Thought 作为正文）
    pub fn assistant_with_actions(thought: impl Into<String>, actions: Vec<Action>) -> Self {
        let mut msg = Self::new(Role::Assistant, thought.into());
        msg.tool_payload = Some(ToolPayload::Calls { actions });
        msg
    }

    /// 将一个 Observation 写成 tool 消息
    pub fn observation(observation: &Observation) -> Self {
        let mut msg = Self::new(Role::Tool, observation.to_message_content());
        msg.tool_payload = Some(ToolPayload::Result {
            invocation_id: observation.invocation_id.clone(),
            tool: observation.tool.clone(),
            is_error: !observation.is_success(),
        });
        msg
    }

    /// 摘要消息：代表被压缩掉的较早内容
    pub fn summary(content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::System, content.into());
        msg.summary = true;
        msg
    }

    pub fn is_summary(&self) -> bool {
        self.summary
    }

    /// 系统提示（非摘要的 system 消息）
    pub fn is_system_prompt(&self) -> bool {
        self.role == Role::System && !self.summary
    }

    pub fn token_count(&self) -> usize {
        *self
            .token_count
            .get_or_init(|| TokenEstimator::estimate_message(self))
    }
}

/// 对话：消息序列 + 轮次计数（每次追加 +1，压缩不会回退）
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<Message>,
    turn: u64,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, msg: Message) {
        self.messages.push(msg);
        self.turn += 1;
    }

    /// 用单条消息替换 [start, end) 区间
    pub(crate) fn splice(&mut self, start: usize, end: usize, replacement: Option<Message>) {
        self.messages.splice(start..end, replacement);
    }

    pub(crate) fn retain(&mut self, f: impl FnMut(&Message) -> bool) {
        self.messages.retain(f);
    }

    pub(crate) fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn token_estimate(&self) -> usize {
        self.messages.iter().map(Message::token_count).sum()
    }
}
