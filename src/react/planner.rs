//! Planner：system prompt 拼装与 LLM 回复解析
//!
//! 回复支持两种格式：
//! - JSON：`{"thought": "...", "actions": [{"tool": "...", "args": {...}}], "final_answer": "..."}`
//!   （也接受 ```json 代码块与单个 `{"tool", "args"}` 的简写）；
//! - 文本：`Thought:` / `Action:` / `Action Input:` / `Final Answer:` 行标记。
//!
//! 既无 JSON 也无行标记的纯文本视为最终答案。

use std::borrow::Cow;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::llm::{LlmError, LlmTransport};
use crate::memory::Message;
use crate::tools::{reasoning_format_schema_json, ToolContract, ToolRegistry};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Helios, an autonomous assistant that solves the user's goal step by step. \
In each step think about what to do next, then either call one or more tools or give the final answer. \
Independent tool calls in the same step run in parallel. Tool results come back as Observation messages; \
if a tool fails, read the error and adapt.";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty response")]
    EmptyResponse,

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("response has neither a thought nor actions")]
    MissingThought,

    #[error("action #{0} has an empty tool name")]
    EmptyToolName(usize),

    #[error("invalid input for action '{tool}': {reason}")]
    InvalidActionInput { tool: String, reason: String },

    #[error("response mixes actions with a final answer")]
    Ambiguous,

    #[error("'Action Input' without a preceding 'Action'")]
    DanglingInput,
}

/// 一条待执行的工具请求（调用 ID 由控制器分配）
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    pub tool: String,
    pub args: Value,
}

/// Planner 输出
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerOutput {
    /// 没有 Action：thought 即推理，answer 为最终答案
    FinalAnswer { thought: String, answer: String },
    /// 需要执行工具
    Act {
        thought: String,
        actions: Vec<ActionRequest>,
    },
}

impl PlannerOutput {
    pub fn thought(&self) -> &str {
        match self {
            PlannerOutput::FinalAnswer { thought, .. } | PlannerOutput::Act { thought, .. } => thought,
        }
    }
}

#[derive(Deserialize)]
struct JsonReply {
    #[serde(default)]
    thought: Option<String>,
    #[serde(default)]
    actions: Option<Vec<JsonAction>>,
    #[serde(default)]
    final_answer: Option<String>,
    /// 简写：单个 {"tool", "args"}
    #[serde(default)]
    tool: Option<String>,
    #[serde(default, alias = "arguments")]
    args: Option<Value>,
}

#[derive(Deserialize)]
struct JsonAction {
    #[serde(default)]
    tool: String,
    #[serde(default, alias = "arguments", alias = "input")]
    args: Value,
}

/// 参数必须是对象；缺省 / null 视为 {}
fn normalize_args(tool: &str, args: Value) -> Result<Value, ParseError> {
    match args {
        Value::Null => Ok(Value::Object(Map::new())),
        Value::Object(_) => Ok(args),
        other => Err(ParseError::InvalidActionInput {
            tool: tool.to_string(),
            reason: format!("arguments must be a JSON object, got {other}"),
        }),
    }
}

fn build_output(
    thought: String,
    actions: Vec<ActionRequest>,
    final_answer: Option<String>,
) -> Result<PlannerOutput, ParseError> {
    match (actions.is_empty(), final_answer) {
        (false, Some(_)) => Err(ParseError::Ambiguous),
        (false, None) => Ok(PlannerOutput::Act { thought, actions }),
        (true, answer) => {
            if thought.is_empty() && answer.is_none() {
                return Err(ParseError::MissingThought);
            }
            let answer = answer.unwrap_or_else(|| thought.clone());
            Ok(PlannerOutput::FinalAnswer { thought, answer })
        }
    }
}

/// 提取 JSON 片段（```json 代码块或首个 `{` 到最后一个 `}`）
fn extract_json(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        return Some(rest.find("```").map_or(rest.trim(), |end| rest[..end].trim()));
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn parse_json_reply(raw: &str, surrounding: &str) -> Result<PlannerOutput, ParseError> {
    let reply: JsonReply =
        serde_json::from_str(raw).map_err(|e| ParseError::InvalidJson(format!("{e}: {raw}")))?;

    let mut thought = reply.thought.unwrap_or_default().trim().to_string();
    let mut actions = Vec::new();

    if let Some(tool) = reply.tool {
        // 简写形式：JSON 之外的文字作为 thought
        if thought.is_empty() {
            thought = surrounding.trim().to_string();
        }
        if tool.trim().is_empty() {
            return Err(ParseError::EmptyToolName(0));
        }
        let args = normalize_args(&tool, reply.args.unwrap_or(Value::Null))?;
        actions.push(ActionRequest { tool, args });
    } else if reply.actions.is_none() && reply.final_answer.is_none() && thought.is_empty() {
        return Err(ParseError::InvalidJson(format!(
            "expected 'thought' and 'actions' fields: {raw}"
        )));
    }

    for (idx, action) in reply.actions.unwrap_or_default().into_iter().enumerate() {
        let tool = action.tool.trim().to_string();
        if tool.is_empty() {
            return Err(ParseError::EmptyToolName(idx));
        }
        let args = normalize_args(&tool, action.args)?;
        actions.push(ActionRequest { tool, args });
    }

    build_output(thought, actions, reply.final_answer)
}

fn marker_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(thought|action input|action|final answer)\s*:\s*(.*)$").ok()
    })
    .as_ref()
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    None,
    Thought,
    Action,
    Input,
    Answer,
}

/// 文本 ReAct 格式；没有任何行标记时返回 None
fn parse_marked_text(text: &str) -> Option<Result<PlannerOutput, ParseError>> {
    let re = marker_regex()?;
    if !text.lines().any(|l| re.is_match(l)) {
        return None;
    }

    let mut section = Section::None;
    let mut thought = String::new();
    let mut answer: Option<String> = None;
    // (tool, 原始 input 文本)
    let mut pending: Vec<(String, String)> = Vec::new();

    for line in text.lines() {
        if let Some(caps) = re.captures(line) {
            let label = caps[1].to_lowercase();
            let rest = caps[2].to_string();
            section = match label.as_str() {
                "thought" => {
                    if !thought.is_empty() {
                        thought.push('\n');
                    }
                    thought.push_str(&rest);
                    Section::Thought
                }
                "action" => {
                    pending.push((rest.trim().to_string(), String::new()));
                    Section::Action
                }
                "action input" => {
                    let Some(last) = pending.last_mut() else {
                        return Some(Err(ParseError::DanglingInput));
                    };
                    last.1 = rest;
                    Section::Input
                }
                _ => {
                    answer = Some(rest);
                    Section::Answer
                }
            };
            continue;
        }
        let target = match section {
            Section::Thought => Some(&mut thought),
            Section::Input => pending.last_mut().map(|p| &mut p.1),
            Section::Answer => answer.as_mut(),
            Section::Action | Section::None => None,
        };
        if let Some(buf) = target {
            buf.push('\n');
            buf.push_str(line);
        }
    }

    let mut actions = Vec::with_capacity(pending.len());
    for (idx, (tool, input)) in pending.into_iter().enumerate() {
        if tool.is_empty() {
            return Some(Err(ParseError::EmptyToolName(idx)));
        }
        let input = input.trim();
        let args = if input.is_empty() {
            Value::Null
        } else {
            let json = extract_json(input).unwrap_or(input);
            match serde_json::from_str::<Value>(json) {
                Ok(v) => v,
                Err(e) => {
                    return Some(Err(ParseError::InvalidActionInput {
                        tool,
                        reason: e.to_string(),
                    }))
                }
            }
        };
        match normalize_args(&tool, args) {
            Ok(args) => actions.push(ActionRequest { tool, args }),
            Err(e) => return Some(Err(e)),
        }
    }

    let answer = answer.map(|a| a.trim().to_string());
    Some(build_output(thought.trim().to_string(), actions, answer))
}

/// 解析 LLM 输出为 Thought + Action(s) 或最终答案
pub fn parse_llm_output(output: &str) -> Result<PlannerOutput, ParseError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(ParseError::EmptyResponse);
    }

    if let Some(result) = parse_marked_text(trimmed) {
        return result;
    }

    if let Some(raw) = extract_json(trimmed) {
        let looks_like_json = trimmed.starts_with('{') || trimmed.contains("```json");
        match parse_json_reply(raw, &trimmed.replacen(raw, "", 1)) {
            Ok(out) => return Ok(out),
            Err(e) if looks_like_json => return Err(e),
            // 正文里偶然出现的花括号：按纯文本处理
            Err(_) => {}
        }
    }

    Ok(PlannerOutput::FinalAnswer {
        thought: trimmed.to_string(),
        answer: trimmed.to_string(),
    })
}

/// 基础提示 + 工具目录 + 回复格式 Schema
pub fn build_system_prompt(base: &str, registry: &ToolRegistry) -> String {
    let catalogue = if registry.is_empty() {
        "(no tools available)".to_string()
    } else {
        registry.catalogue()
    };
    format!(
        "{base}\n\n## Tools\n{catalogue}\n\n## Reply format\n\
         Reply with exactly one JSON object matching this schema:\n{schema}\n\
         Use an empty \"actions\" list when you can answer; the thought is then your final answer.",
        schema = reasoning_format_schema_json()
    )
}

/// Planner：持有 LLM 传输、完整 system prompt 与工具契约
pub struct Planner {
    transport: Arc<dyn LlmTransport>,
    system_prompt: String,
    tools: Vec<ToolContract>,
}

impl Planner {
    pub fn new(transport: Arc<dyn LlmTransport>, base_prompt: &str, registry: &ToolRegistry) -> Self {
        Self {
            transport,
            system_prompt: build_system_prompt(base_prompt, registry),
            tools: registry.contracts(),
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn transport(&self) -> &Arc<dyn LlmTransport> {
        &self.transport
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.transport.token_usage()
    }

    /// 推理一步；hint 为解析失败后的纠正提示，只附加在本次请求上
    pub async fn reason(&self, context: &[Message], hint: Option<&str>) -> Result<String, LlmError> {
        let request = with_hint(context, hint);
        self.transport.complete(&request, &self.tools).await
    }

    /// 同 reason，回复增量写入 deltas；返回时 deltas 随之关闭
    pub async fn reason_streaming(
        &self,
        context: &[Message],
        hint: Option<&str>,
        deltas: UnboundedSender<String>,
    ) -> Result<String, LlmError> {
        let request = with_hint(context, hint);
        self.transport
            .complete_stream(&request, &self.tools, &deltas)
            .await
    }
}

/// 纠错提示只附加在这一次请求上，不写入记忆
fn with_hint<'a>(context: &'a [Message], hint: Option<&str>) -> Cow<'a, [Message]> {
    match hint {
        None => Cow::Borrowed(context),
        Some(hint) => {
            let mut request = context.to_vec();
            request.push(Message::user(hint));
            Cow::Owned(request)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_with_actions() {
        let out = parse_llm_output(
            r#"{"thought": "need time", "actions": [{"tool": "datetime", "args": {"format": "iso"}}, {"tool": "echo"}]}"#,
        )
        .unwrap();
        match out {
            PlannerOutput::Act { thought, actions } => {
                assert_eq!(thought, "need time");
                assert_eq!(actions.len(), 2);
                assert_eq!(actions[0].args, json!({"format": "iso"}));
                assert_eq!(actions[1].args, json!({}));
            }
            other => panic!("expected Act, got {other:?}"),
        }
    }

    #[test]
    fn test_json_without_actions_is_final() {
        let out = parse_llm_output(r#"{"thought": "The answer is 4", "actions": []}"#).unwrap();
        assert_eq!(
            out,
            PlannerOutput::FinalAnswer {
                thought: "The answer is 4".into(),
                answer: "The answer is 4".into()
            }
        );
        let out = parse_llm_output(r#"{"thought": "done", "actions": [], "final_answer": "42"}"#).unwrap();
        assert!(matches!(out, PlannerOutput::FinalAnswer { answer, .. } if answer == "42"));
    }

    #[test]
    fn test_fenced_shorthand() {
        let out = parse_llm_output("Let me echo.\n```json\n{\"tool\": \"echo\", \"args\": {\"text\": \"hi\"}}\n```").unwrap();
        match out {
            PlannerOutput::Act { thought, actions } => {
                assert!(thought.starts_with("Let me echo."));
                assert_eq!(actions[0].tool, "echo");
            }
            other => panic!("expected Act, got {other:?}"),
        }
    }

    #[test]
    fn test_text_markers() {
        let text = "Thought: I should add\nAction: calculator\nAction Input: {\"expression\": \"2+2\"}";
        match parse_llm_output(text).unwrap() {
            PlannerOutput::Act { thought, actions } => {
                assert_eq!(thought, "I should add");
                assert_eq!(actions[0].args, json!({"expression": "2+2"}));
            }
            other => panic!("expected Act, got {other:?}"),
        }

        let text = "Thought: easy\nFinal Answer: 4";
        assert_eq!(
            parse_llm_output(text).unwrap(),
            PlannerOutput::FinalAnswer {
                thought: "easy".into(),
                answer: "4".into()
            }
        );
    }

    #[test]
    fn test_plain_text_is_final_answer() {
        let out = parse_llm_output("Paris is the capital of France.").unwrap();
        assert_eq!(out.thought(), "Paris is the capital of France.");
        let out = parse_llm_output("Sets look like {1, 2} in maths.").unwrap();
        assert!(matches!(out, PlannerOutput::FinalAnswer { .. }));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_llm_output("   "), Err(ParseError::EmptyResponse));
        assert!(matches!(
            parse_llm_output("{\"thought\": \"x\", \"actions\": [}"),
            Err(ParseError::InvalidJson(_))
        ));
        assert_eq!(
            parse_llm_output(r#"{"thought": "x", "actions": [{"tool": ""}]}"#),
            Err(ParseError::EmptyToolName(0))
        );
        assert!(matches!(
            parse_llm_output(r#"{"thought": "x", "actions": [{"tool": "echo", "args": "hi"}]}"#),
            Err(ParseError::InvalidActionInput { .. })
        ));
        assert_eq!(
            parse_llm_output("Action: echo\nAction Input: {}\nFinal Answer: done"),
            Err(ParseError::Ambiguous)
        );
        assert!(matches!(
            parse_llm_output("Action: echo\nAction Input: not json"),
            Err(ParseError::InvalidActionInput { .. })
        ));
        assert_eq!(parse_llm_output("Action Input: {}"), Err(ParseError::DanglingInput));
    }

    #[test]
    fn test_system_prompt_lists_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(crate::tools::EchoTool).unwrap();
        let prompt = build_system_prompt(DEFAULT_SYSTEM_PROMPT, &registry);
        assert!(prompt.contains("- echo:"));
        assert!(prompt.contains("actions"));
    }
}
