//! 工具输入 Schema 与校验；推理回复格式的 JSON Schema（schemars 生成）
//!
//! 参数声明沿用 OpenAI function calling 的形态，既用于校验 Action 参数，也用于拼入 system prompt。

use std::collections::HashMap;

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// 参数类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
        }
    }
}

/// 单个参数声明
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamType,
    pub description: String,
    pub required: bool,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
}

impl ToolParameter {
    pub fn required(name: impl Into<String>, kind: ParamType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            description: description.into(),
            required: true,
            enum_values: None,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParamType, description: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }

    pub fn with_enum<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }
}

/// 工具输入 Schema：有序参数列表
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    parameters: Vec<ToolParameter>,
}

impl InputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, parameter: ToolParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn parameters(&self) -> &[ToolParameter] {
        &self.parameters
    }

    /// 校验参数：必须是 JSON 对象（null 视为空对象），必填项齐全、类型与枚举匹配、不允许未声明的键
    pub fn validate(&self, args: &Value) -> Result<(), String> {
        let empty = Map::new();
        let obj = match args {
            Value::Null => &empty,
            Value::Object(map) => map,
            other => return Err(format!("arguments must be a JSON object, got {}", type_name(other))),
        };

        for key in obj.keys() {
            if !self.parameters.iter().any(|p| &p.name == key) {
                return Err(format!("unexpected parameter '{key}'"));
            }
        }

        for param in &self.parameters {
            let Some(value) = obj.get(&param.name) else {
                if param.required {
                    return Err(format!("missing required parameter '{}'", param.name));
                }
                continue;
            };
            if !param.kind.matches(value) {
                return Err(format!(
                    "parameter '{}' must be {}, got {}",
                    param.name,
                    param.kind.as_str(),
                    type_name(value)
                ));
            }
            if let (Some(allowed), Some(s)) = (&param.enum_values, value.as_str()) {
                if !allowed.iter().any(|a| a == s) {
                    return Err(format!(
                        "parameter '{}' must be one of [{}], got '{}'",
                        param.name,
                        allowed.join(", "),
                        s
                    ));
                }
            }
        }
        Ok(())
    }

    /// JSON Schema 形式（OpenAI function parameters）
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let mut prop = json!({
                "type": param.kind.as_str(),
                "description": param.description,
            });
            if let Some(values) = &param.enum_values {
                prop["enum"] = json!(values);
            }
            properties.insert(param.name.clone(), prop);
            if param.required {
                required.push(param.name.clone());
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// 推理回复格式（仅用于 Schema 生成，与 planner 的解析结构一致）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ReasoningFormat {
    /// 本步推理过程；当 actions 为空时即为最终答案
    thought: String,
    /// 本步需要调用的工具；相互独立的调用会并行执行
    actions: Vec<ActionFormat>,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
struct ActionFormat {
    /// 已注册的工具名
    tool: String,
    /// 工具参数，需符合该工具声明的参数 Schema
    args: HashMap<String, serde_json::Value>,
}

/// 返回推理回复的 JSON Schema 字符串，可拼入 system prompt
pub fn reasoning_format_schema_json() -> String {
    let schema = schema_for!(ReasoningFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
