//! Echo 工具（测试用）

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::{ParamType, Tool, ToolContext, ToolContract, ToolError, ToolOutput, ToolParameter};

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn contract(&self) -> ToolContract {
        ToolContract::new("echo", "Echo text back unchanged (for testing).")
            .parameter(ToolParameter::required("text", ParamType::String, "Text to echo"))
    }

    async fn invoke(&self, input: Value, _ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        let text = input
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("(empty)");
        Ok(ToolOutput::new(json!({ "text": text }), text))
    }
}
