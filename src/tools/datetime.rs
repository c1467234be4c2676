//! 当前日期时间工具（UTC）

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::tools::{ParamType, Tool, ToolContext, ToolContract, ToolError, ToolOutput, ToolParameter};

pub struct DateTimeTool;

impl DateTimeTool {
    fn render(now: DateTime<Utc>, format: &str) -> String {
        match format {
            "iso" => now.to_rfc3339(),
            "timestamp" => now.timestamp().to_string(),
            "full" => format!(
                "Date: {}\nTime: {} UTC\nWeekday: {}\nTimestamp: {}\nISO: {}",
                now.format("%Y-%m-%d"),
                now.format("%H:%M:%S"),
                now.format("%A"),
                now.timestamp(),
                now.to_rfc3339()
            ),
            _ => now.format("%A, %B %d, %Y at %I:%M %p UTC").to_string(),
        }
    }
}

#[async_trait]
impl Tool for DateTimeTool {
    fn contract(&self) -> ToolContract {
        ToolContract::new(
            "datetime",
            "Gets the current date and time (UTC). Formats: 'iso' (ISO 8601), 'human' \
             (human-readable, default), 'timestamp' (Unix seconds) or 'full' (detailed).",
        )
        .parameter(
            ToolParameter::optional(
                "format",
                ParamType::String,
                "Output format: iso, human, timestamp, or full",
            )
            .with_enum(["iso", "human", "timestamp", "full"]),
        )
    }

    async fn invoke(&self, input: Value, _ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        let format = input.get("format").and_then(Value::as_str).unwrap_or("human");
        let now = Utc::now();
        let text = Self::render(now, format);
        Ok(ToolOutput::new(
            json!({ "format": format, "value": text, "timestamp": now.timestamp() }),
            text,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 0).unwrap()
    }

    #[test]
    fn test_formats() {
        assert_eq!(DateTimeTool::render(fixed(), "iso"), "2024-03-09T14:05:00+00:00");
        assert_eq!(DateTimeTool::render(fixed(), "timestamp"), "1709993100");
        assert_eq!(
            DateTimeTool::render(fixed(), "human"),
            "Saturday, March 09, 2024 at 02:05 PM UTC"
        );
        let full = DateTimeTool::render(fixed(), "full");
        assert!(full.starts_with("Date: 2024-03-09\nTime: 14:05:00 UTC\nWeekday: Saturday"));
    }

    #[tokio::test]
    async fn test_invoke_defaults_to_human() {
        let ctx = ToolContext {
            invocation_id: crate::tools::InvocationId::new("t"),
            attempt: 1,
            upstream: vec![],
        };
        let out = DateTimeTool.invoke(json!({}), ctx).await.unwrap();
        assert_eq!(out.data["format"], "human");
        assert!(out.summary.contains("UTC"));
    }
}
