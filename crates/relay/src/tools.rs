//! Built-in tools registered by the CLI.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use relay_core::request::ToolSpec;
use relay_runtime::{Tool, ToolContext, ToolError, ToolRegistry};
use serde_json::{Value, json};

/// Reports the current UTC time.
pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "current_time",
            "Get the current date and time in UTC (RFC 3339).",
            json!({"type": "object", "properties": {}}),
        )
    }

    async fn execute(&self, _arguments: Value, _ctx: &ToolContext) -> Result<String, ToolError> {
        Ok(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true))
    }
}

/// Returns its `text` argument unchanged.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "echo",
            "Echo the given text back.",
            json!({
                "type": "object",
                "properties": {"text": {"type": "string", "description": "Text to echo"}},
                "required": ["text"]
            }),
        )
    }

    async fn execute(&self, arguments: Value, _ctx: &ToolContext) -> Result<String, ToolError> {
        arguments
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| ToolError::InvalidArguments {
                message: "missing required parameter: text".into(),
            })
    }
}

/// Registry holding every built-in tool.
pub fn builtin_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(CurrentTimeTool));
    registry.register(Arc::new(EchoTool));
    registry
}
