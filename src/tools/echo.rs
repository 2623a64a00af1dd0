//! Echo 工具（测试用）

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::ToolError;
use crate::tools::{Tool, ToolSpec};

/// Echo 工具：回显 text 参数，未提供时回显全部参数
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("echo", "Echo text (for testing). Args: {\"text\": \"message\"}")
            .input_schema(json!({
                "type": "object",
                "properties": { "text": { "type": "string" } }
            }))
            .idempotent(true)
    }

    async fn execute(&self, params: Value) -> Result<Value, ToolError> {
        Ok(params.get("text").cloned().unwrap_or(params))
    }
}
