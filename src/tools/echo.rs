//! Echo 工具（测试与本地演示用）

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::{Tool, ToolError};

/// Echo 工具：原样返回参数
pub struct EchoTool {
    name: String,
}

impl EchoTool {
    pub fn new() -> Self {
        Self::named("echo")
    }

    /// 以指定名称注册（用于模拟诊断工具）
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for EchoTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Echo the arguments back (for testing). Args: {\"text\": \"message\"}"
    }

    async fn invoke(&self, args: Value) -> Result<Value, ToolError> {
        Ok(json!({ "tool": self.name, "echo": args }))
    }
}
