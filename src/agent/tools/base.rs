//! `Tool` trait and result envelope. Grounded on the teacher's
//! `agent/tools/base.rs` — kept nearly verbatim, the contract survives the
//! rewrite unchanged.

use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn new(content: impl Into<String>) -> Self {
        ToolResult { content: content.into(), is_error: false }
    }

    pub fn error(content: impl Into<String>) -> Self {
        ToolResult { content: content.into(), is_error: true }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Value;

    async fn execute(&self, params: Value) -> anyhow::Result<ToolResult>;

    fn to_definition(&self) -> crate::providers::base::ToolDefinition {
        crate::providers::base::ToolDefinition { name: self.name().to_string(), description: self.description().to_string(), parameters: self.parameters() }
    }
}
