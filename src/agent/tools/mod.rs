//! `ToolRegistry`: maps tool name to implementation, applies the trust
//! policy gate before every execution. Grounded on the teacher's
//! `agent/tools/registry.rs`, narrowed to this crate's tool surface.

pub mod base;
pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::agent::tools::base::{Tool, ToolResult};
use crate::providers::base::ToolDefinition;
use crate::trust::policy::ToolPolicyEngine;

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.to_definition()).collect()
    }

    /// Runs the tool identified by `name` after checking it against the
    /// policy engine; a `deny` verdict never reaches the tool's `execute`.
    pub async fn call(&self, policy: &mut ToolPolicyEngine, identity: &str, can_execute_tools: bool, name: &str, params: Value) -> ToolResult {
        let preview = params.to_string();
        let (allowed, reason) = policy.check_tool_approval(name, &preview, identity, can_execute_tools);
        if !allowed {
            return ToolResult::error(reason);
        }

        let Some(tool) = self.tools.get(name) else {
            return ToolResult::error(format!("ferramenta desconhecida: {name}"));
        };

        match tool.execute(params).await {
            Ok(result) => result,
            Err(err) => ToolResult::error(format!("falha ao executar {name}: {err}")),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tools::builtin::ExecCmdTool;

    #[tokio::test]
    async fn denied_tool_never_executes() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(ExecCmdTool));
        let mut policy = ToolPolicyEngine::new(HashMap::from([("exec_cmd".to_string(), crate::trust::policy::ToolPolicy::Deny)]));
        let result = registry.call(&mut policy, "user:1", true, "exec_cmd", serde_json::json!({"program": "echo"})).await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn unknown_tool_name_is_reported() {
        let registry = ToolRegistry::new();
        let mut policy = ToolPolicyEngine::new(HashMap::new());
        let result = registry.call(&mut policy, "user:1", true, "does_not_exist", serde_json::json!({})).await;
        assert!(result.is_error);
    }
}
