//! The Agent Loop: `spec.md` §4.4. Grounded on the teacher's
//! `agent/loop/mod.rs` for the tool-calling shape (append assistant +
//! tool-result messages, cap iterations), reworked around this crate's
//! `ToolRegistry`/`SessionStore`/`MemoryStore`/`ToolPolicyEngine` and the
//! provider meta contract `spec.md` requires verbatim.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::agent::compaction::MessageCompactor;
use crate::agent::context::{self, ContextBundle};
use crate::agent::tools::ToolRegistry;
use crate::agent::workspace::{SkillSummary, Workspace};
use crate::errors::ClawLiteError;
use crate::memory::{ConsolidatedTurn, MemoryStore};
use crate::providers::base::{ChatRequest, LLMProvider, Message, ToolCallRequest};
use crate::providers::catalog;
use crate::session::SessionStore;
use crate::trust::policy::ToolPolicyEngine;

const DEFAULT_MAX_ITERATIONS: usize = 40;

pub struct AgentRequest {
    pub prompt: String,
    pub session_id: String,
    pub skill: Option<String>,
    pub identity: String,
    pub can_execute_tools: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentMeta {
    pub mode: String,
    pub reason: String,
    pub model: String,
    pub requested_model: String,
    pub model_provider: String,
    pub model_display_name: String,
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub tokens: u64,
    pub estimated_cost_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl AgentMeta {
    fn normalize(model_key: &str, requested_model: &str, prompt_tokens: u64, completion_tokens: u64, mode: &str, reason: &str) -> Self {
        let entry = catalog::get_model_or_default(model_key);
        AgentMeta {
            mode: mode.to_string(),
            reason: reason.to_string(),
            model: model_key.to_string(),
            requested_model: requested_model.to_string(),
            model_provider: entry.provider.clone(),
            model_display_name: entry.display_name.clone(),
            context_window: entry.context_window,
            max_output_tokens: entry.max_output_tokens,
            prompt_tokens,
            completion_tokens,
            tokens: prompt_tokens + completion_tokens,
            estimated_cost_usd: catalog::estimate_cost_usd(model_key, prompt_tokens, completion_tokens),
            error: None,
            error_type: None,
        }
    }
}

pub struct AgentLoop {
    workspace: Workspace,
    sessions: Arc<SessionStore>,
    memory: Arc<MemoryStore>,
    tools: Arc<ToolRegistry>,
    provider: Arc<dyn LLMProvider>,
    policy: Mutex<ToolPolicyEngine>,
    model: String,
    max_iterations: usize,
}

impl AgentLoop {
    pub fn new(workspace: Workspace, sessions: Arc<SessionStore>, memory: Arc<MemoryStore>, tools: Arc<ToolRegistry>, provider: Arc<dyn LLMProvider>, policy: ToolPolicyEngine, model: impl Into<String>) -> Self {
        AgentLoop { workspace, sessions, memory, tools, provider, policy: Mutex::new(policy), model: model.into(), max_iterations: DEFAULT_MAX_ITERATIONS }
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }

    fn installed_skills(&self) -> Vec<SkillSummary> {
        // No marketplace-skill wiring at this layer yet; callers that need
        // the active-skills block populated pass it through a future
        // extension point. Empty for now keeps the prompt well-formed.
        Vec::new()
    }

    pub async fn run(&self, req: AgentRequest) -> Result<(String, AgentMeta), ClawLiteError> {
        let ContextBundle { system_prompt, mut history, memory_snippets } = context::build_context(&self.workspace, &self.sessions, &self.memory, &req.session_id, &req.prompt, &self.installed_skills());

        if context::over_budget(&history, catalog::context_window(&self.model)) {
            let compactor = MessageCompactor::new(self.provider.clone(), Some(self.model.clone()));
            history = compactor.compact(&history).await.map_err(ClawLiteError::Internal)?;
        }

        let mut messages = Vec::new();
        if !system_prompt.is_empty() {
            messages.push(Message::system(system_prompt));
        }
        if !memory_snippets.is_empty() {
            let rendered = memory_snippets.iter().map(|s| format!("- {s}")).collect::<Vec<_>>().join("\n");
            messages.push(Message::system(format!("[Memory]\n{rendered}")));
        }
        messages.extend(history);
        messages.push(Message::user(req.prompt.clone()));

        let tool_defs = self.tools.definitions();
        let mut prompt_tokens = 0u64;
        let mut completion_tokens = 0u64;
        let mut final_text = String::new();
        let mut exhausted = false;

        for _ in 0..self.max_iterations {
            let response = self
                .provider
                .chat_with_retry(ChatRequest { messages: messages.clone(), tools: Some(tool_defs.clone()), model: Some(&self.model), max_tokens: 4096, temperature: 0.7, tool_choice: None }, None)
                .await
                .map_err(ClawLiteError::Internal)?;

            prompt_tokens += response.input_tokens.unwrap_or(0);
            completion_tokens += response.output_tokens.unwrap_or(0);

            if !response.has_tool_calls() {
                final_text = response.content.unwrap_or_default();
                break;
            }

            messages.push(Message::assistant(response.content.clone().unwrap_or_default(), Some(response.tool_calls.clone())));

            for call in &response.tool_calls {
                let result = self.run_tool(&req, call).await;
                messages.push(Message::tool_result(call.id.clone(), result.content, result.is_error));
            }
            final_text = String::new();
            exhausted = true;
        }

        if exhausted && final_text.is_empty() {
            final_text = "Atingi o limite de iterações de ferramentas para esta tarefa.".to_string();
        }

        self.sessions.append(&req.session_id, "user", &req.prompt, None).map_err(|err| ClawLiteError::Internal(err.into()))?;
        self.sessions.append(&req.session_id, "assistant", &final_text, None).map_err(|err| ClawLiteError::Internal(err.into()))?;
        self.memory.consolidate(ConsolidatedTurn { session_id: &req.session_id, user_text: &req.prompt, assistant_text: &final_text }).map_err(|err| ClawLiteError::Internal(err.into()))?;

        let meta = AgentMeta::normalize(&self.model, &self.model, prompt_tokens, completion_tokens, "online", "tool-loop");
        Ok((final_text, meta))
    }

    async fn run_tool(&self, req: &AgentRequest, call: &ToolCallRequest) -> crate::agent::tools::base::ToolResult {
        let mut policy = self.policy.lock().await;
        self.tools.call(&mut policy, &req.identity, req.can_execute_tools, &call.name, call.arguments.clone()).await
    }

    /// `run_task_with_timeout`: bounded-executor variant of `run`, returning
    /// a deterministic timeout meta if the wall clock is exceeded.
    pub async fn run_with_timeout(&self, req: AgentRequest, timeout_s: f64) -> (String, AgentMeta) {
        match tokio::time::timeout(Duration::from_secs_f64(timeout_s.max(0.0)), self.run(req)).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                let mut meta = AgentMeta::normalize(&self.model, &self.model, 0, 0, "error", "provider_error");
                meta.error = Some(err.user_message());
                meta.error_type = Some(err.code().to_string());
                (String::new(), meta)
            }
            Err(_) => {
                let mut meta = AgentMeta::normalize(&self.model, &self.model, 0, 0, "error", "timeout");
                meta.error = Some("tempo limite excedido".to_string());
                meta.error_type = Some("timeout".to_string());
                (String::new(), meta)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::base::LLMResponse;
    use async_trait::async_trait;

    struct StaticProvider {
        reply: String,
    }

    #[async_trait]
    impl LLMProvider for StaticProvider {
        async fn chat(&self, _req: ChatRequest<'_>) -> anyhow::Result<LLMResponse> {
            Ok(LLMResponse { content: Some(self.reply.clone()), input_tokens: Some(10), output_tokens: Some(5), ..Default::default() })
        }
        fn default_model(&self) -> &str {
            "test-model"
        }
    }

    fn build_loop(dir: &std::path::Path, reply: &str) -> AgentLoop {
        let workspace = Workspace::new(dir.join("workspace"));
        let sessions = Arc::new(SessionStore::new(dir).unwrap());
        let memory = Arc::new(MemoryStore::new(dir).unwrap());
        let tools = Arc::new(ToolRegistry::new());
        let provider: Arc<dyn LLMProvider> = Arc::new(StaticProvider { reply: reply.to_string() });
        let policy = ToolPolicyEngine::new(HashMap::new());
        AgentLoop::new(workspace, sessions, memory, tools, provider, policy, "openai/gpt-4o-mini")
    }

    #[tokio::test]
    async fn plain_reply_persists_to_session_and_memory() {
        let dir = tempfile::tempdir().unwrap();
        let agent = build_loop(dir.path(), "olá!");
        let req = AgentRequest { prompt: "oi".to_string(), session_id: "s1".to_string(), skill: None, identity: "user:1".to_string(), can_execute_tools: true };
        let (text, meta) = agent.run(req).await.unwrap();
        assert_eq!(text, "olá!");
        assert_eq!(meta.mode, "online");
        assert!(meta.tokens > 0);

        let turns = agent.sessions.read("s1", 10).unwrap();
        assert_eq!(turns.len(), 2);
    }

    #[tokio::test]
    async fn timeout_path_returns_deterministic_meta() {
        struct SlowProvider;
        #[async_trait]
        impl LLMProvider for SlowProvider {
            async fn chat(&self, _req: ChatRequest<'_>) -> anyhow::Result<LLMResponse> {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(LLMResponse { content: Some("tarde demais".to_string()), ..Default::default() })
            }
            fn default_model(&self) -> &str {
                "test-model"
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(dir.path().join("workspace"));
        let sessions = Arc::new(SessionStore::new(dir.path()).unwrap());
        let memory = Arc::new(MemoryStore::new(dir.path()).unwrap());
        let tools = Arc::new(ToolRegistry::new());
        let provider: Arc<dyn LLMProvider> = Arc::new(SlowProvider);
        let policy = ToolPolicyEngine::new(HashMap::new());
        let agent = AgentLoop::new(workspace, sessions, memory, tools, provider, policy, "openai/gpt-4o-mini");

        let req = AgentRequest { prompt: "oi".to_string(), session_id: "s2".to_string(), skill: None, identity: "user:1".to_string(), can_execute_tools: true };
        let (text, meta) = agent.run_with_timeout(req, 0.01).await;
        assert!(text.is_empty());
        assert_eq!(meta.error_type.as_deref(), Some("timeout"));
    }
}
