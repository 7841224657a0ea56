//! Local `ollama` execution: shells out to the `ollama` binary with a
//! scrubbed environment. Grounded on
//! `original_source/clawlite/runtime/offline.py::run_ollama`.

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;

use crate::providers::base::{ChatRequest, LLMProvider, LLMResponse, Message};

pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.1:8b";
const DEFAULT_TIMEOUT_SECS: u64 = 90;

#[derive(Debug, Error)]
pub enum OllamaExecutionError {
    #[error("binário 'ollama' não encontrado")]
    BinaryNotFound,
    #[error("ollama timeout após {0}s")]
    Timeout(u64),
    #[error("{0}")]
    Failed(String),
}

/// `value.split('/', 1)` semantics: anything before the first `/` is the
/// provider key, lowercased.
pub fn provider_from_model(model: &str) -> String {
    let value = model.trim();
    match value.split_once('/') {
        Some((provider, _)) => provider.to_lowercase(),
        None => value.to_lowercase(),
    }
}

pub fn is_ollama_model(model: &str) -> bool {
    provider_from_model(model) == "ollama"
}

pub fn extract_ollama_model(model: &str, fallback_model: &str) -> String {
    let value = model.trim();
    if is_ollama_model(value) {
        if let Some((_, name)) = value.split_once('/') {
            let name = name.trim();
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    fallback_model.to_string()
}

pub async fn run_ollama(prompt: &str, model: &str, timeout_secs: u64) -> Result<String, OllamaExecutionError> {
    let mut cmd = crate::utils::subprocess::scrubbed_tokio_command("ollama", &["run".to_string(), model.to_string(), prompt.to_string()]);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let timeout = Duration::from_secs(if timeout_secs == 0 { DEFAULT_TIMEOUT_SECS } else { timeout_secs });
    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => return Err(OllamaExecutionError::BinaryNotFound),
        Ok(Err(e)) => return Err(OllamaExecutionError::Failed(e.to_string())),
        Err(_) => return Err(OllamaExecutionError::Timeout(timeout.as_secs())),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let message = if !stderr.trim().is_empty() { stderr.trim() } else if !stdout.trim().is_empty() { stdout.trim() } else { "erro ao executar ollama" };
        return Err(OllamaExecutionError::Failed(message.to_string()));
    }

    let out = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok(if out.is_empty() { "(ollama sem saída)".to_string() } else { out })
}

fn flatten_prompt(messages: &[Message]) -> String {
    messages.iter().map(|m| format!("{}: {}", m.role, m.content)).collect::<Vec<_>>().join("\n\n")
}

/// Adapts `run_ollama`'s single-prompt CLI shell-out to `LLMProvider::chat`,
/// so the local-model path is a first-class, pluggable provider like any
/// remote one. No tool-calling support — the CLI transport has none, so
/// `chat` always returns an empty `tool_calls` list.
pub struct OllamaProvider {
    model: String,
    timeout_secs: u64,
}

impl OllamaProvider {
    pub fn new(model: impl Into<String>, timeout_secs: u64) -> Self {
        OllamaProvider { model: model.into(), timeout_secs }
    }
}

#[async_trait::async_trait]
impl LLMProvider for OllamaProvider {
    async fn chat(&self, req: ChatRequest<'_>) -> anyhow::Result<LLMResponse> {
        let model = req.model.map(|m| extract_ollama_model(m, &self.model)).unwrap_or_else(|| self.model.clone());
        let prompt = flatten_prompt(&req.messages);
        let output = run_ollama(&prompt, &model, self.timeout_secs).await?;
        Ok(LLMResponse { content: Some(output), ..Default::default() })
    }

    fn default_model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_from_model_splits_on_slash() {
        assert_eq!(provider_from_model("ollama/llama3.1:8b"), "ollama");
        assert_eq!(provider_from_model("OpenAI/gpt-4o"), "openai");
        assert_eq!(provider_from_model("bare-model"), "bare-model");
    }

    #[test]
    fn extract_ollama_model_falls_back_for_non_ollama() {
        assert_eq!(extract_ollama_model("openai/gpt-4o", DEFAULT_OLLAMA_MODEL), DEFAULT_OLLAMA_MODEL);
        assert_eq!(extract_ollama_model("ollama/mistral", DEFAULT_OLLAMA_MODEL), "mistral");
    }

    #[test]
    fn flatten_prompt_joins_role_and_content() {
        let messages = vec![Message::system("seja breve"), Message::user("oi")];
        assert_eq!(flatten_prompt(&messages), "system: seja breve\n\nuser: oi");
    }

    #[tokio::test]
    async fn chat_reports_missing_binary_through_llm_provider_trait() {
        let original_path = std::env::var("PATH").unwrap_or_default();
        unsafe { std::env::set_var("PATH", "/nonexistent"); }
        let provider = OllamaProvider::new("llama3.1:8b", 2);
        let result = provider.chat(ChatRequest { messages: vec![Message::user("oi")], ..Default::default() }).await;
        unsafe { std::env::set_var("PATH", original_path); }
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn missing_binary_reports_not_found() {
        let original_path = std::env::var("PATH").unwrap_or_default();
        unsafe { std::env::set_var("PATH", "/nonexistent"); }
        let result = run_ollama("hi", "llama3.1:8b", 2).await;
        unsafe { std::env::set_var("PATH", original_path); }
        assert!(matches!(result, Err(OllamaExecutionError::BinaryNotFound)));
    }
}
