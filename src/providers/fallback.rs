//! `run_with_offline_fallback`: the top-level `run(prompt, cfg) -> (text,
//! meta)` entry point used outside the tool-calling Agent Loop (cron jobs,
//! heartbeat, skill installs). Control flow grounded step-for-step on
//! `original_source/clawlite/runtime/offline.py::run_with_offline_fallback`;
//! provider dispatch shape grounded on the teacher's `providers/fallback.rs`.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Config;
use crate::providers::base::{ChatRequest, LLMProvider, LLMResponse};
use crate::providers::ollama::{self, OllamaExecutionError, OllamaProvider};

const CONNECTIVITY_PROBE: (&str, u16) = ("1.1.1.1", 53);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum ProviderMeta {
    Online { model: String, reason: String },
    OfflineFallback { model: String, reason: String, error: Option<String> },
    Ollama { model: String, reason: String },
    Error { error: String, error_type: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderExecutionError {
    #[error("{0}")]
    Message(String),
}

/// Executes a remote `provider/model` chat completion for a single prompt.
/// Implemented by the caller (wires to `OpenAiStyleProvider`/`AnthropicProvider`/codex).
#[async_trait::async_trait]
pub trait OnlineExecutor: Send + Sync {
    async fn run(&self, prompt: &str, model: &str, token: &str) -> Result<String, ProviderExecutionError>;
}

pub async fn check_connectivity(timeout_secs: f64) -> bool {
    let addrs: Vec<_> = match (CONNECTIVITY_PROBE.0, CONNECTIVITY_PROBE.1).to_socket_addrs() {
        Ok(a) => a.collect(),
        Err(_) => return false,
    };
    let Some(addr) = addrs.into_iter().next() else { return false };
    tokio::time::timeout(Duration::from_secs_f64(timeout_secs.max(0.01)), tokio::net::TcpStream::connect(addr)).await.map(|r| r.is_ok()).unwrap_or(false)
}

fn provider_token(cfg: &Config, provider: &str) -> String {
    let env_name = match provider {
        "openai" => Some("OPENAI_API_KEY"),
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        _ => None,
    };
    if let Some(name) = env_name {
        if let Ok(v) = std::env::var(name) {
            if !v.trim().is_empty() {
                return v.trim().to_string();
            }
        }
    }
    cfg.auth.providers.get(provider).map(|p| p.token.clone()).unwrap_or_default()
}

fn resolve_ollama_fallback(cfg: &Config) -> String {
    for candidate in &cfg.model_fallback {
        if ollama::is_ollama_model(candidate) {
            return candidate.clone();
        }
    }
    format!("ollama/{}", if cfg.ollama.model.trim().is_empty() { ollama::DEFAULT_OLLAMA_MODEL } else { &cfg.ollama.model })
}

fn resolve_online_fallbacks(cfg: &Config, excluded_model: &str) -> Vec<String> {
    cfg.model_fallback.iter().filter(|m| !m.trim().is_empty() && !ollama::is_ollama_model(m) && m.as_str() != excluded_model).cloned().collect()
}

async fn run_ollama_fallback(prompt: &str, cfg: &Config, reason: &str) -> Result<(String, ProviderMeta), ProviderExecutionError> {
    let fallback = resolve_ollama_fallback(cfg);
    let fallback_name = ollama::extract_ollama_model(&fallback, ollama::DEFAULT_OLLAMA_MODEL);
    let output = ollama::run_ollama(prompt, &fallback_name, cfg.ollama.timeout_secs).await.map_err(ollama_error)?;
    Ok((output, ProviderMeta::OfflineFallback { model: format!("ollama/{fallback_name}"), reason: reason.to_string(), error: None }))
}

fn ollama_error(e: OllamaExecutionError) -> ProviderExecutionError {
    ProviderExecutionError::Message(e.to_string())
}

/// Step-for-step port of `run_with_offline_fallback`.
pub async fn run_with_offline_fallback(prompt: &str, cfg: &Config, online: &dyn OnlineExecutor) -> Result<(String, ProviderMeta), ProviderExecutionError> {
    let model = if cfg.model.trim().is_empty() { "openai/gpt-4o-mini".to_string() } else { cfg.model.clone() };
    let provider = ollama::provider_from_model(&model);

    if ollama::is_ollama_model(&model) {
        let chosen = ollama::extract_ollama_model(&model, ollama::DEFAULT_OLLAMA_MODEL);
        let output = ollama::run_ollama(prompt, &chosen, cfg.ollama.timeout_secs).await.map_err(ollama_error)?;
        return Ok((output, ProviderMeta::Ollama { model: format!("ollama/{chosen}"), reason: "explicit".to_string() }));
    }

    let token = provider_token(cfg, &provider);
    if !cfg.offline_mode.enabled {
        let output = online.run(prompt, &model, &token).await?;
        return Ok((output, ProviderMeta::Online { model, reason: "offline-disabled".to_string() }));
    }

    if !check_connectivity(cfg.offline_mode.connectivity_timeout_sec).await {
        if cfg.offline_mode.auto_fallback_to_ollama {
            return run_ollama_fallback(prompt, cfg, "connectivity").await;
        }
        return Err(ProviderExecutionError::Message("sem conectividade e fallback offline desativado".to_string()));
    }

    match online.run(prompt, &model, &token).await {
        Ok(output) => Ok((output, ProviderMeta::Online { model, reason: "provider-ok".to_string() })),
        Err(original_err) => {
            for fb_model in resolve_online_fallbacks(cfg, &model) {
                let fb_provider = ollama::provider_from_model(&fb_model);
                let fb_token = provider_token(cfg, &fb_provider);
                if fb_token.is_empty() {
                    continue;
                }
                if let Ok(output) = online.run(prompt, &fb_model, &fb_token).await {
                    return Ok((output, ProviderMeta::Online { model: fb_model, reason: "online-fallback".to_string() }));
                }
            }

            if cfg.offline_mode.auto_fallback_to_ollama {
                let (output, meta) = run_ollama_fallback(prompt, cfg, "provider_failure").await?;
                let meta = match meta {
                    ProviderMeta::OfflineFallback { model, reason, .. } => ProviderMeta::OfflineFallback { model, reason, error: Some(original_err.to_string()) },
                    other => other,
                };
                return Ok((output, meta));
            }
            Err(original_err)
        }
    }
}

fn clone_with_model<'a>(req: &ChatRequest<'a>, model: &'a str) -> ChatRequest<'a> {
    ChatRequest { messages: req.messages.clone(), tools: req.tools.clone(), model: Some(model), max_tokens: req.max_tokens, temperature: req.temperature, tool_choice: req.tool_choice.clone() }
}

/// `LLMProvider`-shaped counterpart to `run_with_offline_fallback`: same
/// decision logic (explicit-ollama short circuit, offline-mode check,
/// connectivity probe, `model_fallback[]` traversal, final ollama
/// fallback), but carrying a full `ChatRequest` — messages, tool
/// definitions, tool choice — through every hop instead of a single
/// flattened prompt string, since this wraps the provider the
/// tool-calling Agent Loop talks to. Built from `build_chat_provider` so
/// the circuit breaker around Codex/Gemini and the ollama/codex adapters
/// all apply consistently across the primary model and its fallbacks.
pub struct ChatFallbackProvider {
    cfg: Arc<Config>,
    primary_model: String,
    primary: Arc<dyn LLMProvider>,
}

impl ChatFallbackProvider {
    pub fn new(cfg: Arc<Config>, primary_model: String, primary: Arc<dyn LLMProvider>) -> Self {
        ChatFallbackProvider { cfg, primary_model, primary }
    }

    async fn ollama_fallback_chat(&self, req: &ChatRequest<'_>, reason: &str) -> anyhow::Result<LLMResponse> {
        let fallback_model = resolve_ollama_fallback(&self.cfg);
        let ollama_model = ollama::extract_ollama_model(&fallback_model, ollama::DEFAULT_OLLAMA_MODEL);
        warn!(reason, model = %ollama_model, "usando fallback ollama");
        let provider = OllamaProvider::new(ollama_model.clone(), self.cfg.ollama.timeout_secs);
        provider.chat(clone_with_model(req, &format!("ollama/{ollama_model}"))).await
    }
}

#[async_trait::async_trait]
impl LLMProvider for ChatFallbackProvider {
    async fn chat(&self, req: ChatRequest<'_>) -> anyhow::Result<LLMResponse> {
        if ollama::is_ollama_model(&self.primary_model) {
            return self.primary.chat_with_retry(req, None).await;
        }

        if !self.cfg.offline_mode.enabled {
            return self.primary.chat_with_retry(req, None).await;
        }

        if !check_connectivity(self.cfg.offline_mode.connectivity_timeout_sec).await {
            if self.cfg.offline_mode.auto_fallback_to_ollama {
                return self.ollama_fallback_chat(&req, "connectivity").await;
            }
            anyhow::bail!("sem conectividade e fallback offline desativado");
        }

        match self.primary.chat_with_retry(req.clone(), None).await {
            Ok(response) => Ok(response),
            Err(primary_err) => {
                for fb_model in resolve_online_fallbacks(&self.cfg, &self.primary_model) {
                    let fb_provider_key = ollama::provider_from_model(&fb_model);
                    let token = provider_token(&self.cfg, &fb_provider_key);
                    if token.is_empty() {
                        continue;
                    }
                    let Some(provider) = crate::providers::build_chat_provider(&fb_provider_key, token, fb_model.clone()) else { continue };
                    match provider.chat_with_retry(clone_with_model(&req, &fb_model), None).await {
                        Ok(response) => return Ok(response),
                        Err(err) => warn!(model = %fb_model, error = %err, "fallback online falhou"),
                    }
                }

                if self.cfg.offline_mode.auto_fallback_to_ollama {
                    return self.ollama_fallback_chat(&req, "provider_failure").await;
                }
                Err(primary_err)
            }
        }
    }

    fn default_model(&self) -> &str {
        &self.primary_model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysOk;
    #[async_trait::async_trait]
    impl OnlineExecutor for AlwaysOk {
        async fn run(&self, _prompt: &str, model: &str, _token: &str) -> Result<String, ProviderExecutionError> {
            Ok(format!("ok from {model}"))
        }
    }

    struct AlwaysFail;
    #[async_trait::async_trait]
    impl OnlineExecutor for AlwaysFail {
        async fn run(&self, _prompt: &str, _model: &str, _token: &str) -> Result<String, ProviderExecutionError> {
            Err(ProviderExecutionError::Message("falha simulada de provedor".to_string()))
        }
    }

    #[tokio::test]
    async fn explicit_ollama_model_skips_connectivity_check() {
        let mut cfg = Config::default();
        cfg.model = "ollama/doesnotexist".to_string();
        let result = run_with_offline_fallback("hi", &cfg, &AlwaysOk).await;
        assert!(matches!(result, Err(_)));
    }

    #[tokio::test]
    async fn offline_mode_disabled_calls_online_once() {
        let mut cfg = Config::default();
        cfg.model = "openai/gpt-4o-mini".to_string();
        cfg.offline_mode.enabled = false;
        let (text, meta) = run_with_offline_fallback("hi", &cfg, &AlwaysOk).await.unwrap();
        assert_eq!(text, "ok from openai/gpt-4o-mini");
        assert!(matches!(meta, ProviderMeta::Online { reason, .. } if reason == "offline-disabled"));
    }

    #[tokio::test]
    async fn provider_failure_without_fallback_configured_propagates() {
        let mut cfg = Config::default();
        cfg.model = "openai/gpt-4o-mini".to_string();
        cfg.offline_mode.auto_fallback_to_ollama = false;
        cfg.offline_mode.connectivity_timeout_sec = 0.05;
        let result = run_with_offline_fallback("hi", &cfg, &AlwaysFail).await;
        assert!(result.is_err());
    }
}
