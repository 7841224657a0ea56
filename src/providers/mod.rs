pub mod anthropic;
pub mod base;
pub mod catalog;
pub mod circuit_breaker;
pub mod codex_oauth;
pub mod errors;
pub mod fallback;
pub mod ollama;
pub mod openai;

pub use base::{ChatRequest, LLMProvider, LLMResponse, Message, ToolCallRequest, ToolDefinition};
pub use catalog::{context_window, estimate_cost_usd, estimate_tokens, get_model_or_default, normalize_provider, provider_spec, ApiStyle, ProviderSpec};
pub use fallback::{run_with_offline_fallback, ChatFallbackProvider, OnlineExecutor, ProviderExecutionError, ProviderMeta};

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;

pub(crate) const PROVIDER_CONNECT_TIMEOUT_SECS: u64 = 30;
pub(crate) const PROVIDER_REQUEST_TIMEOUT_SECS: u64 = 120;

pub(crate) fn provider_http_client() -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(PROVIDER_CONNECT_TIMEOUT_SECS))
        .timeout(Duration::from_secs(PROVIDER_REQUEST_TIMEOUT_SECS))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Rate-limited providers the circuit breaker wraps around, per
/// `LLMProvider::chat_with_retry`'s own doc comment ("used for rate-limited
/// providers (Codex, Gemini)").
const CIRCUIT_BROKEN_PROVIDERS: &[&str] = &["openai-codex", "gemini"];

/// Builds the `LLMProvider` for a `provider/model` key's chat-completion
/// style, used by the Agent Loop's tool-calling path. `ollama` (`ApiStyle::
/// Local`) shells out through `ollama::OllamaProvider`; `openai-codex`
/// dispatches through `codex_oauth::CodexOauthProvider`, which resolves its
/// OAuth access token from `api_key` (env/config) and falls back to the
/// Codex CLI's own `auth.json` when that's empty. Neither transport
/// supports tool calls, so both adapters always return an empty
/// `tool_calls` list. Codex and Gemini additionally get wrapped in
/// `circuit_breaker::CircuitBreakerProvider` since they're the catalog's
/// rate-limited providers.
pub fn build_chat_provider(provider_key: &str, api_key: String, default_model: String) -> Option<Arc<dyn LLMProvider>> {
    let normalized = normalize_provider(provider_key);
    let spec = provider_spec(&normalized)?;
    let provider: Arc<dyn LLMProvider> = match spec.api_style {
        ApiStyle::Anthropic => Arc::new(anthropic::AnthropicProvider::new(api_key, Some(default_model))),
        ApiStyle::Openai if normalized == "openai-codex" => {
            let access_token = if api_key.trim().is_empty() { codex_oauth::read_codex_cli_access_token() } else { api_key };
            let account_id = codex_oauth::resolve_codex_account_id("");
            Arc::new(codex_oauth::CodexOauthProvider::new(default_model, access_token, account_id, PROVIDER_REQUEST_TIMEOUT_SECS as f64))
        }
        ApiStyle::Openai => Arc::new(openai::OpenAiStyleProvider::new(normalized.clone(), api_key, default_model, spec.request_url.to_string())),
        ApiStyle::Local => Arc::new(ollama::OllamaProvider::new(default_model, PROVIDER_REQUEST_TIMEOUT_SECS)),
    };
    if CIRCUIT_BROKEN_PROVIDERS.contains(&normalized.as_str()) {
        Some(circuit_breaker::CircuitBreakerProvider::wrap(provider, circuit_breaker::BreakerConfig::default()))
    } else {
        Some(provider)
    }
}
