//! OpenAI-Codex OAuth backend: Server-Sent-Events over POST, consuming
//! `response.output_text.delta` and falling back to the final
//! `response.output_item.done` message if no deltas arrived. Grounded on
//! `original_source/clawlite/runtime/codex_provider.py` and
//! `original_source/clawlite/core/codex_auth.py`.

use std::path::PathBuf;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use thiserror::Error;

use crate::providers::base::{ChatRequest, LLMProvider, LLMResponse, Message};

const DEFAULT_CODEX_URL: &str = "https://chatgpt.com/backend-api/codex/responses";
const ORIGINATOR: &str = "clawlite";

#[derive(Debug, Error)]
pub enum CodexExecutionError {
    #[error("{0}")]
    Failed(String),
    #[error("resposta sem conteúdo textual do Codex OAuth")]
    EmptyResponse,
}

pub fn resolve_codex_auth_path() -> PathBuf {
    if let Ok(home) = std::env::var("CODEX_HOME") {
        if !home.trim().is_empty() {
            return PathBuf::from(home).join("auth.json");
        }
    }
    dirs::home_dir().unwrap_or_default().join(".codex").join("auth.json")
}

fn read_codex_auth_json() -> Value {
    let path = resolve_codex_auth_path();
    let Ok(raw) = std::fs::read_to_string(path) else { return json!({}) };
    serde_json::from_str(&raw).unwrap_or_else(|_| json!({}))
}

pub fn read_codex_cli_access_token() -> String {
    let raw = read_codex_auth_json();
    if let Some(token) = raw.pointer("/tokens/access_token").and_then(Value::as_str) {
        if !token.trim().is_empty() {
            return token.trim().to_string();
        }
    }
    raw.get("access_token").and_then(Value::as_str).unwrap_or_default().trim().to_string()
}

fn from_candidate(candidate: &Value) -> String {
    for key in ["account_id", "accountId", "id"] {
        if let Some(v) = candidate.get(key).and_then(Value::as_str) {
            if !v.trim().is_empty() {
                return v.trim().to_string();
            }
        }
    }
    String::new()
}

pub fn read_codex_account_id() -> String {
    let raw = read_codex_auth_json();
    let direct = from_candidate(&raw);
    if !direct.is_empty() {
        return direct;
    }
    let token_level = from_candidate(raw.get("tokens").unwrap_or(&Value::Null));
    if !token_level.is_empty() {
        return token_level;
    }
    let account_obj = from_candidate(raw.get("account").unwrap_or(&Value::Null));
    if !account_obj.is_empty() {
        return account_obj;
    }
    if let Some(accounts) = raw.get("accounts") {
        if let Some(map) = accounts.as_object() {
            for v in map.values() {
                let found = from_candidate(v);
                if !found.is_empty() {
                    return found;
                }
            }
        }
        if let Some(list) = accounts.as_array() {
            for v in list {
                let found = from_candidate(v);
                if !found.is_empty() {
                    return found;
                }
            }
        }
    }
    String::new()
}

pub fn is_codex_api_key(token: &str) -> bool {
    token.trim().starts_with("sk-")
}

pub fn resolve_codex_account_id(preferred: &str) -> String {
    if !preferred.trim().is_empty() {
        return preferred.trim().to_string();
    }
    for env_name in ["OPENAI_CODEX_ACCOUNT_ID", "CHATGPT_ACCOUNT_ID"] {
        if let Ok(v) = std::env::var(env_name) {
            if !v.trim().is_empty() {
                return v.trim().to_string();
            }
        }
    }
    read_codex_account_id()
}

pub fn strip_codex_model_prefix(model: &str) -> String {
    let value = model.trim();
    if let Some(rest) = value.strip_prefix("openai-codex/").or_else(|| value.strip_prefix("openai_codex/")) {
        return rest.to_string();
    }
    value.to_string()
}

fn friendly_error(status: u16, raw: &str) -> String {
    match status {
        429 => "Codex atingiu limite de uso/requisição temporariamente. Tente novamente em alguns minutos.".to_string(),
        401 => "Codex OAuth inválido/expirado. Refaça a autenticação 'openai-codex'.".to_string(),
        403 => "A conta atual não tem acesso ao Codex (verifique plano ChatGPT Plus/Pro).".to_string(),
        _ => format!("HTTP {status}: {raw}"),
    }
}

fn request_body(prompt: &str, model: &str) -> Value {
    json!({
        "model": strip_codex_model_prefix(model),
        "store": false,
        "stream": true,
        "instructions": "",
        "input": [{"role": "user", "content": [{"type": "input_text", "text": prompt}]}],
        "text": {"verbosity": "medium"},
        "include": ["reasoning.encrypted_content"],
        "tool_choice": "none",
    })
}

/// Parses one `data:`-prefixed SSE frame per call site; callers accumulate
/// raw lines and split on blank lines the way the original iterator does.
fn parse_sse_event(buffer: &[String]) -> Option<Value> {
    let data_lines: Vec<&str> = buffer.iter().filter_map(|l| l.strip_prefix("data:")).map(str::trim).collect();
    if data_lines.is_empty() {
        return None;
    }
    let payload = data_lines.join("\n");
    let payload = payload.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    serde_json::from_str::<Value>(payload).ok()
}

pub async fn run_codex_oauth_stream(
    prompt: &str,
    model: &str,
    access_token: &str,
    account_id: &str,
    timeout_secs: f64,
) -> Result<tokio::sync::mpsc::Receiver<Result<String, CodexExecutionError>>, CodexExecutionError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs_f64(timeout_secs.max(1.0)))
        .build()
        .map_err(|e| CodexExecutionError::Failed(e.to_string()))?;

    let resp = client
        .post(DEFAULT_CODEX_URL)
        .header("Authorization", format!("Bearer {access_token}"))
        .header("chatgpt-account-id", account_id)
        .header("OpenAI-Beta", "responses=experimental")
        .header("originator", ORIGINATOR)
        .header("accept", "text/event-stream")
        .header("content-type", "application/json")
        .json(&request_body(prompt, model))
        .send()
        .await
        .map_err(|e| CodexExecutionError::Failed(format!("falha ao chamar Codex OAuth: {e}")))?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        return Err(CodexExecutionError::Failed(friendly_error(status, &body)));
    }

    let (tx, rx) = tokio::sync::mpsc::channel(32);
    tokio::spawn(async move {
        let mut stream = resp.bytes_stream();
        let mut line_buf = String::new();
        let mut event_buf: Vec<String> = Vec::new();
        let mut saw_delta = false;
        let mut fallback_done_text = String::new();

        while let Some(chunk) = stream.next().await {
            let Ok(bytes) = chunk else { break };
            line_buf.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(idx) = line_buf.find('\n') {
                let line: String = line_buf.drain(..=idx).collect();
                let line = line.trim_end_matches(['\r', '\n']).to_string();

                if line.is_empty() {
                    if event_buf.is_empty() {
                        continue;
                    }
                    if let Some(event) = parse_sse_event(&event_buf) {
                        event_buf.clear();
                        let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();
                        if event_type == "response.output_text.delta" {
                            let delta = event.get("delta").and_then(Value::as_str).unwrap_or_default();
                            if !delta.is_empty() {
                                saw_delta = true;
                                if tx.send(Ok(delta.to_string())).await.is_err() {
                                    return;
                                }
                            }
                        } else if event_type == "response.output_item.done" {
                            if let Some(item) = event.get("item") {
                                if item.get("type").and_then(Value::as_str) == Some("message") {
                                    if let Some(parts) = item.get("content").and_then(Value::as_array) {
                                        let texts: Vec<String> = parts
                                            .iter()
                                            .filter(|p| matches!(p.get("type").and_then(Value::as_str), Some("output_text") | Some("text")))
                                            .filter_map(|p| p.get("text").and_then(Value::as_str))
                                            .map(str::trim)
                                            .filter(|s| !s.is_empty())
                                            .map(str::to_string)
                                            .collect();
                                        if !texts.is_empty() {
                                            fallback_done_text = texts.join("\n");
                                        }
                                    }
                                }
                            }
                        } else if event_type == "error" || event_type == "response.failed" {
                            let _ = tx.send(Err(CodexExecutionError::Failed("Codex retornou falha ao processar a resposta.".to_string()))).await;
                            return;
                        }
                    } else {
                        event_buf.clear();
                    }
                } else {
                    event_buf.push(line);
                }
            }
        }

        if !saw_delta && !fallback_done_text.is_empty() {
            let _ = tx.send(Ok(fallback_done_text)).await;
        }
    });

    Ok(rx)
}

pub async fn run_codex_oauth(prompt: &str, model: &str, access_token: &str, account_id: &str, timeout_secs: f64) -> Result<String, CodexExecutionError> {
    let mut rx = run_codex_oauth_stream(prompt, model, access_token, account_id, timeout_secs).await?;
    let mut text = String::new();
    while let Some(chunk) = rx.recv().await {
        text.push_str(&chunk?);
    }
    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(CodexExecutionError::EmptyResponse);
    }
    Ok(text)
}

fn flatten_prompt(messages: &[Message]) -> String {
    messages.iter().map(|m| format!("{}: {}", m.role, m.content)).collect::<Vec<_>>().join("\n\n")
}

/// Adapts the Codex OAuth SSE transport to `LLMProvider::chat`. Codex's own
/// request body pins `"tool_choice": "none"` (see `request_body` above), so
/// this, like `ollama::OllamaProvider`, never returns tool calls.
pub struct CodexOauthProvider {
    model: String,
    access_token: String,
    account_id: String,
    timeout_secs: f64,
}

impl CodexOauthProvider {
    pub fn new(model: impl Into<String>, access_token: String, account_id: String, timeout_secs: f64) -> Self {
        CodexOauthProvider { model: model.into(), access_token, account_id, timeout_secs }
    }
}

#[async_trait::async_trait]
impl LLMProvider for CodexOauthProvider {
    async fn chat(&self, req: ChatRequest<'_>) -> anyhow::Result<LLMResponse> {
        let model = req.model.unwrap_or(&self.model);
        let prompt = flatten_prompt(&req.messages);
        let output = run_codex_oauth(&prompt, model, &self.access_token, &self.account_id, self.timeout_secs).await?;
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
    fn strips_either_codex_prefix_spelling() {
        assert_eq!(strip_codex_model_prefix("openai-codex/gpt-5.3-codex"), "gpt-5.3-codex");
        assert_eq!(strip_codex_model_prefix("openai_codex/gpt-5.3-codex"), "gpt-5.3-codex");
        assert_eq!(strip_codex_model_prefix("gpt-5.3-codex"), "gpt-5.3-codex");
    }

    #[test]
    fn is_codex_api_key_checks_sk_prefix() {
        assert!(is_codex_api_key("sk-abc123"));
        assert!(!is_codex_api_key("oauth-token-xyz"));
    }

    #[test]
    fn parse_sse_event_skips_done_sentinel() {
        let buffer = vec!["data: [DONE]".to_string()];
        assert!(parse_sse_event(&buffer).is_none());
    }

    #[test]
    fn parse_sse_event_joins_multiple_data_lines() {
        let buffer = vec!["data: {\"type\":".to_string(), "data: \"response.output_text.delta\"}".to_string()];
        let event = parse_sse_event(&buffer).unwrap();
        assert_eq!(event["type"], "response.output_text.delta");
    }

    #[test]
    fn flatten_prompt_joins_role_and_content() {
        let messages = vec![Message::system("seja breve"), Message::user("oi")];
        assert_eq!(flatten_prompt(&messages), "system: seja breve\n\nuser: oi");
    }

    #[tokio::test]
    async fn chat_falls_back_to_provider_default_model_when_request_omits_one() {
        let provider = CodexOauthProvider::new("openai-codex/gpt-5.3-codex", String::new(), String::new(), 0.05);
        let result = provider.chat(ChatRequest { messages: vec![Message::user("oi")], ..Default::default() }).await;
        assert!(result.is_err());
        assert_eq!(provider.default_model(), "openai-codex/gpt-5.3-codex");
    }
}
