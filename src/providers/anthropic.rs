//! `anthropic`-style messages provider. Grounded on the teacher's
//! `providers/anthropic.rs`; the `content[*].text` concatenation rule is
//! grounded on `original_source/clawlite/runtime/offline.py::_extract_anthropic_content`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::providers::base::{ChatRequest, LLMProvider, LLMResponse, ProviderMetrics, ToolCallRequest};
use crate::providers::errors::ProviderErrorHandler;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const CONNECT_TIMEOUT_SECS: u64 = 30;
const REQUEST_TIMEOUT_SECS: u64 = 120;
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    api_key: String,
    default_model: String,
    base_url: String,
    client: Client,
    metrics: Arc<Mutex<ProviderMetrics>>,
}

impl AnthropicProvider {
    pub fn new(api_key: String, default_model: Option<String>) -> Self {
        Self {
            api_key,
            default_model: default_model.unwrap_or_else(|| "claude-haiku-4-5-20251001".to_string()),
            base_url: API_URL.to_string(),
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
            metrics: Arc::new(Mutex::new(ProviderMetrics::default())),
        }
    }

    #[cfg(test)]
    fn with_base_url(api_key: String, default_model: Option<String>, base_url: String) -> Self {
        let mut provider = Self::new(api_key, default_model);
        provider.base_url = base_url;
        provider
    }

    fn convert_messages(messages: &[crate::providers::base::Message]) -> (Option<String>, Vec<Value>) {
        let mut system = None;
        let mut out = Vec::new();
        for msg in messages {
            if msg.role == "system" {
                system = Some(msg.content.clone());
                continue;
            }
            if msg.role == "tool" {
                out.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                        "content": msg.content,
                        "is_error": msg.is_error,
                    }],
                }));
                continue;
            }
            if let Some(tool_calls) = &msg.tool_calls {
                let mut content = Vec::new();
                if !msg.content.is_empty() {
                    content.push(json!({ "type": "text", "text": msg.content }));
                }
                for tc in tool_calls {
                    content.push(json!({ "type": "tool_use", "id": tc.id, "name": tc.name, "input": tc.arguments }));
                }
                out.push(json!({ "role": "assistant", "content": content }));
                continue;
            }
            out.push(json!({ "role": msg.role, "content": msg.content }));
        }
        (system, out)
    }

    fn parse_response(&self, body: Value) -> Result<LLMResponse> {
        let content = body["content"].as_array().context("resposta inválida do provedor remoto (content ausente)")?;

        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();
        for item in content {
            match item.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = item.get("text").and_then(Value::as_str) {
                        if !text.trim().is_empty() {
                            text_parts.push(text.trim().to_string());
                        }
                    }
                }
                Some("tool_use") => {
                    tool_calls.push(ToolCallRequest {
                        id: item["id"].as_str().unwrap_or_default().to_string(),
                        name: item["name"].as_str().unwrap_or_default().to_string(),
                        arguments: item.get("input").cloned().unwrap_or_else(|| json!({})),
                    });
                }
                _ => {}
            }
        }

        if text_parts.is_empty() && tool_calls.is_empty() {
            anyhow::bail!("resposta sem conteúdo textual do provedor remoto");
        }

        let usage = body.get("usage");
        Ok(LLMResponse {
            content: if text_parts.is_empty() { None } else { Some(text_parts.join("\n")) },
            tool_calls,
            reasoning_content: None,
            input_tokens: usage.and_then(|u| u.get("input_tokens")).and_then(Value::as_u64),
            output_tokens: usage.and_then(|u| u.get("output_tokens")).and_then(Value::as_u64),
        })
    }
}

#[async_trait]
impl LLMProvider for AnthropicProvider {
    async fn chat(&self, req: ChatRequest<'_>) -> Result<LLMResponse> {
        let (system, messages) = Self::convert_messages(&req.messages);

        let mut payload = json!({
            "model": req.model.unwrap_or(&self.default_model),
            "messages": messages,
            "max_tokens": req.max_tokens.max(1),
        });
        if let Some(system) = system {
            payload["system"] = json!(system);
        }
        if let Some(tools) = &req.tools {
            payload["tools"] = json!(tools
                .iter()
                .map(|t| json!({ "name": t.name, "description": t.description, "input_schema": t.parameters }))
                .collect::<Vec<_>>());
        }

        let resp = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .context("falha ao chamar provedor remoto 'anthropic'")?;

        let body = ProviderErrorHandler::check_response(resp, "anthropic", &self.metrics).await?;

        if let Ok(mut m) = self.metrics.lock() {
            m.request_count += 1;
        }

        self.parse_response(body)
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::base::Message;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn concatenates_text_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": "olá"}, {"type": "text", "text": "mundo"}],
                "usage": {"input_tokens": 3, "output_tokens": 4}
            })))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::with_base_url("k".into(), None, server.uri());
        let req = ChatRequest { messages: vec![Message::user("oi")], max_tokens: 256, ..Default::default() };
        let result = provider.chat(req).await.unwrap();
        assert_eq!(result.content.unwrap(), "olá\nmundo");
    }

    #[tokio::test]
    async fn parses_tool_use_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "tool_use", "id": "t1", "name": "weather", "input": {"city": "sp"}}]
            })))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::with_base_url("k".into(), None, server.uri());
        let req = ChatRequest { messages: vec![Message::user("clima?")], max_tokens: 256, ..Default::default() };
        let result = provider.chat(req).await.unwrap();
        assert_eq!(result.tool_calls[0].name, "weather");
    }
}
