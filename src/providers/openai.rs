//! `openai`-style chat-completions provider: covers OpenAI itself plus every
//! OpenAI-compatible backend in the catalog (Gemini's OpenAI shim, Groq,
//! OpenRouter, Moonshot, Mistral, xAI, Together, Hugging Face, NVIDIA, zai).
//! Request/response shape grounded on the teacher's `providers/openai.rs`;
//! the `choices[0].message.content` string-or-parts extraction is grounded
//! on `original_source/clawlite/runtime/offline.py::_extract_chat_content`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::providers::base::{ChatRequest, LLMProvider, LLMResponse, ProviderMetrics, ToolCallRequest};
use crate::providers::errors::ProviderErrorHandler;

const CONNECT_TIMEOUT_SECS: u64 = 30;
const REQUEST_TIMEOUT_SECS: u64 = 120;

pub struct OpenAiStyleProvider {
    provider_name: String,
    api_key: String,
    default_model: String,
    url: String,
    client: Client,
    metrics: Arc<Mutex<ProviderMetrics>>,
}

impl OpenAiStyleProvider {
    pub fn new(provider_name: impl Into<String>, api_key: String, default_model: String, url: String) -> Self {
        Self {
            provider_name: provider_name.into(),
            api_key,
            default_model,
            url,
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
            metrics: Arc::new(Mutex::new(ProviderMetrics::default())),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(api_key: String, default_model: String, url: String) -> Self {
        Self::new("openai", api_key, default_model, url)
    }

    fn parse_response(&self, body: Value) -> Result<LLMResponse> {
        let choice = body["choices"].as_array().and_then(|a| a.first()).context("resposta inválida do provedor remoto (choices ausente)")?;
        let message = &choice["message"];

        let content = match &message["content"] {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Array(parts) => {
                let joined: Vec<String> = parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(Value::as_str))
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                if joined.is_empty() { None } else { Some(joined.join("\n")) }
            }
            _ => None,
        };

        let mut tool_calls = Vec::new();
        if let Some(arr) = message["tool_calls"].as_array() {
            for tc in arr {
                if let Some(function) = tc["function"].as_object() {
                    let arguments = function.get("arguments").and_then(Value::as_str).and_then(|s| serde_json::from_str(s).ok()).unwrap_or_else(|| json!({}));
                    tool_calls.push(ToolCallRequest {
                        id: tc["id"].as_str().unwrap_or_default().to_string(),
                        name: function.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                        arguments,
                    });
                }
            }
        }

        if content.is_none() && tool_calls.is_empty() {
            anyhow::bail!("resposta sem conteúdo textual do provedor remoto");
        }

        let usage = body.get("usage");
        Ok(LLMResponse {
            content,
            tool_calls,
            reasoning_content: None,
            input_tokens: usage.and_then(|u| u.get("prompt_tokens")).and_then(Value::as_u64),
            output_tokens: usage.and_then(|u| u.get("completion_tokens")).and_then(Value::as_u64),
        })
    }
}

#[async_trait]
impl LLMProvider for OpenAiStyleProvider {
    async fn chat(&self, req: ChatRequest<'_>) -> Result<LLMResponse> {
        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|msg| {
                let mut m = json!({ "role": msg.role, "content": msg.content });
                if let Some(tool_calls) = &msg.tool_calls {
                    m["tool_calls"] = json!(tool_calls
                        .iter()
                        .map(|tc| json!({ "id": tc.id, "type": "function", "function": { "name": tc.name, "arguments": tc.arguments } }))
                        .collect::<Vec<_>>());
                }
                if let Some(id) = &msg.tool_call_id {
                    m["tool_call_id"] = json!(id);
                }
                m
            })
            .collect();

        let mut payload = json!({
            "model": req.model.unwrap_or(&self.default_model),
            "messages": messages,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
        });

        if let Some(tools) = &req.tools {
            payload["tools"] = json!(tools
                .iter()
                .map(|t| json!({ "type": "function", "function": { "name": t.name, "description": t.description, "parameters": t.parameters } }))
                .collect::<Vec<_>>());
            if let Some(choice) = &req.tool_choice {
                payload["tool_choice"] = json!(choice);
            }
        }

        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("falha ao chamar provedor remoto '{}'", self.provider_name))?;

        let body = ProviderErrorHandler::check_response(resp, &self.provider_name, &self.metrics).await?;

        if let Ok(mut m) = self.metrics.lock() {
            m.request_count += 1;
            if let Some(total) = body.get("usage").and_then(|u| u.get("total_tokens")).and_then(Value::as_u64) {
                m.token_count += total;
            }
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

    fn req(content: &str) -> ChatRequest<'static> {
        ChatRequest { messages: vec![Message::user(content.to_string())], max_tokens: 1024, temperature: 0.7, ..Default::default() }
    }

    #[tokio::test]
    async fn parses_plain_text_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "oi"}}],
                "usage": {"total_tokens": 5}
            })))
            .mount(&server)
            .await;

        let provider = OpenAiStyleProvider::with_base_url("k".into(), "m".into(), server.uri());
        let result = provider.chat(req("hello")).await.unwrap();
        assert_eq!(result.content.unwrap(), "oi");
    }

    #[tokio::test]
    async fn parses_list_of_text_parts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": [{"text": "part one"}, {"text": "part two"}]}}]
            })))
            .mount(&server)
            .await;

        let provider = OpenAiStyleProvider::with_base_url("k".into(), "m".into(), server.uri());
        let result = provider.chat(req("hi")).await.unwrap();
        assert_eq!(result.content.unwrap(), "part one\npart two");
    }

    #[tokio::test]
    async fn surfaces_rate_limit_as_generic_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).and(path("/")).respond_with(ResponseTemplate::new(429)).mount(&server).await;

        let provider = OpenAiStyleProvider::with_base_url("k".into(), "m".into(), server.uri());
        let err = provider.chat(req("hi")).await.unwrap_err();
        assert!(err.to_string().contains("limite de requisições"));
    }
}
