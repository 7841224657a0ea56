//! Response/status handling shared by the `openai`-style and `anthropic`-style
//! HTTP providers. Grounded on the teacher's `providers/errors.rs`.

use anyhow::Result;
use reqwest::{Response, StatusCode};
use serde_json::Value;
use tracing::warn;

use crate::providers::base::ProviderMetrics;
use std::sync::{Arc, Mutex};

pub struct ProviderErrorHandler;

impl ProviderErrorHandler {
    pub fn parse_api_error(status: u16, error_text: &str) -> anyhow::Error {
        if let Ok(error_json) = serde_json::from_str::<Value>(error_text) {
            if let Some(error) = error_json.get("error") {
                let error_type = error.get("type").and_then(Value::as_str).unwrap_or("unknown");
                let error_msg = error.get("message").and_then(Value::as_str).unwrap_or("Unknown error");
                return anyhow::anyhow!("API error ({}): {}", error_type, error_msg);
            }
        }
        anyhow::anyhow!("API error ({}): {}", status, error_text)
    }

    pub fn handle_rate_limit(status: u16, retry_after: Option<u64>) -> anyhow::Error {
        if let Some(seconds) = retry_after {
            warn!("rate limit hit, retry after {}s", seconds);
        } else {
            warn!("rate limit hit (status {})", status);
        }
        anyhow::anyhow!("limite de requisições excedido")
    }

    pub fn handle_auth_error(status: u16, error_text: &str) -> anyhow::Error {
        warn!("authentication error (status {}): {}", status, error_text);
        anyhow::anyhow!("falha de autenticação junto ao provedor: {}", error_text)
    }

    /// Consumes an HTTP response, bumping `metrics.error_count` on failure,
    /// and returns the parsed JSON body on 2xx.
    pub async fn check_response(resp: Response, provider_name: &str, metrics: &Arc<Mutex<ProviderMetrics>>) -> Result<Value> {
        let status = resp.status();
        if status.is_success() {
            return resp.json::<Value>().await.map_err(|e| anyhow::anyhow!("resposta JSON inválida do provedor remoto '{provider_name}': {e}"));
        }

        if let Ok(mut m) = metrics.lock() {
            m.error_count += 1;
        }

        let retry_after = resp.headers().get("retry-after").and_then(|v| v.to_str().ok()).and_then(|v| v.parse::<u64>().ok());
        let body = resp.text().await.unwrap_or_default();

        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Self::handle_auth_error(status.as_u16(), &body),
            StatusCode::TOO_MANY_REQUESTS => Self::handle_rate_limit(status.as_u16(), retry_after),
            _ => Self::parse_api_error(status.as_u16(), &body),
        })
    }
}
