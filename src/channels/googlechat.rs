//! Google Chat adapter: webhook-driven, reply is synchronous on the
//! webhook's own HTTP response when possible, with an async outbound
//! webhook URL fallback for out-of-band (proactive) sends.
//!
//! Grounded on `original_source/clawlite/channels/googlechat.py`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::channels::base::{BaseChannel, Health, WebhookEnvelope};
use crate::resilience::{CircuitState, OutboundResilience, OutboundResilienceConfig};

pub struct GoogleChatChannel {
    outbound_webhook_url: String,
    resilience: Arc<Mutex<OutboundResilience>>,
    running: Arc<AtomicBool>,
}

impl GoogleChatChannel {
    pub fn new(outbound_webhook_url: String) -> Self {
        GoogleChatChannel {
            outbound_webhook_url,
            resilience: Arc::new(Mutex::new(OutboundResilience::new(
                "googlechat",
                OutboundResilienceConfig { breaker_failure_threshold: 5, ..OutboundResilienceConfig::default() },
            ))),
            running: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl BaseChannel for GoogleChatChannel {
    fn name(&self) -> &str {
        "googlechat"
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&mut self, target: &str, text: &str, _metadata: Option<Value>) -> anyhow::Result<()> {
        if self.outbound_webhook_url.is_empty() {
            let mut resilience = self.resilience.lock().await;
            let result = resilience.unavailable("no outbound webhook configured", "googlechat_send");
            anyhow::bail!(result.error.map(|e| e.reason).unwrap_or_default());
        }
        let url = self.outbound_webhook_url.clone();
        let text = text.to_string();
        let target = target.to_string();
        let mut resilience = self.resilience.lock().await;
        let result = resilience
            .deliver(&target, &text, "googlechat_outbound_webhook", || {
                let client = crate::utils::http::shared_client().clone();
                let url = url.clone();
                let text = text.clone();
                async move {
                    let resp = client
                        .post(&url)
                        .json(&serde_json::json!({ "text": text }))
                        .send()
                        .await
                        .map_err(|e| e.to_string())?;
                    if resp.status().is_success() {
                        Ok(())
                    } else {
                        Err(format!("googlechat webhook http {}", resp.status()))
                    }
                }
            })
            .await;
        if !result.ok {
            anyhow::bail!(result.error.map(|e| e.reason).unwrap_or_default());
        }
        Ok(())
    }

    fn health(&self) -> Health {
        Health { running: self.running.load(Ordering::SeqCst), detail: "googlechat webhook".to_string() }
    }

    fn outbound_metrics_snapshot(&self) -> crate::resilience::OutboundMetrics {
        self.resilience.try_lock().map(|r| r.metrics().clone()).unwrap_or_default()
    }

    fn circuit_state(&self) -> CircuitState {
        self.resilience.try_lock().map(|r| r.circuit_state()).unwrap_or(CircuitState::Closed)
    }

    async fn process_webhook_payload(&mut self, payload: Value) -> anyhow::Result<Option<WebhookEnvelope>> {
        let text = payload.pointer("/message/text").and_then(Value::as_str).unwrap_or("").to_string();
        let space = payload.pointer("/space/name").and_then(Value::as_str).unwrap_or("unknown").to_string();
        let sender = payload
            .pointer("/message/sender/name")
            .or_else(|| payload.pointer("/user/name"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        if text.is_empty() || sender.is_empty() {
            return Ok(None);
        }
        let is_dm = payload.pointer("/space/type").and_then(Value::as_str) == Some("DM");
        Ok(Some(WebhookEnvelope { sender, text, chat_id: space, is_dm, thread_id: None }))
    }
}
