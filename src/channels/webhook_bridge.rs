//! Generic HTTP-webhook-driven adapter kit, shared by Signal and iMessage:
//! both receive inbound via a bridge webhook and differ only in how they
//! dispatch outbound text. Matches the "HTTP-webhook adapter kit" design
//! note (`spec.md` §9) instead of duplicating inheritance per transport.
//!
//! iMessage's outbound leg shells out to a local CLI (`original_source/
//! clawlite/channels/imessage.py` uses an `imsg` binary); Signal's shells
//! out to `signal-cli`. Both go through the scrubbed-environment
//! subprocess helper.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::channels::base::{BaseChannel, Health, WebhookEnvelope};
use crate::resilience::{CircuitState, OutboundResilience, OutboundResilienceConfig};
use crate::utils::subprocess::scrubbed_command;

pub enum OutboundTransport {
    /// Runs `cli_path <args...> <target> <text>` with a scrubbed environment.
    LocalCli { cli_path: String, extra_args: Vec<String> },
    /// Posts `{ "to": target, "text": text }` to an outbound bridge URL.
    HttpBridge { url: String },
}

pub struct WebhookBridgeChannel {
    name: String,
    transport: OutboundTransport,
    resilience: Arc<Mutex<OutboundResilience>>,
    running: Arc<AtomicBool>,
}

impl WebhookBridgeChannel {
    pub fn new(name: impl Into<String>, transport: OutboundTransport) -> Self {
        let name = name.into();
        WebhookBridgeChannel {
            resilience: Arc::new(Mutex::new(OutboundResilience::new(name.clone(), OutboundResilienceConfig::default()))),
            name,
            transport,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

}

async fn dispatch(transport: &OutboundTransport, target: &str, text: &str) -> Result<(), String> {
    match transport {
        OutboundTransport::LocalCli { cli_path, extra_args } => {
            let mut args = extra_args.clone();
            args.push(target.to_string());
            args.push(text.to_string());
            let output = scrubbed_command(cli_path, &args).output().map_err(|e| e.to_string())?;
            if output.status.success() {
                Ok(())
            } else {
                Err(String::from_utf8_lossy(&output.stderr).to_string())
            }
        }
        OutboundTransport::HttpBridge { url } => {
            let client = crate::utils::http::shared_client();
            let resp = client
                .post(url)
                .json(&serde_json::json!({ "to": target, "text": text }))
                .send()
                .await
                .map_err(|e| e.to_string())?;
            if resp.status().is_success() {
                Ok(())
            } else {
                Err(format!("bridge http {}", resp.status()))
            }
        }
    }
}

#[async_trait]
impl BaseChannel for WebhookBridgeChannel {
    fn name(&self) -> &str {
        &self.name
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
        let target = target.to_string();
        let text = text.to_string();
        let transport = &self.transport;
        let mut resilience = self.resilience.lock().await;
        let result = resilience
            .deliver(&target, &text, "webhook_bridge_send", || {
                let target = target.clone();
                let text = text.clone();
                async move { dispatch(transport, &target, &text).await }
            })
            .await;
        if !result.ok {
            anyhow::bail!(result.error.map(|e| e.reason).unwrap_or_default());
        }
        Ok(())
    }

    fn health(&self) -> Health {
        Health { running: self.running.load(Ordering::SeqCst), detail: format!("{} bridge", self.name) }
    }

    fn outbound_metrics_snapshot(&self) -> crate::resilience::OutboundMetrics {
        self.resilience.try_lock().map(|r| r.metrics().clone()).unwrap_or_default()
    }

    fn circuit_state(&self) -> CircuitState {
        self.resilience.try_lock().map(|r| r.circuit_state()).unwrap_or(CircuitState::Closed)
    }

    async fn process_webhook_payload(&mut self, payload: Value) -> anyhow::Result<Option<WebhookEnvelope>> {
        let text = payload.get("text").and_then(Value::as_str).unwrap_or("").to_string();
        let sender = payload.get("sender").and_then(Value::as_str).unwrap_or("").to_string();
        if text.is_empty() || sender.is_empty() {
            return Ok(None);
        }
        let chat_id = payload.get("chat_id").and_then(Value::as_str).unwrap_or(&sender).to_string();
        let is_dm = payload.get("is_group").and_then(Value::as_bool).map(|g| !g).unwrap_or(true);
        Ok(Some(WebhookEnvelope { sender, text, chat_id, is_dm, thread_id: None }))
    }
}
