//! WhatsApp adapter: Meta Cloud API, webhook-driven inbound, REST outbound.
//!
//! Grounded on `original_source/clawlite/channels/whatsapp.py`'s
//! `process_webhook_payload`: `entry[].changes[].value.messages[]` envelope,
//! `text.body`/`from` extraction, `wa_<phone>` session id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::channels::base::{default_chunk_limit, split_message, BaseChannel, Health, WebhookEnvelope};
use crate::channels::session_id;
use crate::resilience::{CircuitState, OutboundResilience, OutboundResilienceConfig};

pub struct WhatsAppChannel {
    token: String,
    phone_number_id: String,
    resilience: Arc<Mutex<OutboundResilience>>,
    running: Arc<AtomicBool>,
}

impl WhatsAppChannel {
    pub fn new(token: String, phone_number_id: String) -> Self {
        WhatsAppChannel {
            token,
            phone_number_id,
            resilience: Arc::new(Mutex::new(OutboundResilience::new("whatsapp", OutboundResilienceConfig::default()))),
            running: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl BaseChannel for WhatsAppChannel {
    fn name(&self) -> &str {
        "whatsapp"
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
        let phone = target.strip_prefix("wa_").unwrap_or(target).to_string();
        let url = format!("https://graph.facebook.com/v19.0/{}/messages", self.phone_number_id);
        let token = self.token.clone();
        let chunks = split_message(text, default_chunk_limit());
        let mut resilience = self.resilience.lock().await;
        for chunk in chunks {
            let client = crate::utils::http::shared_client();
            let url = url.clone();
            let token = token.clone();
            let phone = phone.clone();
            let chunk_body = chunk.clone();
            let result = resilience
                .deliver(&phone, &chunk, "whatsapp_cloud_api_send", || {
                    let client = client.clone();
                    let url = url.clone();
                    let token = token.clone();
                    let phone = phone.clone();
                    let chunk_body = chunk_body.clone();
                    async move {
                        let resp = client
                            .post(&url)
                            .bearer_auth(&token)
                            .json(&serde_json::json!({
                                "messaging_product": "whatsapp",
                                "recipient_type": "individual",
                                "to": phone,
                                "type": "text",
                                "text": { "preview_url": false, "body": chunk_body },
                            }))
                            .send()
                            .await
                            .map_err(|e| e.to_string())?;
                        if resp.status().is_success() {
                            Ok(())
                        } else {
                            Err(format!("whatsapp http {}", resp.status()))
                        }
                    }
                })
                .await;
            if !result.ok {
                anyhow::bail!(result.error.map(|e| e.reason).unwrap_or_default());
            }
        }
        Ok(())
    }

    fn health(&self) -> Health {
        Health { running: self.running.load(Ordering::SeqCst), detail: "whatsapp cloud-api".to_string() }
    }

    fn outbound_metrics_snapshot(&self) -> crate::resilience::OutboundMetrics {
        self.resilience.try_lock().map(|r| r.metrics().clone()).unwrap_or_default()
    }

    fn circuit_state(&self) -> CircuitState {
        self.resilience.try_lock().map(|r| r.circuit_state()).unwrap_or(CircuitState::Closed)
    }

    async fn process_webhook_payload(&mut self, payload: Value) -> anyhow::Result<Option<WebhookEnvelope>> {
        let entries = payload.get("entry").and_then(Value::as_array).cloned().unwrap_or_default();
        for entry in entries {
            let changes = entry.get("changes").and_then(Value::as_array).cloned().unwrap_or_default();
            for change in changes {
                let messages = change.pointer("/value/messages").and_then(Value::as_array).cloned().unwrap_or_default();
                for message in messages {
                    if message.get("type").and_then(Value::as_str) != Some("text") {
                        continue;
                    }
                    let text = message.pointer("/text/body").and_then(Value::as_str).unwrap_or("").to_string();
                    let sender = message.get("from").and_then(Value::as_str).unwrap_or("").to_string();
                    if sender.is_empty() || text.is_empty() {
                        continue;
                    }
                    return Ok(Some(WebhookEnvelope {
                        sender: sender.clone(),
                        text,
                        chat_id: format!("wa_{sender}"),
                        is_dm: true,
                        thread_id: None,
                    }));
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn extracts_text_message_from_meta_envelope() {
        let mut channel = WhatsAppChannel::new("tok".to_string(), "123".to_string());
        let payload = serde_json::json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "messages": [{ "type": "text", "from": "5511999999999", "text": { "body": "oi" } }]
                    }
                }]
            }]
        });
        let envelope = channel.process_webhook_payload(payload).await.unwrap().unwrap();
        assert_eq!(envelope.sender, "5511999999999");
        assert_eq!(envelope.text, "oi");
        assert_eq!(envelope.chat_id, "wa_5511999999999");
        assert!(envelope.is_dm);
    }

    #[test]
    fn session_id_matches_spec_prefix() {
        assert_eq!(session_id::whatsapp("5511999999999"), "wa_5511999999999");
    }
}
