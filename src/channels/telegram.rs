//! Telegram adapter: long-polls `getUpdates` over raw `reqwest` rather than
//! pulling in a bot-framework crate — the teacher's own `Cargo.toml` does
//! not declare one, so this keeps the dependency stack aligned with it.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::bus::InboundMessage;
use crate::channels::base::{default_chunk_limit, split_message, BaseChannel, Health};
use crate::channels::session_id;
use crate::resilience::{CircuitState, OutboundResilience, OutboundResilienceConfig};

const API_BASE: &str = "https://api.telegram.org";

pub struct TelegramChannel {
    token: String,
    inbound: tokio::sync::mpsc::Sender<InboundMessage>,
    resilience: Arc<Mutex<OutboundResilience>>,
    last_update_id: Arc<AtomicI64>,
    running: Arc<AtomicBool>,
    poll_task: Option<JoinHandle<()>>,
}

impl TelegramChannel {
    pub fn new(token: String, inbound: tokio::sync::mpsc::Sender<InboundMessage>) -> Self {
        TelegramChannel {
            token,
            inbound,
            resilience: Arc::new(Mutex::new(OutboundResilience::new("telegram", OutboundResilienceConfig::default()))),
            last_update_id: Arc::new(AtomicI64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            poll_task: None,
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{API_BASE}/bot{}/{method}", self.token)
    }

    async fn poll_loop(
        token: String,
        inbound: tokio::sync::mpsc::Sender<InboundMessage>,
        last_update_id: Arc<AtomicI64>,
        running: Arc<AtomicBool>,
    ) {
        let client = crate::utils::http::shared_client();
        while running.load(Ordering::SeqCst) {
            let offset = last_update_id.load(Ordering::SeqCst) + 1;
            let url = format!("{API_BASE}/bot{token}/getUpdates");
            let resp = client
                .get(&url)
                .query(&[("timeout", "25"), ("offset", &offset.to_string())])
                .send()
                .await;

            let body: Value = match resp {
                Ok(r) => match r.json().await {
                    Ok(v) => v,
                    Err(_) => continue,
                },
                Err(_) => {
                    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                    continue;
                }
            };

            let Some(updates) = body.get("result").and_then(Value::as_array) else { continue };
            for update in updates {
                if let Some(update_id) = update.get("update_id").and_then(Value::as_i64) {
                    last_update_id.store(update_id, Ordering::SeqCst);
                }
                let Some(message) = update.get("message") else { continue };
                let Some(text) = message.get("text").and_then(Value::as_str) else { continue };
                let Some(chat_id) = message.pointer("/chat/id").map(|v| v.to_string()) else { continue };
                let sender_id = message.pointer("/from/id").map(|v| v.to_string()).unwrap_or_default();
                let is_dm = message.pointer("/chat/type").and_then(Value::as_str) == Some("private");

                let msg = InboundMessage {
                    session_id: session_id::telegram(&chat_id),
                    channel: "telegram".to_string(),
                    sender_id,
                    text: text.to_string(),
                    thread_id: None,
                    is_dm,
                    metadata: serde_json::json!({ "chat_id": chat_id }),
                };
                let _ = inbound.send(msg).await;
            }
        }
    }
}

#[async_trait]
impl BaseChannel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(Self::poll_loop(
            self.token.clone(),
            self.inbound.clone(),
            self.last_update_id.clone(),
            self.running.clone(),
        ));
        self.poll_task = Some(handle);
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        Ok(())
    }

    async fn send(&mut self, target: &str, text: &str, _metadata: Option<Value>) -> anyhow::Result<()> {
        let url = self.api_url("sendMessage");
        let target = target.to_string();
        let chunks = split_message(text, default_chunk_limit());

        let mut resilience = self.resilience.lock().await;
        for chunk in chunks {
            let client = crate::utils::http::shared_client();
            let url = url.clone();
            let target = target.clone();
            let chunk_body = chunk.clone();
            let result = resilience
                .deliver(&target, &chunk, "telegram_send_message", || {
                    let client = client.clone();
                    let url = url.clone();
                    let target = target.clone();
                    let chunk_body = chunk_body.clone();
                    async move {
                        let resp = client
                            .post(&url)
                            .json(&serde_json::json!({ "chat_id": target, "text": chunk_body }))
                            .send()
                            .await
                            .map_err(|e| e.to_string())?;
                        if resp.status().is_success() {
                            Ok(())
                        } else {
                            Err(format!("telegram http {}", resp.status()))
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
        Health { running: self.running.load(Ordering::SeqCst), detail: "telegram long-poll".to_string() }
    }

    fn outbound_metrics_snapshot(&self) -> crate::resilience::OutboundMetrics {
        self.resilience.try_lock().map(|r| r.metrics().clone()).unwrap_or_default()
    }

    fn circuit_state(&self) -> CircuitState {
        self.resilience.try_lock().map(|r| r.circuit_state()).unwrap_or(CircuitState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_before_start_is_idempotent() {
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let mut channel = TelegramChannel::new("fake-token".to_string(), tx);
        assert!(channel.stop().await.is_ok());
        assert!(!channel.health().running);
    }
}
