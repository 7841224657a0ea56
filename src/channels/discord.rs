//! Discord adapter via REST — polls a channel's message history rather than
//! opening the full gateway websocket, keeping this crate's dependency
//! stack aligned with the teacher's (no `serenity`/`twilight` in its
//! manifest).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::bus::InboundMessage;
use crate::channels::base::{default_chunk_limit, split_message, BaseChannel, Health};
use crate::channels::session_id;
use crate::resilience::{CircuitState, OutboundResilience, OutboundResilienceConfig};

const API_BASE: &str = "https://discord.com/api/v10";

pub struct DiscordChannel {
    token: String,
    channel_ids: Vec<String>,
    inbound: tokio::sync::mpsc::Sender<InboundMessage>,
    resilience: Arc<Mutex<OutboundResilience>>,
    running: Arc<AtomicBool>,
    poll_task: Option<JoinHandle<()>>,
}

impl DiscordChannel {
    pub fn new(token: String, channel_ids: Vec<String>, inbound: tokio::sync::mpsc::Sender<InboundMessage>) -> Self {
        DiscordChannel {
            token,
            channel_ids,
            inbound,
            resilience: Arc::new(Mutex::new(OutboundResilience::new("discord", OutboundResilienceConfig::default()))),
            running: Arc::new(AtomicBool::new(false)),
            poll_task: None,
        }
    }

    async fn poll_loop(
        token: String,
        channel_ids: Vec<String>,
        inbound: tokio::sync::mpsc::Sender<InboundMessage>,
        running: Arc<AtomicBool>,
    ) {
        let client = crate::utils::http::shared_client();
        while running.load(Ordering::SeqCst) {
            for channel_id in &channel_ids {
                let url = format!("{API_BASE}/channels/{channel_id}/messages?limit=5");
                let resp = client.get(&url).header("Authorization", format!("Bot {token}")).send().await;
                let Ok(resp) = resp else { continue };
                let Ok(messages) = resp.json::<Vec<Value>>().await else { continue };
                for message in messages.into_iter().rev() {
                    let Some(content) = message.get("content").and_then(Value::as_str) else { continue };
                    if content.is_empty() {
                        continue;
                    }
                    let author_bot = message.pointer("/author/bot").and_then(Value::as_bool).unwrap_or(false);
                    if author_bot {
                        continue;
                    }
                    let sender_id = message.pointer("/author/id").and_then(Value::as_str).unwrap_or("").to_string();
                    let msg = InboundMessage {
                        session_id: session_id::discord(channel_id),
                        channel: "discord".to_string(),
                        sender_id,
                        text: content.to_string(),
                        thread_id: None,
                        is_dm: false,
                        metadata: serde_json::json!({ "channel_id": channel_id }),
                    };
                    let _ = inbound.send(msg).await;
                }
            }
            tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        }
    }
}

#[async_trait]
impl BaseChannel for DiscordChannel {
    fn name(&self) -> &str {
        "discord"
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(Self::poll_loop(
            self.token.clone(),
            self.channel_ids.clone(),
            self.inbound.clone(),
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
        let url = format!("{API_BASE}/channels/{target}/messages");
        let token = self.token.clone();
        let chunks = split_message(text, default_chunk_limit());
        let mut resilience = self.resilience.lock().await;
        for chunk in chunks {
            let client = crate::utils::http::shared_client();
            let url = url.clone();
            let token = token.clone();
            let chunk_body = chunk.clone();
            let result = resilience
                .deliver(target, &chunk, "discord_create_message", || {
                    let client = client.clone();
                    let url = url.clone();
                    let token = token.clone();
                    let chunk_body = chunk_body.clone();
                    async move {
                        let resp = client
                            .post(&url)
                            .header("Authorization", format!("Bot {token}"))
                            .json(&serde_json::json!({ "content": chunk_body }))
                            .send()
                            .await
                            .map_err(|e| e.to_string())?;
                        if resp.status().is_success() {
                            Ok(())
                        } else {
                            Err(format!("discord http {}", resp.status()))
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
        Health { running: self.running.load(Ordering::SeqCst), detail: "discord rest-poll".to_string() }
    }

    fn outbound_metrics_snapshot(&self) -> crate::resilience::OutboundMetrics {
        self.resilience.try_lock().map(|r| r.metrics().clone()).unwrap_or_default()
    }

    fn circuit_state(&self) -> CircuitState {
        self.resilience.try_lock().map(|r| r.circuit_state()).unwrap_or(CircuitState::Closed)
    }
}
