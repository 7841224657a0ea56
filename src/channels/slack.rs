//! Slack adapter: polls `conversations.history` for configured channels
//! rather than opening Socket Mode, for the same dependency-alignment
//! reason as the Discord adapter.

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

const API_BASE: &str = "https://slack.com/api";

pub struct SlackChannel {
    token: String,
    channel_ids: Vec<String>,
    inbound: tokio::sync::mpsc::Sender<InboundMessage>,
    resilience: Arc<Mutex<OutboundResilience>>,
    running: Arc<AtomicBool>,
    poll_task: Option<JoinHandle<()>>,
}

impl SlackChannel {
    pub fn new(token: String, channel_ids: Vec<String>, inbound: tokio::sync::mpsc::Sender<InboundMessage>) -> Self {
        SlackChannel {
            token,
            channel_ids,
            inbound,
            resilience: Arc::new(Mutex::new(OutboundResilience::new("slack", OutboundResilienceConfig::default()))),
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
        let mut last_ts: std::collections::HashMap<String, String> = std::collections::HashMap::new();
        while running.load(Ordering::SeqCst) {
            for channel_id in &channel_ids {
                let mut req = client
                    .get(format!("{API_BASE}/conversations.history"))
                    .bearer_auth(&token)
                    .query(&[("channel", channel_id.as_str()), ("limit", "5")]);
                if let Some(oldest) = last_ts.get(channel_id) {
                    req = req.query(&[("oldest", oldest.as_str())]);
                }
                let Ok(resp) = req.send().await else { continue };
                let Ok(body) = resp.json::<Value>().await else { continue };
                let Some(messages) = body.get("messages").and_then(Value::as_array) else { continue };
                for message in messages.iter().rev() {
                    let Some(text) = message.get("text").and_then(Value::as_str) else { continue };
                    if message.get("bot_id").is_some() {
                        continue;
                    }
                    let ts = message.get("ts").and_then(Value::as_str).unwrap_or_default().to_string();
                    last_ts.insert(channel_id.clone(), ts);
                    let sender_id = message.get("user").and_then(Value::as_str).unwrap_or("").to_string();
                    let msg = InboundMessage {
                        session_id: session_id::slack(channel_id),
                        channel: "slack".to_string(),
                        sender_id,
                        text: text.to_string(),
                        thread_id: message.get("thread_ts").and_then(Value::as_str).map(String::from),
                        is_dm: channel_id.starts_with('D'),
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
impl BaseChannel for SlackChannel {
    fn name(&self) -> &str {
        "slack"
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        self.poll_task = Some(tokio::spawn(Self::poll_loop(
            self.token.clone(),
            self.channel_ids.clone(),
            self.inbound.clone(),
            self.running.clone(),
        )));
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
        let token = self.token.clone();
        let chunks = split_message(text, default_chunk_limit());
        let mut resilience = self.resilience.lock().await;
        for chunk in chunks {
            let client = crate::utils::http::shared_client();
            let token = token.clone();
            let target = target.to_string();
            let chunk_body = chunk.clone();
            let result = resilience
                .deliver(&target, &chunk, "slack_post_message", || {
                    let client = client.clone();
                    let token = token.clone();
                    let target = target.clone();
                    let chunk_body = chunk_body.clone();
                    async move {
                        let resp = client
                            .post(format!("{API_BASE}/chat.postMessage"))
                            .bearer_auth(&token)
                            .json(&serde_json::json!({ "channel": target, "text": chunk_body }))
                            .send()
                            .await
                            .map_err(|e| e.to_string())?;
                        let body: Value = resp.json().await.map_err(|e| e.to_string())?;
                        if body.get("ok").and_then(Value::as_bool).unwrap_or(false) {
                            Ok(())
                        } else {
                            Err(body.get("error").and_then(Value::as_str).unwrap_or("unknown").to_string())
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
        Health { running: self.running.load(Ordering::SeqCst), detail: "slack rest-poll".to_string() }
    }

    fn outbound_metrics_snapshot(&self) -> crate::resilience::OutboundMetrics {
        self.resilience.try_lock().map(|r| r.metrics().clone()).unwrap_or_default()
    }

    fn circuit_state(&self) -> CircuitState {
        self.resilience.try_lock().map(|r| r.circuit_state()).unwrap_or(CircuitState::Closed)
    }
}
