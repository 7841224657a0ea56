//! Channel Lifecycle Manager: enumerates configured channels, instantiates
//! one or many instances per channel (primary plus extra accounts), and
//! owns start/stop/reconnect and proactive broadcast.
//!
//! Grounded on `examples/oxicrab-oxicrab/src/channels/manager.rs` for the
//! instance-registry shape, rollback-on-start-failure semantics, and the
//! retrying `send`; `spec.md` §4.2 for the session-id convention and the
//! "worst among instances" circuit aggregation rule (§9 design notes).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::channels::base::{BaseChannel, Health};
use crate::config::Config;
use crate::resilience::{CircuitState, OutboundMetrics};

pub struct ChannelInstance {
    pub instance_key: String,
    pub channel_name: String,
    pub adapter: Mutex<Box<dyn BaseChannel>>,
    pub running: std::sync::atomic::AtomicBool,
}

#[derive(Default)]
struct SessionIndex {
    /// channel_name -> most recently bound session_id
    most_recent: HashMap<String, String>,
}

pub struct ChannelManager {
    instances: RwLock<HashMap<String, Arc<ChannelInstance>>>,
    session_index: RwLock<SessionIndex>,
}

#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: u32,
    pub failed: u32,
    pub skipped: u32,
}

impl ChannelManager {
    pub fn new() -> Self {
        ChannelManager { instances: RwLock::new(HashMap::new()), session_index: RwLock::new(SessionIndex::default()) }
    }

    /// Registers a constructed adapter under `instance_key` without
    /// starting it; construction is feature-gated and channel-specific and
    /// lives in the CLI/autonomy wiring, not here.
    pub async fn register(&self, instance_key: String, channel_name: String, adapter: Box<dyn BaseChannel>) {
        let instance = Arc::new(ChannelInstance {
            instance_key: instance_key.clone(),
            channel_name,
            adapter: Mutex::new(adapter),
            running: std::sync::atomic::AtomicBool::new(false),
        });
        self.instances.write().await.insert(instance_key, instance);
    }

    pub async fn start_all(&self) -> anyhow::Result<()> {
        let keys: Vec<String> = self.instances.read().await.keys().cloned().collect();
        let mut started = Vec::new();
        for key in keys {
            match self.start_instance(&key).await {
                Ok(()) => started.push(key),
                Err(e) => {
                    tracing::error!(instance = %key, error = %e, "failed to start instance, rolling back");
                    for ok_key in &started {
                        let _ = self.stop_instance(ok_key).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    pub async fn start_instance(&self, key: &str) -> anyhow::Result<()> {
        let instances = self.instances.read().await;
        let instance = instances.get(key).ok_or_else(|| anyhow::anyhow!("unknown instance {key}"))?.clone();
        drop(instances);
        instance.adapter.lock().await.start().await?;
        instance.running.store(true, std::sync::atomic::Ordering::SeqCst);
        tracing::info!(instance = key, "channel instance started");
        Ok(())
    }

    pub async fn stop_instance(&self, key: &str) -> anyhow::Result<()> {
        let instances = self.instances.read().await;
        let Some(instance) = instances.get(key).cloned() else { return Ok(()) };
        drop(instances);
        instance.adapter.lock().await.stop().await?;
        instance.running.store(false, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    pub async fn stop_all(&self) {
        let keys: Vec<String> = self.instances.read().await.keys().cloned().collect();
        for key in keys {
            if let Err(e) = self.stop_instance(&key).await {
                tracing::warn!(instance = %key, error = %e, "error stopping instance");
            }
        }
    }

    pub async fn reconnect(&self, channel_name: &str) -> anyhow::Result<()> {
        let keys: Vec<String> = {
            let instances = self.instances.read().await;
            instances
                .values()
                .filter(|i| i.channel_name == channel_name)
                .map(|i| i.instance_key.clone())
                .collect()
        };
        for key in &keys {
            self.stop_instance(key).await?;
        }
        for key in &keys {
            self.start_instance(key).await?;
        }
        Ok(())
    }

    /// Sends with three attempts of linear backoff at the manager level, on
    /// top of each adapter's own resilience wrapper — a belt-and-suspenders
    /// retry for transient `send()` call failures outside the adapter.
    pub async fn send(&self, instance_key: &str, target: &str, text: &str, metadata: Option<Value>) -> anyhow::Result<()> {
        let instance = {
            let instances = self.instances.read().await;
            instances
                .get(instance_key)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown instance {instance_key}"))?
        };

        let mut last_err = None;
        for attempt in 1..=3u32 {
            let mut adapter = instance.adapter.lock().await;
            match adapter.send(target, text, metadata.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    drop(adapter);
                    if attempt < 3 {
                        tokio::time::sleep(std::time::Duration::from_millis(300 * attempt as u64)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("send failed")))
    }

    /// Hands a raw webhook body to the first instance registered under
    /// `channel_name`, for the HTTP-webhook-driven transports
    /// (whatsapp/googlechat/irc/signal/imessage).
    pub async fn process_webhook(&self, channel_name: &str, payload: Value) -> anyhow::Result<Option<crate::channels::base::WebhookEnvelope>> {
        let instance = {
            let instances = self.instances.read().await;
            instances.values().find(|i| i.channel_name == channel_name).cloned()
        };
        let Some(instance) = instance else {
            anyhow::bail!("no instance registered for channel {channel_name}");
        };
        instance.adapter.lock().await.process_webhook_payload(payload).await
    }

    pub async fn bind_session(&self, channel_name: &str, session_id: &str) {
        self.session_index.write().await.most_recent.insert(channel_name.to_string(), session_id.to_string());
    }

    pub async fn describe_instances(&self) -> Vec<(String, String, bool, Health)> {
        let instances = self.instances.read().await;
        let mut out = Vec::new();
        for instance in instances.values() {
            let health = instance.adapter.lock().await.health();
            out.push((
                instance.instance_key.clone(),
                instance.channel_name.clone(),
                instance.running.load(std::sync::atomic::Ordering::SeqCst),
                health,
            ));
        }
        out
    }

    /// Aggregates counters across every instance of `channel_name` and
    /// derives a channel-level circuit state using the worst-case rule:
    /// `open > half_open > closed`.
    pub async fn outbound_metrics(&self, channel_name: &str) -> (OutboundMetrics, CircuitState) {
        let instances = self.instances.read().await;
        let mut agg = OutboundMetrics::default();
        let mut worst = CircuitState::Closed;

        for instance in instances.values().filter(|i| i.channel_name == channel_name) {
            let adapter = instance.adapter.lock().await;
            let snap = adapter.outbound_metrics_snapshot();
            agg.sent_ok += snap.sent_ok;
            agg.retry_count += snap.retry_count;
            agg.timeout_count += snap.timeout_count;
            agg.fallback_count += snap.fallback_count;
            agg.send_fail_count += snap.send_fail_count;
            agg.dedupe_hits += snap.dedupe_hits;
            agg.circuit_open_count += snap.circuit_open_count;
            agg.circuit_half_open_count += snap.circuit_half_open_count;
            agg.circuit_blocked_count += snap.circuit_blocked_count;
            if snap.last_error.is_some() {
                agg.last_error = snap.last_error;
            }
            if snap.last_success_at.is_some() {
                agg.last_success_at = snap.last_success_at;
            }
            worst = worse_of(worst, adapter.circuit_state());
        }

        (agg, worst)
    }

    /// Broadcasts a proactive message to the most-recently-bound session of
    /// every registered channel, falling back to a configured `chat_id`
    /// when no session is bound yet.
    pub async fn broadcast_proactive(
        &self,
        message: &str,
        prefix: &str,
        fallback_chat_ids: &HashMap<String, String>,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let channel_names: Vec<String> = {
            let instances = self.instances.read().await;
            instances.values().map(|i| i.channel_name.clone()).collect::<std::collections::HashSet<_>>().into_iter().collect()
        };

        let text = format!("{prefix}{message}");
        for channel_name in channel_names {
            let target = {
                let index = self.session_index.read().await;
                index.most_recent.get(&channel_name).cloned().or_else(|| fallback_chat_ids.get(&channel_name).cloned())
            };
            let Some(target) = target else {
                report.skipped += 1;
                continue;
            };
            let instance_key = channel_name.clone();
            match self.send(&instance_key, &target, &text, None).await {
                Ok(()) => report.delivered += 1,
                Err(_) => report.failed += 1,
            }
        }
        report
    }

    pub fn config_instances_for(config: &Config, channel_name: &str, token: &str, accounts: &[String]) -> Vec<String> {
        let mut keys = vec![channel_name.to_string()];
        for account in accounts {
            keys.push(format!("{channel_name}:{account}"));
        }
        let _ = (config, token);
        keys
    }
}

/// `open > half_open > closed`, per the spec's "worst among instances" rule.
fn worse_of(a: CircuitState, b: CircuitState) -> CircuitState {
    fn rank(s: CircuitState) -> u8 {
        match s {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
    if rank(b) > rank(a) { b } else { a }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct MockChannel {
        name: String,
        fail_sends: Arc<AtomicU32>,
        running: Arc<AtomicBool>,
    }

    #[async_trait]
    impl BaseChannel for MockChannel {
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

        async fn send(&mut self, _target: &str, _text: &str, _metadata: Option<Value>) -> anyhow::Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) > 0 {
                self.fail_sends.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("mock failure");
            }
            Ok(())
        }

        fn health(&self) -> Health {
            Health { running: self.running.load(Ordering::SeqCst), detail: "mock".to_string() }
        }

        fn outbound_metrics_snapshot(&self) -> OutboundMetrics {
            OutboundMetrics::default()
        }
    }

    #[tokio::test]
    async fn start_all_then_stop_all_toggles_running() {
        let manager = ChannelManager::new();
        let running = Arc::new(AtomicBool::new(false));
        manager
            .register(
                "telegram".to_string(),
                "telegram".to_string(),
                Box::new(MockChannel { name: "telegram".to_string(), fail_sends: Arc::new(AtomicU32::new(0)), running: running.clone() }),
            )
            .await;

        manager.start_all().await.unwrap();
        assert!(running.load(Ordering::SeqCst));
        manager.stop_all().await;
        assert!(!running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn send_retries_transient_failures() {
        let manager = ChannelManager::new();
        let fail_sends = Arc::new(AtomicU32::new(2));
        manager
            .register(
                "slack".to_string(),
                "slack".to_string(),
                Box::new(MockChannel { name: "slack".to_string(), fail_sends: fail_sends.clone(), running: Arc::new(AtomicBool::new(true)) }),
            )
            .await;

        let result = manager.send("slack", "#general", "hi", None).await;
        assert!(result.is_ok());
        assert_eq!(fail_sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn broadcast_skips_channels_with_no_bound_session() {
        let manager = ChannelManager::new();
        manager
            .register(
                "discord".to_string(),
                "discord".to_string(),
                Box::new(MockChannel {
                    name: "discord".to_string(),
                    fail_sends: Arc::new(AtomicU32::new(0)),
                    running: Arc::new(AtomicBool::new(true)),
                }),
            )
            .await;

        let report = manager.broadcast_proactive("oi", "[heartbeat] ", &HashMap::new()).await;
        assert_eq!(report.skipped, 1);
        assert_eq!(report.delivered, 0);
    }
}
