//! Outbound Resilience Engine: per-channel send wrapper combining bounded
//! retry, a timeout per attempt, an idempotency-keyed dedupe cache, and a
//! closed/open/half-open circuit breaker.
//!
//! Grounded on `original_source/clawlite/channels/outbound_resilience.py`
//! for the retry/dedupe/metrics shape and
//! `original_source/clawlite/runtime/outbound_policy.py` for the breaker
//! field names and health thresholds; the breaker state machine itself
//! follows the teacher's `providers/circuit_breaker.rs`.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::utils::sha256_hex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastError {
    pub provider: String,
    pub code: String,
    pub reason: String,
    pub attempts: u32,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OutboundMetrics {
    pub sent_ok: u64,
    pub retry_count: u64,
    pub timeout_count: u64,
    pub fallback_count: u64,
    pub send_fail_count: u64,
    pub dedupe_hits: u64,
    pub circuit_open_count: u64,
    pub circuit_half_open_count: u64,
    pub circuit_blocked_count: u64,
    pub last_error: Option<LastError>,
    pub last_success_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SendResult {
    pub ok: bool,
    pub attempts: u32,
    pub error: Option<LastError>,
}

impl SendResult {
    fn ok(attempts: u32) -> Self {
        SendResult { ok: true, attempts, error: None }
    }
}

pub struct OutboundResilienceConfig {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub dedupe_ttl: Duration,
    pub dedupe_max_entries: usize,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown: Duration,
}

impl Default for OutboundResilienceConfig {
    fn default() -> Self {
        OutboundResilienceConfig {
            timeout: Duration::from_secs(8),
            max_attempts: 3,
            base_backoff: Duration::from_millis(250),
            dedupe_ttl: Duration::from_secs(8),
            dedupe_max_entries: 512,
            breaker_failure_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
        }
    }
}

/// Per-channel-instance resilience wrapper. One instance is owned per
/// adapter; never shared across instances of the same channel.
pub struct OutboundResilience {
    channel: String,
    cfg: OutboundResilienceConfig,
    recent_sent: HashMap<String, Instant>,
    metrics: OutboundMetrics,
    circuit_state: CircuitState,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
}

impl OutboundResilience {
    pub fn new(channel: impl Into<String>, cfg: OutboundResilienceConfig) -> Self {
        let mut cfg = cfg;
        cfg.max_attempts = cfg.max_attempts.clamp(1, 3);
        cfg.timeout = cfg.timeout.max(Duration::from_millis(100));
        OutboundResilience {
            channel: channel.into(),
            cfg,
            recent_sent: HashMap::new(),
            metrics: OutboundMetrics::default(),
            circuit_state: CircuitState::Closed,
            consecutive_failures: 0,
            cooldown_until: None,
        }
    }

    pub fn metrics(&self) -> &OutboundMetrics {
        &self.metrics
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_state
    }

    pub fn make_idempotency_key(&self, target: &str, text: &str) -> String {
        let raw = format!("{}\n{}\n{}", self.channel, target, text);
        sha256_hex(raw.as_bytes())[..32].to_string()
    }

    fn prune_recent(&mut self, now: Instant) {
        self.recent_sent.retain(|_, ts| now.duration_since(*ts) <= self.cfg.dedupe_ttl);
        if self.recent_sent.len() <= self.cfg.dedupe_max_entries {
            return;
        }
        let overflow = self.recent_sent.len() - self.cfg.dedupe_max_entries;
        let mut entries: Vec<(String, Instant)> =
            self.recent_sent.iter().map(|(k, v)| (k.clone(), *v)).collect();
        entries.sort_by_key(|(_, ts)| *ts);
        for (key, _) in entries.into_iter().take(overflow) {
            self.recent_sent.remove(&key);
        }
    }

    /// Synchronous "no transport configured" failure path: skips the retry
    /// loop entirely and records the failure directly.
    pub fn unavailable(&mut self, reason: &str, fallback_description: &str) -> SendResult {
        self.metrics.send_fail_count += 1;
        let err = LastError {
            provider: self.channel.clone(),
            code: "channel_unavailable".to_string(),
            reason: reason.to_string(),
            attempts: 0,
            idempotency_key: String::new(),
        };
        tracing::warn!(channel = %self.channel, code = err.code, reason, fallback_description, "outbound unavailable");
        self.metrics.last_error = Some(err.clone());
        SendResult { ok: false, attempts: 0, error: Some(err) }
    }

    /// Runs `operation` under the full resilience envelope: dedupe, circuit
    /// breaker gate, bounded retry with exponential backoff, timeout per
    /// attempt.
    pub async fn deliver<F, Fut>(
        &mut self,
        target: &str,
        text: &str,
        fallback_description: &str,
        operation: F,
    ) -> SendResult
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<(), String>>,
    {
        let now = Instant::now();
        let key = self.make_idempotency_key(target, text);
        self.prune_recent(now);

        if self.recent_sent.contains_key(&key) {
            self.metrics.dedupe_hits += 1;
            return SendResult::ok(0);
        }

        if let Some(blocked) = self.check_circuit(now, &key) {
            return blocked;
        }

        let mut last_err: Option<LastError> = None;
        for attempt in 1..=self.cfg.max_attempts {
            let outcome = tokio::time::timeout(self.cfg.timeout, operation()).await;
            match outcome {
                Ok(Ok(())) => {
                    self.recent_sent.insert(key.clone(), Instant::now());
                    self.metrics.sent_ok += 1;
                    self.metrics.last_success_at = Some(chrono::Utc::now().to_rfc3339());
                    self.close_circuit();
                    return SendResult::ok(attempt);
                }
                Ok(Err(reason)) => {
                    last_err = Some(LastError {
                        provider: self.channel.clone(),
                        code: "provider_send_failed".to_string(),
                        reason,
                        attempts: attempt,
                        idempotency_key: key.clone(),
                    });
                }
                Err(_) => {
                    self.metrics.timeout_count += 1;
                    last_err = Some(LastError {
                        provider: self.channel.clone(),
                        code: "provider_timeout".to_string(),
                        reason: format!("timed out after {:?}", self.cfg.timeout),
                        attempts: attempt,
                        idempotency_key: key.clone(),
                    });
                }
            }

            if attempt < self.cfg.max_attempts {
                self.metrics.retry_count += 1;
                let backoff = self.cfg.base_backoff * 2u32.pow(attempt - 1);
                tokio::time::sleep(backoff).await;
            }
        }

        self.metrics.send_fail_count += 1;
        self.metrics.fallback_count += 1;
        self.consecutive_failures += 1;
        self.metrics.last_error = last_err.clone();

        if self.consecutive_failures >= self.cfg.breaker_failure_threshold
            && self.circuit_state != CircuitState::Open
        {
            self.open_circuit();
        } else if self.circuit_state == CircuitState::HalfOpen {
            // a half-open trial failed: re-open immediately
            self.open_circuit();
        }

        if let Some(err) = &last_err {
            tracing::warn!(
                channel = %self.channel,
                code = err.code,
                attempts = err.attempts,
                reason = %err.reason,
                fallback_description,
                idempotency_key = %err.idempotency_key,
                "outbound send exhausted retries",
            );
        }

        SendResult { ok: false, attempts: self.cfg.max_attempts, error: last_err }
    }

    /// Returns `Some(blocked_result)` if the circuit gate blocks this send;
    /// transitions `open -> half_open` as a side effect when the cooldown
    /// has expired, counting the transition only when it actually admits a
    /// trial attempt (per the REDESIGN FLAGS correction: do not count
    /// `half_open` entries that are not genuine trials).
    fn check_circuit(&mut self, now: Instant, key: &str) -> Option<SendResult> {
        if self.circuit_state != CircuitState::Open {
            return None;
        }
        let cooldown_until = self.cooldown_until?;
        if now < cooldown_until {
            self.metrics.circuit_blocked_count += 1;
            let err = LastError {
                provider: self.channel.clone(),
                code: "circuit_open".to_string(),
                reason: "circuit open".to_string(),
                attempts: 0,
                idempotency_key: key.to_string(),
            };
            return Some(SendResult { ok: false, attempts: 0, error: Some(err) });
        }
        self.circuit_state = CircuitState::HalfOpen;
        self.metrics.circuit_half_open_count += 1;
        None
    }

    fn open_circuit(&mut self) {
        self.circuit_state = CircuitState::Open;
        self.cooldown_until = Some(Instant::now() + self.cfg.breaker_cooldown);
        self.metrics.circuit_open_count += 1;
    }

    fn close_circuit(&mut self) {
        self.circuit_state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.cooldown_until = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retry_then_breaker_opens_then_half_open_recovers() {
        let cfg = OutboundResilienceConfig {
            max_attempts: 1,
            breaker_failure_threshold: 1,
            breaker_cooldown: Duration::from_millis(50),
            base_backoff: Duration::from_millis(1),
            ..OutboundResilienceConfig::default()
        };
        let mut resilience = OutboundResilience::new("irc", cfg);

        let fail_count = Arc::new(AtomicU32::new(0));
        let fc = fail_count.clone();
        let result = resilience
            .deliver("#chan", "hello1", "fallback", || {
                let fc = fc.clone();
                async move {
                    fc.fetch_add(1, Ordering::SeqCst);
                    Err("boom".to_string())
                }
            })
            .await;
        assert!(!result.ok);
        assert_eq!(resilience.circuit_state(), CircuitState::Open);

        // blocked while cooldown is active
        let blocked = resilience
            .deliver("#chan", "hello2", "fallback", || async { Ok(()) })
            .await;
        assert!(!blocked.ok);
        assert_eq!(blocked.error.unwrap().code, "circuit_open");
        assert_eq!(resilience.metrics().circuit_blocked_count, 1);

        tokio::time::sleep(Duration::from_millis(60)).await;

        let recovered = resilience
            .deliver("#chan", "hello3", "fallback", || async { Ok(()) })
            .await;
        assert!(recovered.ok);
        assert_eq!(resilience.circuit_state(), CircuitState::Closed);
        assert_eq!(resilience.metrics().sent_ok, 1);
    }

    #[tokio::test]
    async fn dedupe_prevents_second_operation_call() {
        let mut resilience = OutboundResilience::new("googlechat", OutboundResilienceConfig::default());
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            resilience
                .deliver("space_1", "hello", "fallback", || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(resilience.metrics().dedupe_hits, 1);
        assert_eq!(resilience.metrics().sent_ok, 1);
    }

    #[test]
    fn max_attempts_clamped_to_three() {
        let cfg = OutboundResilienceConfig { max_attempts: 99, ..OutboundResilienceConfig::default() };
        let r = OutboundResilience::new("x", cfg);
        assert_eq!(r.cfg.max_attempts, 3);
    }
}
