//! Wraps a provider with a transient/non-transient failure classifier and a
//! closed/open/half-open breaker, so a flapping remote stops being retried
//! on every turn. Grounded on the teacher's `providers/circuit_breaker.rs`.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::providers::base::{ChatRequest, LLMProvider, LLMResponse};

#[derive(Debug, Clone, PartialEq)]
enum State {
    Closed,
    Open { since: Instant },
    HalfOpen { successes: u32 },
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub half_open_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig { failure_threshold: 3, recovery_timeout_secs: 30, half_open_probes: 2 }
    }
}

struct BreakerState {
    state: State,
    consecutive_failures: u32,
}

pub struct CircuitBreakerProvider {
    inner: Arc<dyn LLMProvider>,
    breaker: Mutex<BreakerState>,
    config: BreakerConfig,
}

impl CircuitBreakerProvider {
    pub fn wrap(inner: Arc<dyn LLMProvider>, config: BreakerConfig) -> Arc<dyn LLMProvider> {
        Arc::new(Self { inner, breaker: Mutex::new(BreakerState { state: State::Closed, consecutive_failures: 0 }), config })
    }

    fn is_transient(error: &str) -> bool {
        let lower = error.to_lowercase();
        let non_transient = ["authentication", "unauthorized", "context length", "invalid api key", "permission", "forbidden"];
        if non_transient.iter().any(|p| lower.contains(p)) {
            return false;
        }
        let transient = ["rate limit", "limite de requisições", "429", "500", "502", "503", "504", "timeout", "connection refused", "connection reset"];
        transient.iter().any(|p| lower.contains(p))
    }

    async fn should_allow(&self) -> anyhow::Result<()> {
        let mut breaker = self.breaker.lock().await;
        match &breaker.state {
            State::Closed | State::HalfOpen { .. } => Ok(()),
            State::Open { since } => {
                let elapsed = since.elapsed();
                if elapsed.as_secs() >= self.config.recovery_timeout_secs {
                    info!("provider circuit breaker Open -> HalfOpen after {}s", elapsed.as_secs());
                    breaker.state = State::HalfOpen { successes: 0 };
                    Ok(())
                } else {
                    anyhow::bail!("limite de requisições excedido; provedor em recuperação ({}s restantes)", self.config.recovery_timeout_secs - elapsed.as_secs());
                }
            }
        }
    }

    async fn record_success(&self) {
        let mut breaker = self.breaker.lock().await;
        breaker.consecutive_failures = 0;
        if let State::HalfOpen { successes } = &breaker.state {
            let successes = successes + 1;
            breaker.state = if successes >= self.config.half_open_probes { State::Closed } else { State::HalfOpen { successes } };
        }
    }

    async fn record_failure(&self, transient: bool) {
        if !transient {
            return;
        }
        let mut breaker = self.breaker.lock().await;
        breaker.consecutive_failures += 1;
        match &breaker.state {
            State::Closed if breaker.consecutive_failures >= self.config.failure_threshold => {
                warn!("provider circuit breaker tripped after {} failures", breaker.consecutive_failures);
                breaker.state = State::Open { since: Instant::now() };
            }
            State::HalfOpen { .. } => {
                warn!("provider circuit breaker probe failed, reopening");
                breaker.state = State::Open { since: Instant::now() };
            }
            _ => {}
        }
    }
}

#[async_trait]
impl LLMProvider for CircuitBreakerProvider {
    async fn chat(&self, req: ChatRequest<'_>) -> anyhow::Result<LLMResponse> {
        self.should_allow().await?;
        match self.inner.chat(req).await {
            Ok(response) => {
                self.record_success().await;
                Ok(response)
            }
            Err(e) => {
                self.record_failure(Self::is_transient(&e.to_string())).await;
                Err(e)
            }
        }
    }

    fn default_model(&self) -> &str {
        self.inner.default_model()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as TokioMutex;

    struct MockProvider {
        responses: TokioMutex<Vec<Result<LLMResponse, String>>>,
    }

    #[async_trait]
    impl LLMProvider for MockProvider {
        async fn chat(&self, _req: ChatRequest<'_>) -> anyhow::Result<LLMResponse> {
            let mut responses = self.responses.lock().await;
            match responses.pop() {
                Some(Ok(r)) => Ok(r),
                Some(Err(e)) => Err(anyhow::anyhow!("{e}")),
                None => Ok(LLMResponse { content: Some("ok".into()), ..Default::default() }),
            }
        }
        fn default_model(&self) -> &str {
            "mock"
        }
    }

    fn req() -> ChatRequest<'static> {
        ChatRequest { max_tokens: 16, ..Default::default() }
    }

    #[tokio::test]
    async fn trips_open_after_threshold_transient_failures() {
        let mock = Arc::new(MockProvider { responses: TokioMutex::new(vec![Err("rate limit".into()); 5]) });
        let breaker = CircuitBreakerProvider::wrap(mock, BreakerConfig { failure_threshold: 2, recovery_timeout_secs: 60, half_open_probes: 1 });

        assert!(breaker.chat(req()).await.is_err());
        assert!(breaker.chat(req()).await.is_err());
        let third = breaker.chat(req()).await;
        assert!(third.unwrap_err().to_string().contains("recuperação"));
    }

    #[tokio::test]
    async fn non_transient_failure_does_not_trip_breaker() {
        let mock = Arc::new(MockProvider { responses: TokioMutex::new(vec![Err("invalid api key".into()); 5]) });
        let breaker = CircuitBreakerProvider::wrap(mock, BreakerConfig { failure_threshold: 1, recovery_timeout_secs: 60, half_open_probes: 1 });

        assert!(breaker.chat(req()).await.is_err());
        let second = breaker.chat(req()).await;
        assert!(!second.unwrap_err().to_string().contains("recuperação"));
    }
}
