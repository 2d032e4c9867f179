//! Per-integration failure accounting: the circuit-breaker state machine and
//! the retryability classification used by the step executor.
//!
//! One breaker exists per integration target and is shared by every
//! concurrent run (and by the health monitor). All transitions happen under
//! the breaker's mutex, so no caller ever observes a partially-updated state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::time::Instant;
use tracing::{info, warn};

use integrations::{IntegrationError, IntegrationResponse};

use crate::{models::CircuitBreakerConfig, EngineError};

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// In half-open, exactly one probe may be in flight.
    probe_in_flight: bool,
}

/// Failure-isolation state machine for one integration target.
pub struct CircuitBreaker {
    integration: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(integration: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            integration: integration.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    /// Ask permission for one attempt.
    ///
    /// Open and within `recovery_timeout`: rejected with `CircuitOpen`, no
    /// network attempt is made. Open with the timeout elapsed: transitions to
    /// half-open and admits exactly one probe; concurrent attempts during the
    /// probe are rejected.
    pub fn try_acquire(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if elapsed {
                    info!(
                        integration = %self.integration,
                        "recovery timeout elapsed, circuit half-open"
                    );
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(EngineError::CircuitOpen(self.integration.clone()))
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(EngineError::CircuitOpen(self.integration.clone()))
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record an attempt that proved the integration reachable (a success,
    /// or a non-retryable answer): resets the failure counter; in half-open
    /// this closes the circuit.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == BreakerState::HalfOpen {
            info!(integration = %self.integration, "probe succeeded, circuit closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    /// Record a retryable failed attempt. Reaching `failure_threshold`
    /// consecutive failures (or failing a half-open probe) opens the circuit.
    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.probe_in_flight = false;

        if inner.state == BreakerState::HalfOpen {
            warn!(integration = %self.integration, "probe failed, circuit re-opened");
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            return;
        }

        inner.consecutive_failures += 1;
        if inner.state == BreakerState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            warn!(
                integration = %self.integration,
                failures = inner.consecutive_failures,
                "failure threshold reached, circuit open"
            );
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Force the circuit open, independent of workflow-driven failures.
    /// Used by the health monitor on persistent endpoint failure.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != BreakerState::Open {
            warn!(integration = %self.integration, "circuit forced open by health monitor");
        }
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.probe_in_flight = false;
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// All circuit breakers, keyed by integration name. Owned by the
/// orchestrating context and shared with the executor and the monitor.
pub struct BreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the breaker for an integration.
    pub fn breaker(&self, integration: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(integration.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(integration, self.default_config.clone()))
            })
            .clone()
    }

    /// Install a configured breaker for an integration. An already-installed
    /// breaker keeps its accumulated state unless the config changed.
    pub fn configure(&self, integration: &str, config: CircuitBreakerConfig) {
        let mut breakers = self.breakers.lock().unwrap();
        match breakers.get(integration) {
            Some(existing) if existing.config() == &config => {}
            _ => {
                breakers.insert(
                    integration.to_string(),
                    Arc::new(CircuitBreaker::new(integration, config)),
                );
            }
        }
    }

    pub fn force_open(&self, integration: &str) {
        self.breaker(integration).force_open();
    }
}

// ---------------------------------------------------------------------------
// Retryability
// ---------------------------------------------------------------------------

/// Whether an unsuccessful response is worth another attempt.
///
/// Transient server-side conditions (408, 429, 5xx) are; everything else
/// short-circuits the retry loop.
pub fn response_is_retryable(response: &IntegrationResponse) -> bool {
    matches!(response.status_code, 408 | 429 | 500..=599)
}

/// Whether a failed call (no response at all) is worth another attempt.
pub fn error_is_retryable(error: &IntegrationError) -> bool {
    error.is_retryable()
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use integrations::IntegrationErrorKind;
    use serde_json::json;
    use std::time::Duration;

    fn config(threshold: u32, recovery: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            call_timeout: Duration::from_secs(5),
            recovery_timeout: recovery,
        }
    }

    #[test]
    fn opens_exactly_at_failure_threshold() {
        let breaker = CircuitBreaker::new("crm", config(3, Duration::from_secs(60)));

        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(matches!(
            breaker.try_acquire(),
            Err(EngineError::CircuitOpen(ref i)) if i == "crm"
        ));
    }

    #[test]
    fn success_resets_the_failure_counter() {
        let breaker = CircuitBreaker::new("crm", config(3, Duration::from_secs(60)));

        breaker.on_failure();
        breaker.on_failure();
        breaker.on_success();
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_recovery_timeout_then_closes_on_success() {
        let breaker = CircuitBreaker::new("crm", config(1, Duration::from_secs(30)));

        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(31)).await;

        // One probe is admitted; a concurrent attempt is not.
        assert!(breaker.try_acquire().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.try_acquire().is_err());

        breaker.on_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_the_circuit() {
        let breaker = CircuitBreaker::new("crm", config(1, Duration::from_secs(30)));

        breaker.on_failure();
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(breaker.try_acquire().is_ok());

        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn force_open_rejects_until_recovery() {
        let breaker = CircuitBreaker::new("crm", config(10, Duration::from_secs(60)));
        assert!(breaker.try_acquire().is_ok());

        breaker.force_open();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn registry_shares_one_breaker_per_integration() {
        let registry = BreakerRegistry::new(CircuitBreakerConfig::default());
        let a = registry.breaker("crm");
        let b = registry.breaker("crm");
        a.force_open();
        assert_eq!(b.state(), BreakerState::Open);

        // A different key gets a fresh breaker.
        assert_eq!(registry.breaker("billing").state(), BreakerState::Closed);
    }

    #[test]
    fn configure_preserves_state_for_unchanged_config() {
        let registry = BreakerRegistry::new(CircuitBreakerConfig::default());
        registry.configure("crm", CircuitBreakerConfig::default());
        registry.breaker("crm").force_open();

        registry.configure("crm", CircuitBreakerConfig::default());
        assert_eq!(registry.breaker("crm").state(), BreakerState::Open);
    }

    #[test]
    fn retryability_classification() {
        let retryable = IntegrationResponse::failed(503, json!({}), Duration::ZERO);
        let not_retryable = IntegrationResponse::failed(404, json!({}), Duration::ZERO);
        assert!(response_is_retryable(&retryable));
        assert!(response_is_retryable(&IntegrationResponse::failed(
            429,
            json!({}),
            Duration::ZERO
        )));
        assert!(!response_is_retryable(&not_retryable));

        assert!(error_is_retryable(&IntegrationError::transport("reset")));
        assert!(error_is_retryable(&IntegrationError::timeout("slow")));
        assert!(!error_is_retryable(&IntegrationError::new(
            IntegrationErrorKind::Validation,
            "bad request"
        )));
    }
}
