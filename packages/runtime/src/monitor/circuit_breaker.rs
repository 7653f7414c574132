//! Per-service circuit breakers.
//!
//! State machine per service name: `Closed` counts consecutive failures and
//! opens at the threshold; `Open` rejects until the reset timeout elapses,
//! then the next call probes through `HalfOpen`; a successful probe closes
//! the circuit, a failed one re-opens it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use verdant_core::{now_millis, FabricError};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Operations run; failures are counted.
    Closed,
    /// Operations are rejected until the reset timeout elapses.
    Open,
    /// One probe operation is allowed through.
    HalfOpen,
}

/// Thresholds for one breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub max_failures: u32,
    /// How long an open circuit rejects before allowing a probe.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 3,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Emitted on every state transition.
#[derive(Debug, Clone)]
pub struct CircuitStateChanged {
    pub service: String,
    pub old_state: CircuitState,
    pub new_state: CircuitState,
    /// Wall-clock time of the most recent failure, if any.
    pub last_failure_time: Option<i64>,
    pub reason: String,
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The circuit is open; the operation was not attempted.
    #[error("circuit breaker `{service}` is open")]
    Open { service: String },
    /// The operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

/// Collapses breaker outcomes into the fabric taxonomy, for callers that
/// guard store or bus operations behind a breaker.
impl From<BreakerError<FabricError>> for FabricError {
    fn from(err: BreakerError<FabricError>) -> Self {
        match err {
            BreakerError::Open { service } => Self::CircuitBreakerOpen { service },
            BreakerError::Inner(inner) => inner,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_ms: Option<i64>,
}

/// Gate for calls against one downstream service.
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    events: broadcast::Sender<CircuitStateChanged>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            service: service.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_ms: None,
            }),
            events,
        }
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Subscribes to state-change events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitStateChanged> {
        self.events.subscribe()
    }

    /// Runs `op` through the breaker.
    ///
    /// # Errors
    ///
    /// [`BreakerError::Open`] when the circuit rejects the call;
    /// [`BreakerError::Inner`] when the operation itself fails.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.try_acquire() {
            return Err(BreakerError::Open {
                service: self.service.clone(),
            });
        }
        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// Admission check: rejects while open, transitions to half-open once
    /// the reset timeout has elapsed.
    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = state
                    .last_failure_ms
                    .map_or(i64::MAX, |last| now_millis() - last);
                let reset_ms = i64::try_from(self.config.reset_timeout.as_millis())
                    .unwrap_or(i64::MAX);
                if elapsed > reset_ms {
                    self.transition(
                        &mut state,
                        CircuitState::HalfOpen,
                        "reset timeout elapsed, probing",
                    );
                    true
                } else {
                    false
                }
            }
        }
    }

    fn on_success(&self) {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::HalfOpen => {
                state.failure_count = 0;
                self.transition(&mut state, CircuitState::Closed, "probe succeeded");
            }
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut state = self.state.lock();
        state.last_failure_ms = Some(now_millis());
        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.max_failures {
                    self.transition(&mut state, CircuitState::Open, "failure threshold reached");
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut state, CircuitState::Open, "probe failed");
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, state: &mut BreakerState, next: CircuitState, reason: &str) {
        let old = state.state;
        state.state = next;
        tracing::info!(
            service = %self.service,
            from = ?old,
            to = ?next,
            reason,
            "circuit breaker state change"
        );
        // Receivers may be gone; state changes are valid regardless.
        let _ = self.events.send(CircuitStateChanged {
            service: self.service.clone(),
            old_state: old,
            new_state: next,
            last_failure_time: state.last_failure_ms,
            reason: reason.to_string(),
        });
    }
}

/// Map of breakers keyed by service name.
#[derive(Default)]
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakers {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Returns the breaker for `service`, creating it on first use.
    #[must_use]
    pub fn for_service(&self, service: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(service, self.config.clone()))
            })
            .clone()
    }
}
