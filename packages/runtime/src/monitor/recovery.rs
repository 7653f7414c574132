//! Recovery strategy orchestration.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use verdant_core::now_millis;

use crate::monitor::error_monitor::{ComponentError, ErrorMonitor};

/// A named, priority-ranked procedure that tries to clear an error.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Strategies run in descending priority order.
    fn priority(&self) -> i32;

    /// Whether this strategy applies to the given error.
    fn can_recover(&self, error: &ComponentError) -> bool;

    /// Attempts recovery; `true` means the error is cleared.
    async fn attempt(&self, error: &ComponentError, token: &CancellationToken)
        -> anyhow::Result<bool>;
}

/// Outcome of one [`RecoveryManager::attempt_recovery`] run.
#[derive(Debug, Clone)]
pub struct RecoveryStatus {
    pub is_successful: bool,
    /// Number of strategies that were attempted.
    pub attempt_count: u32,
    /// Name of the strategy that succeeded, if any.
    pub successful_strategy: Option<String>,
    /// Error codes this run was about.
    pub error_codes: Vec<String>,
    /// Wall-clock time of the run (millis since epoch).
    pub timestamp: i64,
    /// Number of strategies that reported success (0 or 1; the run stops at
    /// the first success).
    pub success_count: u32,
    /// Name of the last strategy attempted.
    pub last_attempt: Option<String>,
}

/// Runs applicable strategies, highest priority first, until one succeeds.
pub struct RecoveryManager {
    strategies: RwLock<Vec<Arc<dyn RecoveryStrategy>>>,
    monitor: Arc<ErrorMonitor>,
}

impl RecoveryManager {
    #[must_use]
    pub fn new(monitor: Arc<ErrorMonitor>) -> Self {
        Self {
            strategies: RwLock::new(Vec::new()),
            monitor,
        }
    }

    /// Registers a strategy, keeping the set sorted by descending priority.
    pub fn register(&self, strategy: Arc<dyn RecoveryStrategy>) {
        let mut strategies = self.strategies.write();
        strategies.push(strategy);
        strategies.sort_by_key(|strategy| std::cmp::Reverse(strategy.priority()));
    }

    #[must_use]
    pub fn strategy_count(&self) -> usize {
        self.strategies.read().len()
    }

    /// Attempts to clear `error`, recording every attempt with the monitor.
    pub async fn attempt_recovery(
        &self,
        error: &ComponentError,
        token: &CancellationToken,
    ) -> RecoveryStatus {
        let strategies = self.strategies.read().clone();
        let mut status = RecoveryStatus {
            is_successful: false,
            attempt_count: 0,
            successful_strategy: None,
            error_codes: vec![error.error_code.clone()],
            timestamp: now_millis(),
            success_count: 0,
            last_attempt: None,
        };

        for strategy in strategies {
            if token.is_cancelled() {
                break;
            }
            if !strategy.can_recover(error) {
                continue;
            }
            status.attempt_count += 1;
            status.last_attempt = Some(strategy.name().to_string());

            let recovered = match strategy.attempt(error, token).await {
                Ok(recovered) => recovered,
                Err(err) => {
                    tracing::warn!(
                        strategy = strategy.name(),
                        device = %error.device_id,
                        code = %error.error_code,
                        error = %err,
                        "recovery strategy failed"
                    );
                    false
                }
            };
            self.monitor
                .register_recovery_attempt(error.device_id, &error.error_code, recovered);

            if recovered {
                status.is_successful = true;
                status.success_count = 1;
                status.successful_strategy = Some(strategy.name().to_string());
                tracing::info!(
                    strategy = strategy.name(),
                    device = %error.device_id,
                    code = %error.error_code,
                    "recovery succeeded"
                );
                break;
            }
        }
        status
    }
}
