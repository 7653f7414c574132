//! Runtime-level configuration for the control fabric.

use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the bus, queue processor, persistence service, and caches.
///
/// `Default` carries the documented defaults; embedders override fields as
/// needed before wiring the runtime together.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directory the JSON file store writes device documents into.
    pub store_root: PathBuf,
    /// Interval between persistence batch flushes.
    pub batch_interval: Duration,
    /// Base backoff before retrying a failed flush (jitter is added on top).
    pub flush_retry_backoff: Duration,
    /// Worker tasks dedicated to each priority band of the event queue.
    pub queue_workers_per_band: usize,
    /// Sleep applied by queue workers when their band is empty.
    pub queue_idle_backoff: Duration,
    /// Bound on graceful shutdown waits (queue workers, persistence task).
    pub shutdown_grace: Duration,
    /// Capacity of the persistence service's per-device LRU hot set.
    pub cache_capacity: usize,
    /// Sliding expiration for LRU entries. `None` disables expiry.
    pub cache_expiration: Option<Duration>,
    /// Interval of the background cache sweep. `None` disables the sweeper.
    pub cache_housekeeping_interval: Option<Duration>,
    /// Bound on the error monitor's recent-error buffer.
    pub max_recent_errors: usize,
    /// Consecutive failures before a circuit breaker opens.
    pub breaker_max_failures: u32,
    /// How long an open breaker rejects before probing again.
    pub breaker_reset_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            store_root: default_store_root(),
            batch_interval: Duration::from_secs(5),
            flush_retry_backoff: Duration::from_millis(500),
            queue_workers_per_band: 4,
            queue_idle_backoff: Duration::from_millis(10),
            shutdown_grace: Duration::from_secs(5),
            cache_capacity: 1024,
            cache_expiration: Some(Duration::from_secs(600)),
            cache_housekeeping_interval: Some(Duration::from_secs(60)),
            max_recent_errors: 1000,
            breaker_max_failures: 3,
            breaker_reset_timeout: Duration::from_secs(60),
        }
    }
}

/// The default store location: `<working directory>/DeviceData`.
#[must_use]
pub fn default_store_root() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_default()
        .join("DeviceData")
}
