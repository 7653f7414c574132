//! Active-error tracking per device.

use std::collections::{BTreeMap, VecDeque};

use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;
use verdant_core::now_millis;

/// How bad an error is. Ordering matters: `Catastrophic` > `Critical` >
/// `Error` > `Warning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Warning,
    Error,
    Critical,
    Catastrophic,
}

/// Which layer reported the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Device,
    Bus,
    Persistence,
    Store,
    Recovery,
    Unknown,
}

/// One reported error, tracked until recovery succeeds.
#[derive(Debug, Clone)]
pub struct ComponentError {
    pub device_id: Uuid,
    /// Stable machine-readable code, e.g. `PERSISTENCE_FLUSH_FAILED`.
    pub error_code: String,
    pub message: String,
    pub severity: Severity,
    pub source: ErrorSource,
    /// Wall-clock time of the report (millis since epoch).
    pub timestamp: i64,
    /// Free-form diagnostic context.
    pub context: BTreeMap<String, String>,
    /// Number of recovery attempts made against this error.
    pub recovery_attempts: u32,
    /// Rendered causing exception, when one exists.
    pub exception: Option<String>,
}

impl ComponentError {
    #[must_use]
    pub fn new(
        device_id: Uuid,
        error_code: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
        source: ErrorSource,
    ) -> Self {
        Self {
            device_id,
            error_code: error_code.into(),
            message: message.into(),
            severity,
            source,
            timestamp: now_millis(),
            context: BTreeMap::new(),
            recovery_attempts: 0,
            exception: None,
        }
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }
}

/// Tracks recent errors, per-device active errors, and per-code statistics.
pub struct ErrorMonitor {
    /// Bounded FIFO of everything reported, newest last.
    recent: Mutex<VecDeque<ComponentError>>,
    max_recent: usize,
    /// Active (unhandled) errors: device -> error code -> error.
    device_errors: DashMap<Uuid, DashMap<String, ComponentError>>,
    /// Lifetime report counts per error code.
    statistics: DashMap<String, u64>,
}

impl ErrorMonitor {
    #[must_use]
    pub fn new(max_recent: usize) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(max_recent.min(64))),
            max_recent: max_recent.max(1),
            device_errors: DashMap::new(),
            statistics: DashMap::new(),
        }
    }

    /// Records an error: appends to the recent buffer (evicting the oldest
    /// past the bound), upserts the device's active-error entry, and bumps
    /// the per-code counter.
    pub fn report(&self, error: ComponentError) {
        tracing::warn!(
            device = %error.device_id,
            code = %error.error_code,
            severity = ?error.severity,
            source = ?error.source,
            message = %error.message,
            "component error reported"
        );

        *self.statistics.entry(error.error_code.clone()).or_insert(0) += 1;

        self.device_errors
            .entry(error.device_id)
            .or_default()
            .insert(error.error_code.clone(), error.clone());

        let mut recent = self.recent.lock();
        if recent.len() >= self.max_recent {
            recent.pop_front();
        }
        recent.push_back(error);
    }

    /// The `n` most recent reports, newest first.
    #[must_use]
    pub fn recent_errors(&self, n: usize) -> Vec<ComponentError> {
        self.recent.lock().iter().rev().take(n).cloned().collect()
    }

    /// Whether any device has an active error at or above `min_severity`.
    #[must_use]
    pub fn has_active_errors(&self, min_severity: Severity) -> bool {
        self.device_errors.iter().any(|per_device| {
            per_device
                .value()
                .iter()
                .any(|entry| entry.value().severity >= min_severity)
        })
    }

    /// Active errors for one device.
    #[must_use]
    pub fn active_errors_for_device(&self, device_id: Uuid) -> Vec<ComponentError> {
        self.device_errors
            .get(&device_id)
            .map(|per_device| {
                per_device
                    .value()
                    .iter()
                    .map(|entry| entry.value().clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Clears one active error, e.g. after an operator acknowledged it.
    pub fn mark_handled(&self, device_id: Uuid, error_code: &str) -> bool {
        self.device_errors
            .get(&device_id)
            .is_some_and(|per_device| per_device.remove(error_code).is_some())
    }

    /// Records a recovery attempt: success clears the active error, failure
    /// increments its attempt counter.
    pub fn register_recovery_attempt(&self, device_id: Uuid, error_code: &str, success: bool) {
        let Some(per_device) = self.device_errors.get(&device_id) else {
            return;
        };
        if success {
            per_device.remove(error_code);
        } else if let Some(mut entry) = per_device.get_mut(error_code) {
            entry.recovery_attempts = entry.recovery_attempts.saturating_add(1);
        }
    }

    /// Per-code counts of errors reported at or after `since` (millis since
    /// epoch, taken from the recent buffer). `since == 0` returns the
    /// lifetime counters instead.
    #[must_use]
    pub fn statistics(&self, since: i64) -> BTreeMap<String, u64> {
        if since <= 0 {
            return self
                .statistics
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect();
        }
        let mut counts = BTreeMap::new();
        for error in self.recent.lock().iter() {
            if error.timestamp >= since {
                *counts.entry(error.error_code.clone()).or_insert(0) += 1;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_error(device: Uuid, code: &str, severity: Severity) -> ComponentError {
        ComponentError::new(device, code, "something broke", severity, ErrorSource::Device)
    }

    #[test]
    fn report_tracks_active_errors_and_statistics() {
        let monitor = ErrorMonitor::new(100);
        let device = Uuid::new_v4();

        monitor.report(make_error(device, "PUMP_STALL", Severity::Error));
        monitor.report(make_error(device, "PUMP_STALL", Severity::Error));
        monitor.report(make_error(device, "LOW_FLOW", Severity::Warning));

        let active = monitor.active_errors_for_device(device);
        assert_eq!(active.len(), 2);

        let stats = monitor.statistics(0);
        assert_eq!(stats.get("PUMP_STALL"), Some(&2));
        assert_eq!(stats.get("LOW_FLOW"), Some(&1));
    }

    #[test]
    fn recent_buffer_is_bounded() {
        let monitor = ErrorMonitor::new(3);
        let device = Uuid::new_v4();
        for i in 0..10 {
            monitor.report(make_error(device, &format!("E{i}"), Severity::Warning));
        }

        let recent = monitor.recent_errors(10);
        assert_eq!(recent.len(), 3);
        // Newest first.
        assert_eq!(recent[0].error_code, "E9");
        assert_eq!(recent[2].error_code, "E7");
    }

    #[test]
    fn severity_threshold_filtering() {
        let monitor = ErrorMonitor::new(100);
        let device = Uuid::new_v4();
        monitor.report(make_error(device, "LOW_FLOW", Severity::Warning));

        assert!(monitor.has_active_errors(Severity::Warning));
        assert!(!monitor.has_active_errors(Severity::Critical));

        monitor.report(make_error(device, "TANK_DRY", Severity::Catastrophic));
        assert!(monitor.has_active_errors(Severity::Critical));
    }

    #[test]
    fn mark_handled_clears_active_error() {
        let monitor = ErrorMonitor::new(100);
        let device = Uuid::new_v4();
        monitor.report(make_error(device, "PUMP_STALL", Severity::Error));

        assert!(monitor.mark_handled(device, "PUMP_STALL"));
        assert!(!monitor.mark_handled(device, "PUMP_STALL"));
        assert!(monitor.active_errors_for_device(device).is_empty());
    }

    #[test]
    fn recovery_attempts_are_counted_until_success() {
        let monitor = ErrorMonitor::new(100);
        let device = Uuid::new_v4();
        monitor.report(make_error(device, "PUMP_STALL", Severity::Error));

        monitor.register_recovery_attempt(device, "PUMP_STALL", false);
        monitor.register_recovery_attempt(device, "PUMP_STALL", false);
        let active = monitor.active_errors_for_device(device);
        assert_eq!(active[0].recovery_attempts, 2);

        monitor.register_recovery_attempt(device, "PUMP_STALL", true);
        assert!(monitor.active_errors_for_device(device).is_empty());
    }

    #[test]
    fn statistics_since_filters_by_timestamp() {
        let monitor = ErrorMonitor::new(100);
        let device = Uuid::new_v4();

        let mut old = make_error(device, "OLD", Severity::Warning);
        old.timestamp = 1000;
        monitor.report(old);
        monitor.report(make_error(device, "NEW", Severity::Warning));

        let stats = monitor.statistics(2000);
        assert!(stats.contains_key("NEW"));
        assert!(!stats.contains_key("OLD"));
    }
}
