//! Shared outcome of one publish.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

/// Counters shared between the publisher and the handlers of one publish.
///
/// Handlers that complete after a timeout was declared still land their
/// outcome here; the atomics keep late updates safe.
#[derive(Debug, Default)]
pub(crate) struct PublishShared {
    success: AtomicUsize,
    timed_out: AtomicBool,
    errors: Mutex<Vec<String>>,
}

impl PublishShared {
    pub(crate) fn record_success(&self) {
        self.success.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_failure(&self, message: String) {
        self.errors.lock().push(message);
    }

    pub(crate) fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
    }
}

/// Outcome of [`EventBus::publish`](crate::bus::EventBus::publish).
///
/// Reads go through the shared counters, so a result held across a timeout
/// keeps reflecting late handler completions.
#[derive(Debug, Clone)]
pub struct PublishResult {
    event_id: Uuid,
    handler_count: usize,
    shared: Arc<PublishShared>,
}

impl PublishResult {
    pub(crate) fn new(event_id: Uuid, handler_count: usize, shared: Arc<PublishShared>) -> Self {
        Self {
            event_id,
            handler_count,
            shared,
        }
    }

    #[must_use]
    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    /// Number of handlers that were eligible for the event.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handler_count
    }

    /// Number of handlers that completed successfully so far.
    #[must_use]
    pub fn success_count(&self) -> usize {
        self.shared.success.load(Ordering::SeqCst)
    }

    /// Number of handlers that failed so far.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.shared.errors.lock().len()
    }

    /// Whether the publish declared a timeout before all handlers finished.
    #[must_use]
    pub fn timed_out(&self) -> bool {
        self.shared.timed_out.load(Ordering::SeqCst)
    }

    /// Messages of the handler failures recorded so far.
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.shared.errors.lock().clone()
    }

    /// `true` when every eligible handler succeeded and no timeout fired.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.success_count() == self.handler_count && !self.timed_out()
    }
}
