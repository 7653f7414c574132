//! Dead-letter storage for undeliverable persistent events.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use verdant_core::Event;

/// Sink for events whose delivery failed outright.
///
/// The bus hands an event here when its routing asked for persistence and
/// every eligible handler failed, or the publish timed out.
#[async_trait]
pub trait FailedEventStore: Send + Sync {
    async fn store_failed(&self, event: &Event) -> anyhow::Result<()>;
}

/// In-memory dead-letter queue for tests, demos, and redelivery tooling.
#[derive(Debug, Default)]
pub struct InMemoryFailedEventStore {
    events: Mutex<VecDeque<Event>>,
}

impl InMemoryFailedEventStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Drains all dead-lettered events, oldest first.
    #[must_use]
    pub fn take_all(&self) -> Vec<Event> {
        self.events.lock().drain(..).collect()
    }
}

#[async_trait]
impl FailedEventStore for InMemoryFailedEventStore {
    async fn store_failed(&self, event: &Event) -> anyhow::Result<()> {
        tracing::warn!(event = %event.event_id, device = %event.device_id, "event dead-lettered");
        self.events.lock().push_back(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;
    use verdant_core::{ComponentState, RoutingData};

    use super::*;

    #[tokio::test]
    async fn stores_and_drains_in_order() {
        let store = InMemoryFailedEventStore::new();
        let a = Event::lifecycle(
            Uuid::new_v4(),
            ComponentState::Created,
            ComponentState::Ready,
            RoutingData::default(),
        );
        let b = Event::lifecycle(
            Uuid::new_v4(),
            ComponentState::Ready,
            ComponentState::Running,
            RoutingData::default(),
        );

        store.store_failed(&a).await.unwrap();
        store.store_failed(&b).await.unwrap();
        assert_eq!(store.len(), 2);

        let drained = store.take_all();
        assert_eq!(drained[0].event_id, a.event_id);
        assert_eq!(drained[1].event_id, b.event_id);
        assert!(store.is_empty());
    }
}
