//! Subscriptions: a handler plus its delivery filters.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;
use verdant_core::{Event, EventType};

use crate::component::handler::EventHandler;

/// Predicate applied as the last eligibility rule.
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Delivery filters for one subscription.
#[derive(Clone, Default)]
pub struct SubscriptionOptions {
    /// Only these event types are delivered. Empty means all types.
    pub event_types: Vec<EventType>,
    /// Only events about these devices are delivered. Empty means all.
    pub source_ids: Vec<Uuid>,
    /// Restrict delivery to handlers whose `target_id` is a topology
    /// connection target of the event's device.
    ///
    /// Explicit `routing.target_ids` take precedence: they are checked first
    /// and this rule only further restricts the survivors.
    pub include_connected_sources: bool,
    /// Invoke the handler inline during publish instead of queueing it.
    pub synchronous: bool,
    /// Custom predicate; must return `true` for the event to be delivered.
    pub filter: Option<EventFilter>,
}

impl SubscriptionOptions {
    #[must_use]
    pub fn with_event_types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.event_types = types.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_source_ids(mut self, ids: impl IntoIterator<Item = Uuid>) -> Self {
        self.source_ids = ids.into_iter().collect();
        self
    }

    #[must_use]
    pub fn connected_sources_only(mut self) -> Self {
        self.include_connected_sources = true;
        self
    }

    #[must_use]
    pub fn synchronous(mut self) -> Self {
        self.synchronous = true;
        self
    }

    #[must_use]
    pub fn with_filter(
        mut self,
        filter: impl Fn(&Event) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }
}

impl fmt::Debug for SubscriptionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionOptions")
            .field("event_types", &self.event_types)
            .field("source_ids", &self.source_ids)
            .field("include_connected_sources", &self.include_connected_sources)
            .field("synchronous", &self.synchronous)
            .field("filter", &self.filter.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

/// A registered handler plus its options.
#[derive(Clone)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub handler: Arc<dyn EventHandler>,
    pub options: SubscriptionOptions,
}

impl Subscription {
    #[must_use]
    pub fn new(handler: Arc<dyn EventHandler>, options: SubscriptionOptions) -> Self {
        Self {
            subscription_id: Uuid::new_v4(),
            handler,
            options,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("subscription_id", &self.subscription_id)
            .field("target_id", &self.handler.target_id())
            .field("options", &self.options)
            .finish()
    }
}
