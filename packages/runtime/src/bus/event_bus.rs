//! Subscription registry, routing, and publish orchestration.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use verdant_core::{Event, FabricError, Result};

use crate::bus::dead_letter::FailedEventStore;
use crate::bus::publish::{PublishResult, PublishShared};
use crate::bus::queue::{EventQueueProcessor, QueueItem};
use crate::bus::subscription::{Subscription, SubscriptionOptions};
use crate::bus::topology::TopologyService;
use crate::bus::transformer::{EventTransformer, IdentityTransformer};
use crate::component::handler::EventHandler;

/// Routes published events to matching subscriptions.
///
/// Publishes serialize behind an admission gate: at most one publish is in
/// its dispatch-selection phase at a time, which yields global FIFO per
/// source. Asynchronous handler execution overlaps freely across publishes.
pub struct EventBus {
    subscriptions: DashMap<Uuid, Subscription>,
    publish_gate: tokio::sync::Mutex<()>,
    topology: Arc<TopologyService>,
    queue: Arc<EventQueueProcessor>,
    failed_events: Option<Arc<dyn FailedEventStore>>,
    transformer: Arc<dyn EventTransformer>,
}

impl EventBus {
    #[must_use]
    pub fn new(topology: Arc<TopologyService>, queue: Arc<EventQueueProcessor>) -> Self {
        Self {
            subscriptions: DashMap::new(),
            publish_gate: tokio::sync::Mutex::new(()),
            topology,
            queue,
            failed_events: None,
            transformer: Arc::new(IdentityTransformer),
        }
    }

    /// Attaches a dead-letter sink for undeliverable persistent events.
    #[must_use]
    pub fn with_failed_event_store(mut self, store: Arc<dyn FailedEventStore>) -> Self {
        self.failed_events = Some(store);
        self
    }

    /// Replaces the identity transformer.
    #[must_use]
    pub fn with_transformer(mut self, transformer: Arc<dyn EventTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    /// Registers a handler and returns its subscription id.
    pub fn subscribe(
        &self,
        handler: Arc<dyn EventHandler>,
        options: SubscriptionOptions,
    ) -> Uuid {
        let subscription = Subscription::new(handler, options);
        let id = subscription.subscription_id;
        self.subscriptions.insert(id, subscription);
        tracing::debug!(subscription = %id, "handler subscribed");
        id
    }

    /// Removes a subscription; returns whether it existed.
    pub fn unsubscribe(&self, subscription_id: Uuid) -> bool {
        self.subscriptions.remove(&subscription_id).is_some()
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Publishes one event: selects eligible subscriptions, runs synchronous
    /// handlers inline, queues asynchronous ones, and waits for completion
    /// (bounded by `routing.timeout` when set).
    ///
    /// # Errors
    ///
    /// Returns [`FabricError::Cancelled`] when `token` is cancelled before
    /// dispatch begins. Handler failures are never errors; they land in
    /// [`PublishResult::errors`].
    pub async fn publish(
        &self,
        sender_id: Uuid,
        event: Event,
        token: &CancellationToken,
    ) -> Result<PublishResult> {
        let gate = tokio::select! {
            biased;
            () = token.cancelled() => return Err(FabricError::Cancelled),
            gate = self.publish_gate.lock() => gate,
        };

        let event = Arc::new(self.transformer.transform(event));
        let eligible = self.select_subscriptions(&event, token).await;

        let shared = Arc::new(PublishShared::default());
        let result = PublishResult::new(event.event_id, eligible.len(), Arc::clone(&shared));
        tracing::debug!(
            event = %event.event_id,
            event_type = ?event.event_type,
            handlers = eligible.len(),
            "publishing event"
        );

        // Synchronous handlers run inline and complete before any
        // asynchronous handler of this publish starts.
        let mut async_subs = Vec::new();
        let mut completions = Vec::new();
        for subscription in eligible {
            if subscription.options.synchronous {
                if token.is_cancelled() {
                    break;
                }
                match subscription
                    .handler
                    .handle_event(sender_id, &event, token)
                    .await
                {
                    Ok(()) => shared.record_success(),
                    Err(err) => {
                        tracing::debug!(
                            event = %event.event_id,
                            subscription = %subscription.subscription_id,
                            error = %err,
                            "synchronous handler failed"
                        );
                        shared.record_failure(format!("{err:#}"));
                    }
                }
            } else {
                async_subs.push(subscription);
            }
        }

        for subscription in async_subs {
            if token.is_cancelled() {
                break;
            }
            let (completion, receiver) = oneshot::channel();
            self.queue.enqueue(QueueItem {
                event: Arc::clone(&event),
                sender_id,
                handler: Arc::clone(&subscription.handler),
                shared: Arc::clone(&shared),
                completion,
                token: token.child_token(),
            });
            completions.push(receiver);
        }

        // Scheduling is done; release the gate so the next publish can enter
        // selection while this one's asynchronous handlers run.
        drop(gate);

        let wait_all = futures_util::future::join_all(completions);
        if let Some(timeout) = event.routing.timeout() {
            tokio::select! {
                () = token.cancelled() => {}
                outcome = tokio::time::timeout(timeout, wait_all) => {
                    if outcome.is_err() {
                        shared.mark_timed_out();
                        tracing::warn!(
                            event = %event.event_id,
                            timeout_ms = timeout.as_millis() as u64,
                            "publish timed out waiting for asynchronous handlers"
                        );
                    }
                }
            }
        } else {
            tokio::select! {
                () = token.cancelled() => {}
                _ = wait_all => {}
            }
        }

        self.dead_letter_if_undeliverable(&event, &result).await;
        Ok(result)
    }

    /// Applies the eligibility rules, in order, to every subscription.
    async fn select_subscriptions(
        &self,
        event: &Event,
        token: &CancellationToken,
    ) -> Vec<Subscription> {
        let candidates: Vec<Subscription> = self
            .subscriptions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        // Fetched once, lazily: topology fan-out for this event's device.
        let mut connected: Option<Vec<Uuid>> = None;
        let mut eligible = Vec::new();

        for subscription in candidates {
            let options = &subscription.options;
            let handler_target = subscription.handler.target_id().unwrap_or(Uuid::nil());

            // 1. Explicit targets take precedence over every other rule.
            if !event.routing.target_ids.is_empty()
                && !event.routing.target_ids.contains(&handler_target)
            {
                continue;
            }
            // 2. Event type filter.
            if !options.event_types.is_empty()
                && !options.event_types.contains(&event.event_type)
            {
                continue;
            }
            // 3. Source filter.
            if !options.source_ids.is_empty() && !options.source_ids.contains(&event.device_id) {
                continue;
            }
            // 4. Topology: the handler must be a connection target of the
            //    event's device.
            if options.include_connected_sources {
                if connected.is_none() {
                    connected =
                        Some(self.topology.connection_targets(event.device_id, token).await);
                }
                if connected
                    .as_ref()
                    .is_some_and(|targets| !targets.contains(&handler_target))
                {
                    continue;
                }
            }
            // 5. Custom predicate.
            if let Some(filter) = &options.filter {
                if !filter(event) {
                    continue;
                }
            }
            eligible.push(subscription);
        }
        eligible
    }

    /// Routes the event to the dead-letter store when it asked for
    /// persistence and no handler succeeded (or the publish timed out).
    async fn dead_letter_if_undeliverable(&self, event: &Event, result: &PublishResult) {
        if !event.routing.persist {
            return;
        }
        let undeliverable = result.timed_out()
            || (result.handler_count() > 0 && result.success_count() == 0);
        if !undeliverable {
            return;
        }
        if let Some(store) = &self.failed_events {
            if let Err(err) = store.store_failed(event).await {
                tracing::error!(event = %event.event_id, error = %err, "dead-letter store failed");
            }
        }
    }
}

/// The bus itself can sit in a component's event-handler slot: events the
/// component emits are published to all matching subscriptions.
///
/// Partial handler failures stay in the [`PublishResult`]; the seat reports
/// an error only when the publish timed out or every eligible handler
/// failed, so an emitter learns its event went nowhere.
#[async_trait::async_trait]
impl EventHandler for EventBus {
    async fn handle_event(
        &self,
        sender_id: Uuid,
        event: &Event,
        token: &CancellationToken,
    ) -> anyhow::Result<()> {
        let result = self.publish(sender_id, event.clone(), token).await?;
        if result.timed_out() {
            return Err(FabricError::Timeout {
                timeout_ms: event.routing.timeout_ms.unwrap_or_default(),
            }
            .into());
        }
        let errors = result.errors();
        if result.handler_count() > 0 && result.success_count() == 0 && !errors.is_empty() {
            return Err(FabricError::HandlerFailure(errors.join("; ")).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use verdant_core::{
        EventType, PropertyMetadata, PropertyValue, Priority, RoutingData,
    };

    use super::*;
    use crate::bus::condition::{ConditionEvaluator, PropertySource};
    use crate::bus::dead_letter::InMemoryFailedEventStore;

    struct EmptySource;

    #[async_trait]
    impl PropertySource for EmptySource {
        async fn property(
            &self,
            _device_id: Uuid,
            _name: &str,
            _token: &CancellationToken,
        ) -> Option<PropertyValue> {
            None
        }
    }

    struct RecordingHandler {
        target: Option<Uuid>,
        delay: Duration,
        fail: bool,
        calls: AtomicUsize,
        seen: Mutex<Vec<Uuid>>,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                target: None,
                delay: Duration::ZERO,
                fail: false,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn with_target(target: Uuid) -> Arc<Self> {
            Arc::new(Self {
                target: Some(target),
                delay: Duration::ZERO,
                fail: false,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                target: None,
                delay: Duration::ZERO,
                fail: true,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                target: None,
                delay,
                fail: false,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle_event(
            &self,
            _sender_id: Uuid,
            event: &Event,
            _token: &CancellationToken,
        ) -> anyhow::Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(event.event_id);
            if self.fail {
                anyhow::bail!("handler rejected event");
            }
            Ok(())
        }

        fn target_id(&self) -> Option<Uuid> {
            self.target
        }
    }

    struct BusFixture {
        bus: EventBus,
        topology: Arc<TopologyService>,
        queue: Arc<EventQueueProcessor>,
        failed: Arc<InMemoryFailedEventStore>,
    }

    fn make_bus() -> BusFixture {
        let evaluator = ConditionEvaluator::new(Arc::new(EmptySource) as Arc<dyn PropertySource>);
        let topology = Arc::new(TopologyService::new(evaluator));
        let queue = EventQueueProcessor::start(
            2,
            Duration::from_millis(2),
            Duration::from_secs(5),
        );
        let failed = Arc::new(InMemoryFailedEventStore::new());
        let bus = EventBus::new(Arc::clone(&topology), Arc::clone(&queue))
            .with_failed_event_store(Arc::clone(&failed) as Arc<dyn FailedEventStore>);
        BusFixture {
            bus,
            topology,
            queue,
            failed,
        }
    }

    fn property_event(device: Uuid, routing: RoutingData) -> Event {
        Event::property_changed(
            device,
            "FlowRate",
            PropertyValue::Null,
            PropertyValue::Int(50),
            PropertyMetadata::editable("FlowRate"),
            routing,
        )
    }

    #[tokio::test]
    async fn unfiltered_subscription_receives_event() {
        let fx = make_bus();
        let token = CancellationToken::new();
        let handler = RecordingHandler::new();
        fx.bus.subscribe(
            handler.clone() as Arc<dyn EventHandler>,
            SubscriptionOptions::default(),
        );

        let device = Uuid::new_v4();
        let result = fx
            .bus
            .publish(device, property_event(device, RoutingData::default()), &token)
            .await
            .unwrap();

        assert_eq!(result.handler_count(), 1);
        assert!(
            tokio::time::timeout(Duration::from_secs(1), async {
                while handler.call_count() == 0 {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            })
            .await
            .is_ok()
        );
        assert_eq!(result.success_count(), 1);
        assert!(result.is_complete());
        fx.queue.shutdown().await;
    }

    #[tokio::test]
    async fn handler_invoked_at_most_once_per_event() {
        let fx = make_bus();
        let token = CancellationToken::new();
        let handler = RecordingHandler::new();
        fx.bus.subscribe(
            handler.clone() as Arc<dyn EventHandler>,
            SubscriptionOptions::default().synchronous(),
        );

        let device = Uuid::new_v4();
        fx.bus
            .publish(device, property_event(device, RoutingData::default()), &token)
            .await
            .unwrap();
        assert_eq!(handler.call_count(), 1);
        fx.queue.shutdown().await;
    }

    #[tokio::test]
    async fn event_type_filter_skips_other_types() {
        let fx = make_bus();
        let token = CancellationToken::new();
        let handler = RecordingHandler::new();
        fx.bus.subscribe(
            handler.clone() as Arc<dyn EventHandler>,
            SubscriptionOptions::default()
                .with_event_types([EventType::Command])
                .synchronous(),
        );

        let device = Uuid::new_v4();
        let result = fx
            .bus
            .publish(device, property_event(device, RoutingData::default()), &token)
            .await
            .unwrap();
        assert_eq!(result.handler_count(), 0);
        assert_eq!(handler.call_count(), 0);
        fx.queue.shutdown().await;
    }

    #[tokio::test]
    async fn source_filter_skips_other_devices() {
        let fx = make_bus();
        let token = CancellationToken::new();
        let watched = Uuid::new_v4();
        let handler = RecordingHandler::new();
        fx.bus.subscribe(
            handler.clone() as Arc<dyn EventHandler>,
            SubscriptionOptions::default()
                .with_source_ids([watched])
                .synchronous(),
        );

        let other = Uuid::new_v4();
        let skipped = fx
            .bus
            .publish(other, property_event(other, RoutingData::default()), &token)
            .await
            .unwrap();
        assert_eq!(skipped.handler_count(), 0);

        let matched = fx
            .bus
            .publish(watched, property_event(watched, RoutingData::default()), &token)
            .await
            .unwrap();
        assert_eq!(matched.handler_count(), 1);
        assert_eq!(handler.call_count(), 1);
        fx.queue.shutdown().await;
    }

    #[tokio::test]
    async fn explicit_targets_restrict_delivery() {
        let fx = make_bus();
        let token = CancellationToken::new();
        let target = Uuid::new_v4();
        let targeted = RecordingHandler::with_target(target);
        let untargeted = RecordingHandler::new();
        fx.bus.subscribe(
            targeted.clone() as Arc<dyn EventHandler>,
            SubscriptionOptions::default().synchronous(),
        );
        fx.bus.subscribe(
            untargeted.clone() as Arc<dyn EventHandler>,
            SubscriptionOptions::default().synchronous(),
        );

        let device = Uuid::new_v4();
        let routing = RoutingData::default().with_targets([target]);
        let result = fx
            .bus
            .publish(device, property_event(device, routing), &token)
            .await
            .unwrap();

        // Only the handler whose identity is among the targets is invoked.
        assert_eq!(result.handler_count(), 1);
        assert_eq!(targeted.call_count(), 1);
        assert_eq!(untargeted.call_count(), 0);
        fx.queue.shutdown().await;
    }

    #[tokio::test]
    async fn connected_sources_follow_topology() {
        let fx = make_bus();
        let token = CancellationToken::new();
        let device = Uuid::new_v4();
        let connected_target = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        fx.topology.add_connection(device, connected_target, None);

        let connected = RecordingHandler::with_target(connected_target);
        let unconnected = RecordingHandler::with_target(stranger);
        fx.bus.subscribe(
            connected.clone() as Arc<dyn EventHandler>,
            SubscriptionOptions::default().connected_sources_only().synchronous(),
        );
        fx.bus.subscribe(
            unconnected.clone() as Arc<dyn EventHandler>,
            SubscriptionOptions::default().connected_sources_only().synchronous(),
        );

        let result = fx
            .bus
            .publish(device, property_event(device, RoutingData::default()), &token)
            .await
            .unwrap();

        assert_eq!(result.handler_count(), 1);
        assert_eq!(connected.call_count(), 1);
        assert_eq!(unconnected.call_count(), 0);
        fx.queue.shutdown().await;
    }

    #[tokio::test]
    async fn predicate_filter_applies_last() {
        let fx = make_bus();
        let token = CancellationToken::new();
        let handler = RecordingHandler::new();
        fx.bus.subscribe(
            handler.clone() as Arc<dyn EventHandler>,
            SubscriptionOptions::default()
                .synchronous()
                .with_filter(|event| event.property_name() == Some("Ph")),
        );

        let device = Uuid::new_v4();
        let skipped = fx
            .bus
            .publish(device, property_event(device, RoutingData::default()), &token)
            .await
            .unwrap();
        assert_eq!(skipped.handler_count(), 0);
        fx.queue.shutdown().await;
    }

    #[tokio::test]
    async fn sync_failure_does_not_cancel_siblings() {
        let fx = make_bus();
        let token = CancellationToken::new();
        let bad = RecordingHandler::failing();
        let good = RecordingHandler::new();
        fx.bus.subscribe(
            bad.clone() as Arc<dyn EventHandler>,
            SubscriptionOptions::default().synchronous(),
        );
        fx.bus.subscribe(
            good.clone() as Arc<dyn EventHandler>,
            SubscriptionOptions::default().synchronous(),
        );

        let device = Uuid::new_v4();
        let result = fx
            .bus
            .publish(device, property_event(device, RoutingData::default()), &token)
            .await
            .unwrap();

        assert_eq!(result.handler_count(), 2);
        assert_eq!(result.success_count(), 1);
        assert_eq!(result.failure_count(), 1);
        assert!(!result.is_complete());
        assert_eq!(good.call_count(), 1);
        fx.queue.shutdown().await;
    }

    #[tokio::test]
    async fn timeout_then_late_completion_still_counts() {
        let fx = make_bus();
        let token = CancellationToken::new();
        let slow = RecordingHandler::slow(Duration::from_millis(100));
        fx.bus.subscribe(
            slow.clone() as Arc<dyn EventHandler>,
            SubscriptionOptions::default(),
        );

        let device = Uuid::new_v4();
        let routing = RoutingData::default().with_timeout(Duration::from_millis(10));
        let result = fx
            .bus
            .publish(device, property_event(device, routing), &token)
            .await
            .unwrap();

        assert!(result.timed_out());
        assert_eq!(result.success_count(), 0);

        // The handler finishes after the timeout; its success still lands.
        tokio::time::timeout(Duration::from_secs(1), async {
            while result.success_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("late completion should increment the counter");
        assert_eq!(result.success_count(), 1);
        assert!(result.timed_out());
        fx.queue.shutdown().await;
    }

    #[tokio::test]
    async fn persistent_event_with_all_failures_is_dead_lettered() {
        let fx = make_bus();
        let token = CancellationToken::new();
        let bad = RecordingHandler::failing();
        fx.bus.subscribe(
            bad as Arc<dyn EventHandler>,
            SubscriptionOptions::default().synchronous(),
        );

        let device = Uuid::new_v4();
        let routing = RoutingData::default().persisted();
        fx.bus
            .publish(device, property_event(device, routing), &token)
            .await
            .unwrap();

        assert_eq!(fx.failed.len(), 1);
        fx.queue.shutdown().await;
    }

    #[tokio::test]
    async fn successful_persistent_event_is_not_dead_lettered() {
        let fx = make_bus();
        let token = CancellationToken::new();
        let good = RecordingHandler::new();
        fx.bus.subscribe(
            good as Arc<dyn EventHandler>,
            SubscriptionOptions::default().synchronous(),
        );

        let device = Uuid::new_v4();
        fx.bus
            .publish(
                device,
                property_event(device, RoutingData::default().persisted()),
                &token,
            )
            .await
            .unwrap();

        assert!(fx.failed.is_empty());
        fx.queue.shutdown().await;
    }

    #[tokio::test]
    async fn handler_seat_reports_timeout() {
        let fx = make_bus();
        let token = CancellationToken::new();
        let slow = RecordingHandler::slow(Duration::from_millis(100));
        fx.bus.subscribe(
            slow as Arc<dyn EventHandler>,
            SubscriptionOptions::default(),
        );

        let device = Uuid::new_v4();
        let routing = RoutingData::default().with_timeout(Duration::from_millis(10));
        let err = fx
            .bus
            .handle_event(device, &property_event(device, routing), &token)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        fx.queue.shutdown().await;
    }

    #[tokio::test]
    async fn handler_seat_reports_total_failure() {
        let fx = make_bus();
        let token = CancellationToken::new();
        let bad = RecordingHandler::failing();
        fx.bus.subscribe(
            bad as Arc<dyn EventHandler>,
            SubscriptionOptions::default().synchronous(),
        );

        let device = Uuid::new_v4();
        let err = fx
            .bus
            .handle_event(device, &property_event(device, RoutingData::default()), &token)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("handler failure"));
        fx.queue.shutdown().await;
    }

    #[tokio::test]
    async fn handler_seat_tolerates_partial_failure() {
        let fx = make_bus();
        let token = CancellationToken::new();
        let bad = RecordingHandler::failing();
        let good = RecordingHandler::new();
        fx.bus.subscribe(
            bad as Arc<dyn EventHandler>,
            SubscriptionOptions::default().synchronous(),
        );
        fx.bus.subscribe(
            good as Arc<dyn EventHandler>,
            SubscriptionOptions::default().synchronous(),
        );

        let device = Uuid::new_v4();
        fx.bus
            .handle_event(device, &property_event(device, RoutingData::default()), &token)
            .await
            .unwrap();
        fx.queue.shutdown().await;
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let fx = make_bus();
        let token = CancellationToken::new();
        let handler = RecordingHandler::new();
        let id = fx.bus.subscribe(
            handler.clone() as Arc<dyn EventHandler>,
            SubscriptionOptions::default().synchronous(),
        );

        assert!(fx.bus.unsubscribe(id));
        assert!(!fx.bus.unsubscribe(id));

        let device = Uuid::new_v4();
        let result = fx
            .bus
            .publish(device, property_event(device, RoutingData::default()), &token)
            .await
            .unwrap();
        assert_eq!(result.handler_count(), 0);
        assert_eq!(handler.call_count(), 0);
        fx.queue.shutdown().await;
    }

    #[tokio::test]
    async fn cancelled_publish_fails_before_dispatch() {
        let fx = make_bus();
        let token = CancellationToken::new();
        token.cancel();

        let device = Uuid::new_v4();
        let err = fx
            .bus
            .publish(device, property_event(device, RoutingData::default()), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::Cancelled));
        fx.queue.shutdown().await;
    }
}
