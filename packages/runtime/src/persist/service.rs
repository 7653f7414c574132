//! Batching, transactional write-back cache between components and the store.
//!
//! The service is an [`EventHandler`]: components hand it property-changed
//! events, it updates its per-device hot set immediately and queues the
//! event for the next batch. A single processing task drains the queue,
//! coalesces to last-writer-wins per property, and commits one store
//! transaction per flush. Failed flushes keep their batch and retry with
//! jittered backoff; the hot set is not rolled back (readers already saw
//! the new values).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use verdant_core::{Event, EventPayload, FabricError, PropertyValue, Result};

use crate::bus::condition::PropertySource;
use crate::cache::LruCache;
use crate::component::device::Device;
use crate::component::handler::EventHandler;
use crate::config::RuntimeConfig;
use crate::monitor::{ComponentError, ErrorMonitor, ErrorSource, Severity};
use crate::persist::store::DeviceStore;

/// Error code reported to the monitor when a flush fails.
const FLUSH_FAILED_CODE: &str = "PERSISTENCE_FLUSH_FAILED";

/// Device snapshot held in the hot set: property name -> latest value.
type DeviceSnapshot = Arc<DashMap<String, PropertyValue>>;

/// Coalesced pending work: device -> property -> latest event.
type PendingBatch = HashMap<Uuid, BTreeMap<String, Arc<Event>>>;

enum ServiceMessage {
    Event(Arc<Event>),
    Flush(oneshot::Sender<std::result::Result<(), String>>),
}

/// Event-handling write-back persistence service.
///
/// The processing task keeps the service alive; call [`Self::shutdown`] to
/// wind it down (the task flushes the remaining batch before exiting).
pub struct PersistenceService {
    store: Arc<dyn DeviceStore>,
    monitor: Option<Arc<ErrorMonitor>>,
    cache: Arc<LruCache<Uuid, DeviceSnapshot>>,
    sender: mpsc::UnboundedSender<ServiceMessage>,
    /// Serializes flushes: at most one store transaction is in flight.
    flush_lock: tokio::sync::Mutex<()>,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    batch_interval: Duration,
    retry_backoff: Duration,
    shutdown_grace: Duration,
}

impl PersistenceService {
    /// Builds the service and spawns its processing task.
    #[must_use]
    pub fn start(
        store: Arc<dyn DeviceStore>,
        config: &RuntimeConfig,
        monitor: Option<Arc<ErrorMonitor>>,
    ) -> Arc<Self> {
        let mut cache = LruCache::new(config.cache_capacity);
        if let Some(expiration) = config.cache_expiration {
            cache = cache.with_expiration(expiration);
        }
        let cache = Arc::new(cache);

        let (sender, receiver) = mpsc::unbounded_channel();
        let service = Arc::new(Self {
            store,
            monitor,
            cache: Arc::clone(&cache),
            sender,
            flush_lock: tokio::sync::Mutex::new(()),
            token: CancellationToken::new(),
            task: Mutex::new(None),
            batch_interval: config.batch_interval,
            retry_backoff: config.flush_retry_backoff,
            shutdown_grace: config.shutdown_grace,
        });

        if let Some(interval) = config.cache_housekeeping_interval {
            // Ends on its own once the service token is cancelled.
            let _sweeper = cache.spawn_sweeper(interval, service.token.child_token());
        }

        let task = tokio::spawn(Self::run_loop(Arc::clone(&service), receiver));
        *service.task.lock() = Some(task);
        service
    }

    /// Registers a component with the service.
    ///
    /// The service becomes the component's event handler. Stored state, when
    /// present, is loaded into the component; otherwise the component's
    /// current properties are captured and persisted as its initial state.
    pub async fn add_or_update(
        self: &Arc<Self>,
        device: &dyn Device,
        token: &CancellationToken,
    ) -> Result<()> {
        let core = device.core();
        let handler: Arc<dyn EventHandler> = Arc::clone(self) as Arc<dyn EventHandler>;
        core.set_event_handler(Arc::downgrade(&handler));

        let stored = self.store.load(core.id()).await?;
        if stored.is_empty() {
            let properties = core.get_properties(token).await?;
            let metadata = core.get_all_property_metadata(token).await?;
            let mut tx = self.store.begin_transaction(token).await?;
            tx.save_with_metadata(core.id(), properties.clone(), Some(metadata));
            tx.commit(token).await?;
            self.cache.add_or_update(core.id(), snapshot_from(&properties));
            tracing::info!(device = %core.id(), "captured initial component state");
        } else {
            let metadata = self.store.load_metadata(core.id()).await?;
            core.load_properties(stored.clone(), Some(metadata), token)
                .await?;
            self.cache.add_or_update(core.id(), snapshot_from(&stored));
            tracing::info!(device = %core.id(), properties = stored.len(), "restored component state");
        }
        Ok(())
    }

    /// Reads a property from the hot set only; the store is never consulted.
    #[must_use]
    pub fn get_property(&self, device_id: Uuid, property_name: &str) -> Option<PropertyValue> {
        self.cache
            .try_get(&device_id)?
            .get(property_name)
            .map(|entry| entry.value().clone())
    }

    /// Drains the queue and forces one flush; used by shutdown hooks, timed
    /// flush triggers, and tests.
    ///
    /// # Errors
    ///
    /// Propagates the flush failure, or [`FabricError::Cancelled`] when the
    /// service has shut down.
    pub async fn process_pending_events(&self) -> Result<()> {
        let (ack, outcome) = oneshot::channel();
        self.sender
            .send(ServiceMessage::Flush(ack))
            .map_err(|_| FabricError::Cancelled)?;
        match outcome.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(FabricError::StoreIo(anyhow::anyhow!(message))),
            Err(_) => Err(FabricError::Cancelled),
        }
    }

    /// Stops the processing task: no new events are accepted, the remaining
    /// batch is flushed once, and the task is awaited within the grace
    /// period.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(self.shutdown_grace, task).await.is_err() {
                tracing::warn!("persistence task did not finish within the shutdown grace period");
            }
        }
    }

    fn snapshot_entry(&self, device_id: Uuid) -> DeviceSnapshot {
        if let Some(snapshot) = self.cache.try_get(&device_id) {
            return snapshot;
        }
        let snapshot: DeviceSnapshot = Arc::new(DashMap::new());
        self.cache.add_or_update(device_id, Arc::clone(&snapshot));
        snapshot
    }

    async fn run_loop(self: Arc<Self>, mut receiver: mpsc::UnboundedReceiver<ServiceMessage>) {
        let mut pending: PendingBatch = HashMap::new();
        let mut deadline = tokio::time::Instant::now() + self.batch_interval;

        loop {
            let mut acks = Vec::new();
            let mut timer_fired = false;

            tokio::select! {
                biased;
                () = self.token.cancelled() => break,
                message = receiver.recv() => {
                    let Some(message) = message else { break };
                    absorb(&mut pending, &mut acks, message);
                    // Greedy drain: coalesce everything already queued.
                    while let Ok(message) = receiver.try_recv() {
                        absorb(&mut pending, &mut acks, message);
                    }
                }
                () = tokio::time::sleep_until(deadline) => timer_fired = true,
            }

            // Sustained traffic must not postpone the batch interval forever.
            if tokio::time::Instant::now() >= deadline {
                timer_fired = true;
            }

            if timer_fired || !acks.is_empty() {
                let outcome = self.flush(&mut pending).await;
                deadline = tokio::time::Instant::now()
                    + match &outcome {
                        Ok(()) => self.batch_interval,
                        Err(_) => self.retry_delay(),
                    };
                let message = outcome.err().map(|err| err.to_string());
                for ack in acks {
                    let _ = ack.send(match &message {
                        None => Ok(()),
                        Some(message) => Err(message.clone()),
                    });
                }
            }
        }

        // Shutdown: absorb what is left and flush one final time.
        let mut acks = Vec::new();
        while let Ok(message) = receiver.try_recv() {
            absorb(&mut pending, &mut acks, message);
        }
        let outcome = self.flush(&mut pending).await;
        if let Err(err) = &outcome {
            tracing::error!(error = %err, "final persistence flush failed");
        }
        let message = outcome.err().map(|err| err.to_string());
        for ack in acks {
            let _ = ack.send(match &message {
                None => Ok(()),
                Some(message) => Err(message.clone()),
            });
        }
    }

    /// Commits the pending batch in one transaction. On failure the batch is
    /// merged back into `pending` so the next tick retries it.
    async fn flush(&self, pending: &mut PendingBatch) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let _serialized = self.flush_lock.lock().await;
        let batch = std::mem::take(pending);
        // The flush itself is not cancellable: a shutdown-time flush must
        // still be able to reach the store.
        let flush_token = CancellationToken::new();

        match self.commit_batch(&batch, &flush_token).await {
            Ok(()) => {
                tracing::debug!(devices = batch.len(), "persistence flush committed");
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, devices = batch.len(), "persistence flush failed");
                self.report_flush_failure(&err, &batch);
                // Retry next tick: merge the failed batch back, newer events
                // win over what was in flight.
                for (device_id, properties) in batch {
                    let slot = pending.entry(device_id).or_default();
                    for (name, event) in properties {
                        slot.entry(name).or_insert(event);
                    }
                }
                Err(err)
            }
        }
    }

    async fn commit_batch(
        &self,
        batch: &PendingBatch,
        token: &CancellationToken,
    ) -> Result<()> {
        let mut tx = self.store.begin_transaction(token).await?;
        for (device_id, properties) in batch {
            let snapshot = self.snapshot_entry(*device_id);
            let mut metadata = BTreeMap::new();
            for (name, event) in properties {
                if let EventPayload::PropertyChanged {
                    new_value,
                    metadata: event_metadata,
                    ..
                } = &event.payload
                {
                    snapshot.insert(name.clone(), new_value.clone());
                    metadata.insert(name.clone(), event_metadata.clone());
                }
            }
            let merged: BTreeMap<String, PropertyValue> = snapshot
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect();
            tx.save_with_metadata(*device_id, merged, Some(metadata));
        }
        match tx.commit(token).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Err(rollback_err) = tx.rollback(token).await {
                    tracing::debug!(error = %rollback_err, "rollback after failed commit");
                }
                Err(err)
            }
        }
    }

    fn report_flush_failure(&self, err: &FabricError, batch: &PendingBatch) {
        let Some(monitor) = &self.monitor else {
            return;
        };
        for device_id in batch.keys() {
            monitor.report(
                ComponentError::new(
                    *device_id,
                    FLUSH_FAILED_CODE,
                    "batched property flush failed",
                    Severity::Error,
                    ErrorSource::Persistence,
                )
                .with_exception(err.to_string()),
            );
        }
    }

    /// Retry delay with jitter so repeated failures do not thrash the store.
    fn retry_delay(&self) -> Duration {
        let base = self.retry_backoff.as_millis().max(1);
        let jittered = rand::rng().random_range(base..base * 2);
        Duration::from_millis(u64::try_from(jittered).unwrap_or(u64::MAX))
    }
}

fn snapshot_from(properties: &BTreeMap<String, PropertyValue>) -> DeviceSnapshot {
    let snapshot = DashMap::new();
    for (name, value) in properties {
        snapshot.insert(name.clone(), value.clone());
    }
    Arc::new(snapshot)
}

fn absorb(
    pending: &mut PendingBatch,
    acks: &mut Vec<oneshot::Sender<std::result::Result<(), String>>>,
    message: ServiceMessage,
) {
    match message {
        ServiceMessage::Event(event) => {
            if let Some(name) = event.property_name() {
                pending
                    .entry(event.device_id)
                    .or_default()
                    .insert(name.to_string(), event);
            }
        }
        ServiceMessage::Flush(ack) => acks.push(ack),
    }
}

#[async_trait]
impl EventHandler for PersistenceService {
    /// Property-changed events update the hot set and join the next batch;
    /// other event types are ignored.
    async fn handle_event(
        &self,
        _sender_id: Uuid,
        event: &Event,
        _token: &CancellationToken,
    ) -> anyhow::Result<()> {
        let EventPayload::PropertyChanged {
            property_name,
            new_value,
            ..
        } = &event.payload
        else {
            return Ok(());
        };

        let snapshot = self.snapshot_entry(event.device_id);
        snapshot.insert(property_name.clone(), new_value.clone());

        self.sender
            .send(ServiceMessage::Event(Arc::new(event.clone())))
            .map_err(|_| anyhow::anyhow!("persistence service is shut down"))
    }
}

#[async_trait]
impl PropertySource for PersistenceService {
    async fn property(
        &self,
        device_id: Uuid,
        name: &str,
        _token: &CancellationToken,
    ) -> Option<PropertyValue> {
        self.get_property(device_id, name)
    }
}

#[cfg(test)]
mod tests {
    use verdant_core::{PropertyMetadata, RoutingData};

    use super::*;
    use crate::persist::memory_store::MemoryStore;

    fn quick_config() -> RuntimeConfig {
        RuntimeConfig {
            batch_interval: Duration::from_millis(50),
            flush_retry_backoff: Duration::from_millis(20),
            ..RuntimeConfig::default()
        }
    }

    fn property_event(device: Uuid, name: &str, value: i64) -> Event {
        Event::property_changed(
            device,
            name,
            PropertyValue::Null,
            PropertyValue::Int(value),
            PropertyMetadata::editable(name),
            RoutingData::default(),
        )
    }

    #[tokio::test]
    async fn handle_event_updates_hot_set_immediately() {
        let store = Arc::new(MemoryStore::new());
        let service = PersistenceService::start(
            store.clone() as Arc<dyn DeviceStore>,
            &quick_config(),
            None,
        );
        let token = CancellationToken::new();
        let device = Uuid::new_v4();

        service
            .handle_event(device, &property_event(device, "FlowRate", 10), &token)
            .await
            .unwrap();

        assert_eq!(
            service.get_property(device, "FlowRate"),
            Some(PropertyValue::Int(10))
        );
        // Nothing hits the store until a flush happens.
        assert_eq!(store.commit_count(), 0);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn batch_coalesces_to_last_writer_per_property() {
        let store = Arc::new(MemoryStore::new());
        let service = PersistenceService::start(
            store.clone() as Arc<dyn DeviceStore>,
            &quick_config(),
            None,
        );
        let token = CancellationToken::new();
        let device = Uuid::new_v4();

        for value in [10, 20, 30, 40, 50] {
            service
                .handle_event(device, &property_event(device, "FlowRate", value), &token)
                .await
                .unwrap();
        }
        service.process_pending_events().await.unwrap();

        let stored = store.load(device).await.unwrap();
        assert_eq!(stored["FlowRate"], PropertyValue::Int(50));
        assert_eq!(store.commit_count(), 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn flush_merges_into_existing_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let service = PersistenceService::start(
            store.clone() as Arc<dyn DeviceStore>,
            &quick_config(),
            None,
        );
        let token = CancellationToken::new();
        let device = Uuid::new_v4();

        service
            .handle_event(device, &property_event(device, "FlowRate", 10), &token)
            .await
            .unwrap();
        service.process_pending_events().await.unwrap();

        service
            .handle_event(device, &property_event(device, "Pressure", 3), &token)
            .await
            .unwrap();
        service.process_pending_events().await.unwrap();

        // The second flush persists the union, not just the delta.
        let stored = store.load(device).await.unwrap();
        assert_eq!(stored["FlowRate"], PropertyValue::Int(10));
        assert_eq!(stored["Pressure"], PropertyValue::Int(3));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn interval_flush_fires_without_explicit_trigger() {
        let store = Arc::new(MemoryStore::new());
        let service = PersistenceService::start(
            store.clone() as Arc<dyn DeviceStore>,
            &quick_config(),
            None,
        );
        let token = CancellationToken::new();
        let device = Uuid::new_v4();

        service
            .handle_event(device, &property_event(device, "FlowRate", 42), &token)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while store.commit_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("interval flush should commit");
        assert_eq!(
            store.load(device).await.unwrap()["FlowRate"],
            PropertyValue::Int(42)
        );
        service.shutdown().await;
    }

    #[tokio::test]
    async fn failed_flush_reports_and_retries() {
        let store = Arc::new(MemoryStore::new());
        let monitor = Arc::new(ErrorMonitor::new(100));
        let service = PersistenceService::start(
            store.clone() as Arc<dyn DeviceStore>,
            &quick_config(),
            Some(Arc::clone(&monitor)),
        );
        let token = CancellationToken::new();
        let device = Uuid::new_v4();
        store.fail_next_commits(1);

        service
            .handle_event(device, &property_event(device, "FlowRate", 7), &token)
            .await
            .unwrap();
        let err = service.process_pending_events().await.unwrap_err();
        assert!(matches!(err, FabricError::StoreIo(_)));

        // The failure was reported against the device.
        let active = monitor.active_errors_for_device(device);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].error_code, FLUSH_FAILED_CODE);

        // The hot set kept the value, and the retry lands it in the store.
        assert_eq!(
            service.get_property(device, "FlowRate"),
            Some(PropertyValue::Int(7))
        );
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.commit_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("retry flush should commit");
        assert_eq!(
            store.load(device).await.unwrap()["FlowRate"],
            PropertyValue::Int(7)
        );
        service.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_flushes_remaining_events() {
        let store = Arc::new(MemoryStore::new());
        let config = RuntimeConfig {
            // Long interval: only the shutdown flush can persist the event.
            batch_interval: Duration::from_secs(600),
            ..quick_config()
        };
        let service =
            PersistenceService::start(store.clone() as Arc<dyn DeviceStore>, &config, None);
        let token = CancellationToken::new();
        let device = Uuid::new_v4();

        service
            .handle_event(device, &property_event(device, "FlowRate", 99), &token)
            .await
            .unwrap();
        service.shutdown().await;

        assert_eq!(
            store.load(device).await.unwrap()["FlowRate"],
            PropertyValue::Int(99)
        );

        // After shutdown, new events are refused.
        let err = service
            .handle_event(device, &property_event(device, "FlowRate", 1), &token)
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn non_property_events_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        let service = PersistenceService::start(
            store.clone() as Arc<dyn DeviceStore>,
            &quick_config(),
            None,
        );
        let token = CancellationToken::new();
        let device = Uuid::new_v4();

        let event = Event::error(device, "PUMP_STALL", "stalled", RoutingData::default());
        service.handle_event(device, &event, &token).await.unwrap();
        service.process_pending_events().await.unwrap();

        assert_eq!(store.commit_count(), 0);
        service.shutdown().await;
    }
}
