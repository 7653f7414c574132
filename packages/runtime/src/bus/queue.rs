//! Priority-banded event queue processor.
//!
//! One FIFO queue per priority band, each drained by its own fixed pool of
//! workers. Dedicated pools mean a flood of low-priority events can never
//! starve the critical band. Workers sleep briefly when their band is empty.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use verdant_core::{Event, Priority};

use crate::bus::publish::PublishShared;
use crate::component::handler::EventHandler;

/// One scheduled handler invocation.
pub struct QueueItem {
    pub event: Arc<Event>,
    pub sender_id: Uuid,
    pub handler: Arc<dyn EventHandler>,
    pub(crate) shared: Arc<PublishShared>,
    /// Always fired once the item has been processed (or abandoned).
    pub(crate) completion: oneshot::Sender<()>,
    pub token: CancellationToken,
}

#[derive(Default)]
struct Band {
    queue: Mutex<VecDeque<QueueItem>>,
}

/// Worker pool draining enqueued events, banded by priority.
pub struct EventQueueProcessor {
    bands: Arc<[Band; 4]>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    token: CancellationToken,
    shutdown_grace: Duration,
}

impl EventQueueProcessor {
    /// Starts `workers_per_band` workers for each priority band.
    #[must_use]
    pub fn start(
        workers_per_band: usize,
        idle_backoff: Duration,
        shutdown_grace: Duration,
    ) -> Arc<Self> {
        let processor = Arc::new(Self {
            bands: Arc::new([
                Band::default(),
                Band::default(),
                Band::default(),
                Band::default(),
            ]),
            workers: Mutex::new(Vec::new()),
            token: CancellationToken::new(),
            shutdown_grace,
        });

        let mut workers = Vec::with_capacity(workers_per_band * Priority::ALL.len());
        for band in Priority::ALL {
            for _ in 0..workers_per_band.max(1) {
                let bands = Arc::clone(&processor.bands);
                let token = processor.token.clone();
                workers.push(tokio::spawn(Self::worker_loop(
                    bands,
                    band.index(),
                    idle_backoff,
                    token,
                )));
            }
        }
        *processor.workers.lock() = workers;
        processor
    }

    /// Queues an item into the band chosen by its event's routing priority.
    pub fn enqueue(&self, item: QueueItem) {
        let band = item.event.routing.priority.index();
        self.bands[band].queue.lock().push_back(item);
    }

    /// Number of items currently queued across all bands.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.bands.iter().map(|band| band.queue.lock().len()).sum()
    }

    async fn worker_loop(
        bands: Arc<[Band; 4]>,
        band: usize,
        idle_backoff: Duration,
        token: CancellationToken,
    ) {
        loop {
            if token.is_cancelled() {
                break;
            }
            let item = bands[band].queue.lock().pop_front();
            match item {
                Some(item) => Self::process(item).await,
                None => {
                    tokio::select! {
                        () = token.cancelled() => break,
                        () = tokio::time::sleep(idle_backoff) => {}
                    }
                }
            }
        }
    }

    /// Invokes one handler, recording the outcome into the item's shared
    /// result. The completion signal always fires, even for cancelled items.
    async fn process(item: QueueItem) {
        let QueueItem {
            event,
            sender_id,
            handler,
            shared,
            completion,
            token,
        } = item;

        if !token.is_cancelled() {
            match handler.handle_event(sender_id, &event, &token).await {
                Ok(()) => shared.record_success(),
                Err(err) => {
                    tracing::debug!(event = %event.event_id, error = %err, "queued handler failed");
                    shared.record_failure(format!("{err:#}"));
                }
            }
        }
        // Receiver may be gone (publish timed out and dropped it).
        let _ = completion.send(());
    }

    /// Cancels all workers and waits for them, bounded by the shutdown grace.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        let drained =
            tokio::time::timeout(self.shutdown_grace, futures_util::future::join_all(workers))
                .await;
        if drained.is_err() {
            tracing::warn!("queue workers did not drain within the shutdown grace period");
        }
    }
}
