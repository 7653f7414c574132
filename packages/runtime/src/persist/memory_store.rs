//! In-memory store backend for tests and demos.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use verdant_core::{FabricError, PropertyMetadata, PropertyValue, Result};

use crate::persist::store::{merge_metadata, DeviceStore, StagedWrite, StoreTransaction};

#[derive(Debug, Clone, Default)]
struct StoredDocument {
    properties: BTreeMap<String, PropertyValue>,
    metadata: BTreeMap<String, PropertyMetadata>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    documents: DashMap<Uuid, StoredDocument>,
    /// Number of upcoming commits to fail, for flush-retry tests.
    fail_commits: AtomicU32,
    commit_count: AtomicUsize,
}

/// DashMap-backed store with commit failure injection.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` commits fail with a store error.
    pub fn fail_next_commits(&self, n: u32) {
        self.inner.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Number of successfully committed transactions.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.inner.commit_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn device_count(&self) -> usize {
        self.inner.documents.len()
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn begin_transaction(
        &self,
        token: &CancellationToken,
    ) -> Result<Box<dyn StoreTransaction>> {
        if token.is_cancelled() {
            return Err(FabricError::Cancelled);
        }
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            staged: BTreeMap::new(),
            finished: false,
        }))
    }

    async fn load(&self, device_id: Uuid) -> Result<BTreeMap<String, PropertyValue>> {
        Ok(self
            .inner
            .documents
            .get(&device_id)
            .map(|doc| doc.properties.clone())
            .unwrap_or_default())
    }

    async fn load_metadata(
        &self,
        device_id: Uuid,
    ) -> Result<BTreeMap<String, PropertyMetadata>> {
        Ok(self
            .inner
            .documents
            .get(&device_id)
            .map(|doc| doc.metadata.clone())
            .unwrap_or_default())
    }
}

#[derive(Debug)]
struct MemoryTransaction {
    inner: Arc<MemoryInner>,
    staged: BTreeMap<Uuid, StagedWrite>,
    finished: bool,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    fn save(&mut self, device_id: Uuid, properties: BTreeMap<String, PropertyValue>) {
        self.save_with_metadata(device_id, properties, None);
    }

    fn save_with_metadata(
        &mut self,
        device_id: Uuid,
        properties: BTreeMap<String, PropertyValue>,
        metadata: Option<BTreeMap<String, PropertyMetadata>>,
    ) {
        if self.finished {
            tracing::warn!(device = %device_id, "save on a finished transaction ignored");
            return;
        }
        self.staged.insert(
            device_id,
            StagedWrite {
                properties,
                metadata,
            },
        );
    }

    async fn commit(&mut self, token: &CancellationToken) -> Result<()> {
        if self.finished {
            return Err(FabricError::TransactionConflict(
                "transaction already finished".to_string(),
            ));
        }
        if token.is_cancelled() {
            return Err(FabricError::Cancelled);
        }

        // Failure injection happens before anything becomes observable.
        let remaining = self.inner.fail_commits.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inner
                .fail_commits
                .store(remaining - 1, Ordering::SeqCst);
            self.finished = true;
            return Err(FabricError::StoreIo(anyhow::anyhow!(
                "injected commit failure"
            )));
        }
        self.finished = true;

        for (device_id, staged) in std::mem::take(&mut self.staged) {
            let stored_metadata = self
                .inner
                .documents
                .get(&device_id)
                .map(|doc| doc.metadata.clone())
                .unwrap_or_default();
            self.inner.documents.insert(
                device_id,
                StoredDocument {
                    metadata: merge_metadata(stored_metadata, &staged),
                    properties: staged.properties,
                },
            );
        }
        self.inner.commit_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self, _token: &CancellationToken) -> Result<()> {
        self.staged.clear();
        self.finished = true;
        Ok(())
    }
}
