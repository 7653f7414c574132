//! Transactional persistence contract.
//!
//! Transactions buffer their writes: nothing touches the backing medium
//! until `commit`, so dropping a transaction without committing *is* the
//! rollback. A committed transaction must be atomically observable to
//! subsequent `load` calls.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use verdant_core::{PropertyMetadata, PropertyValue, Result};

/// Per-device write staged inside a transaction.
#[derive(Debug, Clone, Default)]
pub(crate) struct StagedWrite {
    pub(crate) properties: BTreeMap<String, PropertyValue>,
    /// `None` keeps whatever metadata the store already holds for the
    /// device's unchanged properties.
    pub(crate) metadata: Option<BTreeMap<String, PropertyMetadata>>,
}

/// A scoped store operation that atomically commits per-device property maps.
#[async_trait]
pub trait StoreTransaction: Send + std::fmt::Debug {
    /// Stages the full property map for a device, replacing what is stored.
    /// Previously persisted metadata is kept for the surviving properties.
    fn save(&mut self, device_id: Uuid, properties: BTreeMap<String, PropertyValue>);

    /// Stages properties plus metadata. Provided metadata entries overlay
    /// the stored ones key by key.
    fn save_with_metadata(
        &mut self,
        device_id: Uuid,
        properties: BTreeMap<String, PropertyValue>,
        metadata: Option<BTreeMap<String, PropertyMetadata>>,
    );

    /// Applies all staged writes atomically.
    ///
    /// # Errors
    ///
    /// [`verdant_core::FabricError::StoreIo`] on backend failure;
    /// [`verdant_core::FabricError::TransactionConflict`] when the
    /// transaction was already finished.
    async fn commit(&mut self, token: &CancellationToken) -> Result<()>;

    /// Discards all staged writes. Dropping without commit has the same
    /// effect.
    async fn rollback(&mut self, token: &CancellationToken) -> Result<()>;
}

/// Transactional persistence for per-device property maps.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Opens a transaction.
    async fn begin_transaction(
        &self,
        token: &CancellationToken,
    ) -> Result<Box<dyn StoreTransaction>>;

    /// Loads the persisted property map, or an empty map when the device has
    /// never been saved.
    async fn load(&self, device_id: Uuid) -> Result<BTreeMap<String, PropertyValue>>;

    /// Loads the persisted metadata map, or an empty map.
    async fn load_metadata(
        &self,
        device_id: Uuid,
    ) -> Result<BTreeMap<String, PropertyMetadata>>;
}

/// Merges staged metadata over what is already stored, keeping stored
/// entries for properties the stage did not mention.
pub(crate) fn merge_metadata(
    stored: BTreeMap<String, PropertyMetadata>,
    staged: &StagedWrite,
) -> BTreeMap<String, PropertyMetadata> {
    let mut merged: BTreeMap<String, PropertyMetadata> = stored
        .into_iter()
        .filter(|(name, _)| staged.properties.contains_key(name))
        .collect();
    if let Some(staged_metadata) = &staged.metadata {
        for (name, metadata) in staged_metadata {
            merged.insert(name.clone(), metadata.clone());
        }
    }
    merged
}
