//! JSON file-per-device store backend.
//!
//! Layout: `<root>/<deviceId>.json`, each file an object with a `properties`
//! map and a parallel `metadata` map. Commits write to a temp file and
//! rename it into place, so readers observe either the old or the new
//! document, never a torn one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use verdant_core::{FabricError, PropertyMetadata, PropertyValue, Result};

use crate::persist::store::{merge_metadata, DeviceStore, StagedWrite, StoreTransaction};

/// On-disk document shape.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceDocument {
    #[serde(default)]
    properties: BTreeMap<String, PropertyValue>,
    #[serde(default)]
    metadata: BTreeMap<String, PropertyMetadata>,
}

/// File-per-device JSON store rooted at a configurable directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted at the default `<working directory>/DeviceData`.
    #[must_use]
    pub fn with_default_root() -> Self {
        Self::new(crate::config::default_store_root())
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(root: &Path, device_id: Uuid) -> PathBuf {
        root.join(format!("{device_id}.json"))
    }

    async fn read_document(root: &Path, device_id: Uuid) -> Result<Option<DeviceDocument>> {
        let path = Self::document_path(root, device_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl DeviceStore for JsonFileStore {
    async fn begin_transaction(
        &self,
        token: &CancellationToken,
    ) -> Result<Box<dyn StoreTransaction>> {
        if token.is_cancelled() {
            return Err(FabricError::Cancelled);
        }
        Ok(Box::new(JsonTransaction {
            root: self.root.clone(),
            staged: BTreeMap::new(),
            finished: false,
        }))
    }

    async fn load(&self, device_id: Uuid) -> Result<BTreeMap<String, PropertyValue>> {
        Ok(Self::read_document(&self.root, device_id)
            .await?
            .map(|doc| doc.properties)
            .unwrap_or_default())
    }

    async fn load_metadata(
        &self,
        device_id: Uuid,
    ) -> Result<BTreeMap<String, PropertyMetadata>> {
        Ok(Self::read_document(&self.root, device_id)
            .await?
            .map(|doc| doc.metadata)
            .unwrap_or_default())
    }
}

/// Write-buffered transaction over the file store.
#[derive(Debug)]
struct JsonTransaction {
    root: PathBuf,
    staged: BTreeMap<Uuid, StagedWrite>,
    finished: bool,
}

#[async_trait]
impl StoreTransaction for JsonTransaction {
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
        self.finished = true;

        tokio::fs::create_dir_all(&self.root).await?;
        for (device_id, staged) in std::mem::take(&mut self.staged) {
            let stored_metadata = JsonFileStore::read_document(&self.root, device_id)
                .await?
                .map(|doc| doc.metadata)
                .unwrap_or_default();

            let document = DeviceDocument {
                metadata: merge_metadata(stored_metadata, &staged),
                properties: staged.properties,
            };

            let bytes = serde_json::to_vec_pretty(&document)?;
            let path = JsonFileStore::document_path(&self.root, device_id);
            let tmp = path.with_extension("json.tmp");
            tokio::fs::write(&tmp, bytes).await?;
            tokio::fs::rename(&tmp, &path).await?;
            tracing::debug!(device = %device_id, path = %path.display(), "device document written");
        }
        Ok(())
    }

    async fn rollback(&mut self, _token: &CancellationToken) -> Result<()> {
        self.staged.clear();
        self.finished = true;
        Ok(())
    }
}
