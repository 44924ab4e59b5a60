//! Metadata persistence: progress, fork-tracking state and dynamic
//! datasources, for crash-safe resume.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IndexerError;

/// Parameters a dynamic datasource was created with; enough to recreate it
/// from its template on restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicDatasourceParams {
    pub template_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    pub start_block: u64,
}

/// Persisted fork-tracking state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnfinalizedState {
    /// JSON array of `[height, hash]` pairs.
    pub unfinalized_blocks: String,
    pub last_finalized_verified_height: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexerMetadata {
    pub chain_id: Option<String>,
    pub last_processed_height: Option<u64>,
    /// Milliseconds since the Unix epoch.
    pub last_processed_timestamp: Option<i64>,
    pub last_finalized_verified_height: Option<u64>,
    /// JSON text, see [`UnfinalizedState::unfinalized_blocks`].
    pub unfinalized_blocks: Option<String>,
    #[serde(default)]
    pub dynamic_datasources: Vec<DynamicDatasourceParams>,
}

impl IndexerMetadata {
    /// Forget progress and dynamic datasources above `target_height`.
    pub fn rollback(&mut self, target_height: u64) {
        if self.last_processed_height.map_or(false, |h| h > target_height) {
            self.last_processed_height = Some(target_height);
        }
        self.dynamic_datasources.retain(|d| d.start_block <= target_height);
    }
}

/// Storage for [`IndexerMetadata`] of one indexer.
///
/// Implementations include [`MemoryMetadataStore`] and the backends of the
/// `nearindex-storage` crate.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn load(&self) -> Result<Option<IndexerMetadata>, IndexerError>;

    /// Record the last fully indexed height and its block timestamp.
    async fn save_progress(&self, height: u64, timestamp_ms: i64) -> Result<(), IndexerError>;

    async fn save_unfinalized(&self, state: &UnfinalizedState) -> Result<(), IndexerError>;

    async fn save_dynamic_datasources(
        &self,
        params: &[DynamicDatasourceParams],
    ) -> Result<(), IndexerError>;

    async fn save_chain_id(&self, chain_id: &str) -> Result<(), IndexerError>;

    /// Discard everything recorded above `target_height`.
    async fn rollback(&self, target_height: u64) -> Result<(), IndexerError>;
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

/// In-memory metadata store for tests and ephemeral indexers.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    data: Mutex<Option<IndexerMetadata>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from existing metadata, as if restored after a restart.
    pub fn with_metadata(metadata: IndexerMetadata) -> Self {
        Self {
            data: Mutex::new(Some(metadata)),
        }
    }

    pub fn snapshot(&self) -> Option<IndexerMetadata> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Option<IndexerMetadata>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut IndexerMetadata)) {
        let mut guard = self.lock();
        f(guard.get_or_insert_with(IndexerMetadata::default));
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn load(&self) -> Result<Option<IndexerMetadata>, IndexerError> {
        Ok(self.snapshot())
    }

    async fn save_progress(&self, height: u64, timestamp_ms: i64) -> Result<(), IndexerError> {
        self.update(|m| {
            m.last_processed_height = Some(height);
            m.last_processed_timestamp = Some(timestamp_ms);
        });
        Ok(())
    }

    async fn save_unfinalized(&self, state: &UnfinalizedState) -> Result<(), IndexerError> {
        self.update(|m| {
            m.unfinalized_blocks = Some(state.unfinalized_blocks.clone());
            m.last_finalized_verified_height = state.last_finalized_verified_height;
        });
        Ok(())
    }

    async fn save_dynamic_datasources(
        &self,
        params: &[DynamicDatasourceParams],
    ) -> Result<(), IndexerError> {
        self.update(|m| m.dynamic_datasources = params.to_vec());
        Ok(())
    }

    async fn save_chain_id(&self, chain_id: &str) -> Result<(), IndexerError> {
        self.update(|m| m.chain_id = Some(chain_id.to_string()));
        Ok(())
    }

    async fn rollback(&self, target_height: u64) -> Result<(), IndexerError> {
        self.update(|m| m.rollback(target_height));
        Ok(())
    }
}
