//! In-memory metadata storage shared between indexers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use nearindex_core::error::IndexerError;
use nearindex_core::metadata::{
    DynamicDatasourceParams, IndexerMetadata, MetadataStore, UnfinalizedState,
};

#[derive(Debug, Default)]
struct Entry {
    metadata: IndexerMetadata,
    updated_at: Option<DateTime<Utc>>,
}

/// In-memory storage keyed by indexer id.
///
/// Cloning is cheap and every clone sees the same data. Use
/// [`InMemoryStorage::for_indexer`] to get a view scoped to another indexer.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    indexer_id: String,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InMemoryStorage {
    pub fn new(indexer_id: impl Into<String>) -> Self {
        Self {
            indexer_id: indexer_id.into(),
            entries: Arc::default(),
        }
    }

    /// A view of the same storage scoped to `indexer_id`.
    pub fn for_indexer(&self, indexer_id: impl Into<String>) -> Self {
        Self {
            indexer_id: indexer_id.into(),
            entries: Arc::clone(&self.entries),
        }
    }

    pub fn indexer_id(&self) -> &str {
        &self.indexer_id
    }

    /// Ids of every indexer that has written metadata, sorted.
    pub fn indexer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn get(&self) -> Option<IndexerMetadata> {
        self.lock().get(&self.indexer_id).map(|e| e.metadata.clone())
    }

    /// When this indexer's metadata was last written.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.lock().get(&self.indexer_id).and_then(|e| e.updated_at)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut IndexerMetadata)) {
        let mut entries = self.lock();
        let entry = entries.entry(self.indexer_id.clone()).or_default();
        f(&mut entry.metadata);
        entry.updated_at = Some(Utc::now());
    }
}

#[async_trait]
impl MetadataStore for InMemoryStorage {
    async fn load(&self) -> Result<Option<IndexerMetadata>, IndexerError> {
        Ok(self.get())
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
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(&self.indexer_id) {
            entry.metadata.rollback(target_height);
            entry.updated_at = Some(Utc::now());
        }
        Ok(())
    }
}
