//! SQLite metadata backend for NearIndex.
//!
//! Persists indexer metadata (progress, fork-tracking state, dynamic
//! datasources) to one row per indexer in a single SQLite file. Uses `sqlx`
//! with WAL mode for concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use nearindex_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./index.db", "ft-transfers").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory("ft-transfers").await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use nearindex_core::error::IndexerError;
use nearindex_core::metadata::{
    DynamicDatasourceParams, IndexerMetadata, MetadataStore, UnfinalizedState,
};

/// SQLite-backed metadata storage scoped to one indexer id.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    indexer_id: String,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./index.db"`) or a full
    /// SQLite URL (`"sqlite:./index.db?mode=rwc"`).
    pub async fn open(path: &str, indexer_id: impl Into<String>) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;

        let storage = Self {
            pool,
            indexer_id: indexer_id.into(),
        };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// All data is lost when the pool is dropped. Ideal for tests.
    pub async fn in_memory(indexer_id: impl Into<String>) -> Result<Self, IndexerError> {
        // every connection to :memory: is its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;

        let storage = Self {
            pool,
            indexer_id: indexer_id.into(),
        };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// A handle on the same database scoped to `indexer_id`.
    pub fn for_indexer(&self, indexer_id: impl Into<String>) -> Self {
        Self {
            pool: self.pool.clone(),
            indexer_id: indexer_id.into(),
        }
    }

    pub fn indexer_id(&self) -> &str {
        &self.indexer_id
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS indexer_metadata (
                indexer_id                     TEXT    PRIMARY KEY,
                chain_id                       TEXT,
                last_processed_height          INTEGER,
                last_processed_timestamp       INTEGER,
                last_finalized_verified_height INTEGER,
                unfinalized_blocks             TEXT,
                dynamic_datasources            TEXT    NOT NULL DEFAULT '[]',
                updated_at                     INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| IndexerError::Storage(e.to_string()))?;

        Ok(())
    }

    /// Ids of every indexer with a metadata row, sorted.
    pub async fn indexer_ids(&self) -> Result<Vec<String>, IndexerError> {
        let rows = sqlx::query("SELECT indexer_id FROM indexer_metadata ORDER BY indexer_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;

        Ok(rows.iter().map(|r| r.get("indexer_id")).collect())
    }

    /// Insert the indexer's row if it is missing, so that column updates
    /// always have a row to hit.
    async fn ensure_row(&self) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT OR IGNORE INTO indexer_metadata (indexer_id, updated_at) VALUES (?, ?)",
        )
        .bind(&self.indexer_id)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| IndexerError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn write_dynamic(
        &self,
        params: &[DynamicDatasourceParams],
    ) -> Result<(), IndexerError> {
        let json =
            serde_json::to_string(params).map_err(|e| IndexerError::Storage(e.to_string()))?;

        self.ensure_row().await?;
        sqlx::query(
            "UPDATE indexer_metadata SET dynamic_datasources = ?, updated_at = ?
             WHERE indexer_id = ?",
        )
        .bind(&json)
        .bind(chrono::Utc::now().timestamp())
        .bind(&self.indexer_id)
        .execute(&self.pool)
        .await
        .map_err(|e| IndexerError::Storage(e.to_string()))?;

        Ok(())
    }
}

fn height(row: &SqliteRow, column: &str) -> Option<u64> {
    row.get::<Option<i64>, _>(column).map(|v| v as u64)
}

fn metadata_from_row(row: &SqliteRow) -> Result<IndexerMetadata, IndexerError> {
    let dynamic: String = row.get("dynamic_datasources");
    let dynamic_datasources = serde_json::from_str(&dynamic)
        .map_err(|e| IndexerError::Storage(format!("corrupt dynamic datasources: {e}")))?;

    Ok(IndexerMetadata {
        chain_id: row.get("chain_id"),
        last_processed_height: height(row, "last_processed_height"),
        last_processed_timestamp: row.get("last_processed_timestamp"),
        last_finalized_verified_height: height(row, "last_finalized_verified_height"),
        unfinalized_blocks: row.get("unfinalized_blocks"),
        dynamic_datasources,
    })
}

// ─── MetadataStore impl ──────────────────────────────────────────────────────

#[async_trait]
impl MetadataStore for SqliteStorage {
    async fn load(&self) -> Result<Option<IndexerMetadata>, IndexerError> {
        let row = sqlx::query(
            "SELECT chain_id, last_processed_height, last_processed_timestamp,
                    last_finalized_verified_height, unfinalized_blocks, dynamic_datasources
             FROM indexer_metadata WHERE indexer_id = ?",
        )
        .bind(&self.indexer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| IndexerError::Storage(e.to_string()))?;

        row.as_ref().map(metadata_from_row).transpose()
    }

    async fn save_progress(&self, height: u64, timestamp_ms: i64) -> Result<(), IndexerError> {
        self.ensure_row().await?;
        sqlx::query(
            "UPDATE indexer_metadata
             SET last_processed_height = ?, last_processed_timestamp = ?, updated_at = ?
             WHERE indexer_id = ?",
        )
        .bind(height as i64)
        .bind(timestamp_ms)
        .bind(chrono::Utc::now().timestamp())
        .bind(&self.indexer_id)
        .execute(&self.pool)
        .await
        .map_err(|e| IndexerError::Storage(e.to_string()))?;

        debug!(indexer_id = %self.indexer_id, height, "progress saved");
        Ok(())
    }

    async fn save_unfinalized(&self, state: &UnfinalizedState) -> Result<(), IndexerError> {
        self.ensure_row().await?;
        sqlx::query(
            "UPDATE indexer_metadata
             SET unfinalized_blocks = ?, last_finalized_verified_height = ?, updated_at = ?
             WHERE indexer_id = ?",
        )
        .bind(&state.unfinalized_blocks)
        .bind(state.last_finalized_verified_height.map(|h| h as i64))
        .bind(chrono::Utc::now().timestamp())
        .bind(&self.indexer_id)
        .execute(&self.pool)
        .await
        .map_err(|e| IndexerError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn save_dynamic_datasources(
        &self,
        params: &[DynamicDatasourceParams],
    ) -> Result<(), IndexerError> {
        self.write_dynamic(params).await?;
        debug!(indexer_id = %self.indexer_id, count = params.len(), "dynamic datasources saved");
        Ok(())
    }

    async fn save_chain_id(&self, chain_id: &str) -> Result<(), IndexerError> {
        self.ensure_row().await?;
        sqlx::query("UPDATE indexer_metadata SET chain_id = ?, updated_at = ? WHERE indexer_id = ?")
            .bind(chain_id)
            .bind(chrono::Utc::now().timestamp())
            .bind(&self.indexer_id)
            .execute(&self.pool)
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn rollback(&self, target_height: u64) -> Result<(), IndexerError> {
        let Some(mut metadata) = self.load().await? else {
            return Ok(());
        };
        metadata.rollback(target_height);

        sqlx::query(
            "UPDATE indexer_metadata SET last_processed_height = ?, updated_at = ?
             WHERE indexer_id = ?",
        )
        .bind(metadata.last_processed_height.map(|h| h as i64))
        .bind(chrono::Utc::now().timestamp())
        .bind(&self.indexer_id)
        .execute(&self.pool)
        .await
        .map_err(|e| IndexerError::Storage(e.to_string()))?;

        self.write_dynamic(&metadata.dynamic_datasources).await?;

        debug!(indexer_id = %self.indexer_id, target_height, "rolled back metadata");
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dynamic(start_block: u64, args: Option<serde_json::Value>) -> DynamicDatasourceParams {
        DynamicDatasourceParams {
            template_name: "Pool".into(),
            args,
            start_block,
        }
    }

    #[tokio::test]
    async fn empty_database_loads_nothing() {
        let store = SqliteStorage::in_memory("ft").await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        assert!(store.indexer_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn metadata_roundtrip() {
        let store = SqliteStorage::in_memory("ft").await.unwrap();

        store.save_chain_id("testnet").await.unwrap();
        store.save_progress(1_000, 1_700_000_000_123).await.unwrap();
        store
            .save_unfinalized(&UnfinalizedState {
                unfinalized_blocks: r#"[[999,"h999"],[1000,"h1000"]]"#.into(),
                last_finalized_verified_height: Some(998),
            })
            .await
            .unwrap();
        let params = vec![dynamic(900, Some(json!({ "pool": "ref.near" })))];
        store.save_dynamic_datasources(&params).await.unwrap();

        let meta = store.load().await.unwrap().unwrap();
        assert_eq!(meta.chain_id.as_deref(), Some("testnet"));
        assert_eq!(meta.last_processed_height, Some(1_000));
        assert_eq!(meta.last_processed_timestamp, Some(1_700_000_000_123));
        assert_eq!(meta.last_finalized_verified_height, Some(998));
        assert_eq!(
            meta.unfinalized_blocks.as_deref(),
            Some(r#"[[999,"h999"],[1000,"h1000"]]"#)
        );
        assert_eq!(meta.dynamic_datasources, params);
    }

    #[tokio::test]
    async fn progress_upsert() {
        let store = SqliteStorage::in_memory("ft").await.unwrap();
        store.save_progress(100, 1).await.unwrap();
        store.save_progress(200, 2).await.unwrap();

        let meta = store.load().await.unwrap().unwrap();
        assert_eq!(meta.last_processed_height, Some(200));
        assert_eq!(meta.last_processed_timestamp, Some(2));
    }

    #[tokio::test]
    async fn indexers_share_database_but_not_rows() {
        let ft = SqliteStorage::in_memory("ft").await.unwrap();
        let nft = ft.for_indexer("nft");

        ft.save_progress(10, 0).await.unwrap();
        nft.save_progress(20, 0).await.unwrap();

        assert_eq!(ft.load().await.unwrap().unwrap().last_processed_height, Some(10));
        assert_eq!(nft.load().await.unwrap().unwrap().last_processed_height, Some(20));
        assert_eq!(ft.indexer_ids().await.unwrap(), vec!["ft".to_string(), "nft".to_string()]);
    }

    #[tokio::test]
    async fn rollback_trims_progress_and_dynamic_datasources() {
        let store = SqliteStorage::in_memory("ft").await.unwrap();
        store.save_progress(200, 0).await.unwrap();
        store
            .save_dynamic_datasources(&[dynamic(150, None), dynamic(190, None)])
            .await
            .unwrap();

        store.rollback(180).await.unwrap();

        let meta = store.load().await.unwrap().unwrap();
        assert_eq!(meta.last_processed_height, Some(180));
        assert_eq!(meta.dynamic_datasources, vec![dynamic(150, None)]);

        // rolling back above the current height changes nothing
        store.rollback(500).await.unwrap();
        assert_eq!(store.load().await.unwrap().unwrap().last_processed_height, Some(180));
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        let path = path.to_str().unwrap();

        {
            let store = SqliteStorage::open(path, "ft").await.unwrap();
            store.save_chain_id("mainnet").await.unwrap();
            store.save_progress(42, 7).await.unwrap();
            store.pool.close().await;
        }

        let store = SqliteStorage::open(path, "ft").await.unwrap();
        let meta = store.load().await.unwrap().unwrap();
        assert_eq!(meta.chain_id.as_deref(), Some("mainnet"));
        assert_eq!(meta.last_processed_height, Some(42));
    }
}
