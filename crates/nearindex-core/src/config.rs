//! Indexer configuration and state types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::unfinalized::DEFAULT_ANCESTRY_JUMP_THRESHOLD;

/// Retry behaviour at the fetch boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    /// Caps exponential growth.
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Random jitter of up to `±jitter_fraction * backoff`.
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            jitter_fraction: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Configuration for an indexer instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Unique name, used as the metadata key.
    pub id: String,
    /// Expected chain id; checked against the node at startup when set.
    pub chain_id: Option<String>,
    /// NEAR JSON-RPC endpoint.
    pub endpoint: String,
    /// First height to index. `None` starts at the lowest datasource start block.
    pub start_block: Option<u64>,
    /// Optional last height. `None` = run forever.
    pub end_block: Option<u64>,
    /// Heights per fetch job.
    pub batch_size: u64,
    /// Concurrent fetch workers.
    pub workers: usize,
    /// Maximum heights fetched ahead of the indexed height.
    pub fetch_ahead: u64,
    pub poll_interval_ms: u64,
    /// Deadline for a single RPC call.
    pub request_timeout_ms: u64,
    /// Index above the finalized height and track forks.
    pub unfinalized_blocks: bool,
    pub bypass_blocks: Vec<u64>,
    pub retry: RetryConfig,
    pub ancestry_jump_threshold: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            id: "default".into(),
            chain_id: None,
            endpoint: "https://rpc.mainnet.near.org".into(),
            start_block: None,
            end_block: None,
            batch_size: 10,
            workers: 2,
            fetch_ahead: 100,
            poll_interval_ms: 1000,
            request_timeout_ms: 30_000,
            unfinalized_blocks: false,
            bypass_blocks: vec![],
            retry: RetryConfig::default(),
            ancestry_jump_threshold: DEFAULT_ANCESTRY_JUMP_THRESHOLD,
        }
    }
}

impl IndexerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), IndexerError> {
        let invalid = |msg: &str| Err(IndexerError::Configuration(msg.to_string()));
        if self.endpoint.is_empty() {
            return invalid("endpoint must not be empty");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1");
        }
        if self.workers == 0 {
            return invalid("workers must be at least 1");
        }
        if self.fetch_ahead < self.batch_size {
            return invalid("fetch_ahead must be at least batch_size");
        }
        if let (Some(start), Some(end)) = (self.start_block, self.end_block) {
            if end < start {
                return invalid("end_block must not be below start_block");
            }
        }
        if self.retry.multiplier < 1.0 || !(0.0..=1.0).contains(&self.retry.jitter_fraction) {
            return invalid("retry multiplier must be >= 1 and jitter_fraction within [0, 1]");
        }
        Ok(())
    }
}

/// Runtime state of the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    /// Not yet started.
    Idle,
    /// Indexing heights at or below the finalized height.
    Syncing,
    /// Caught up; following new blocks.
    Live,
    /// Discarding state above a rollback target.
    Rollback,
    Stopping,
    Stopped,
    /// Encountered an unrecoverable error.
    Error,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Syncing => write!(f, "syncing"),
            Self::Live => write!(f, "live"),
            Self::Rollback => write!(f, "rollback"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}
