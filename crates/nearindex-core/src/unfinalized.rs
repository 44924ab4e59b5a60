//! Unfinalized block tracker: keeps the `(height, hash)` of every indexed
//! block above the finalized height and detects when finality disagrees
//! with what was indexed.
//!
//! # States
//!
//! ```text
//! Idle ──register_block──► Tracking ──check_for_fork (mismatch)──► ForkDetected
//!                              ▲                                        │
//!                              └───────────── rollback_to ──────────────┘
//! ```
//!
//! Only the coordinating side of the pipeline owns a tracker. Workers never
//! touch it.

use serde::{Deserialize, Serialize};

use crate::client::{BlockRef, ChainClient};
use crate::error::IndexerError;
use crate::metadata::{IndexerMetadata, UnfinalizedState};
use crate::types::Header;

/// Past this distance the ancestry walk requests the target height directly
/// instead of following parent hashes.
pub const DEFAULT_ANCESTRY_JUMP_THRESHOLD: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerState {
    Idle,
    Tracking,
    ForkDetected,
}

impl std::fmt::Display for TrackerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Tracking => write!(f, "tracking"),
            Self::ForkDetected => write!(f, "fork-detected"),
        }
    }
}

/// One indexed block above the finalized height. Persisted as
/// `[height, "hash"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(u64, String)", into = "(u64, String)")]
pub struct UnfinalizedBlockRecord {
    pub height: u64,
    pub hash: String,
}

impl From<(u64, String)> for UnfinalizedBlockRecord {
    fn from((height, hash): (u64, String)) -> Self {
        Self { height, hash }
    }
}

impl From<UnfinalizedBlockRecord> for (u64, String) {
    fn from(r: UnfinalizedBlockRecord) -> Self {
        (r.height, r.hash)
    }
}

/// Fork-detection state machine.
#[derive(Debug, Clone)]
pub struct UnfinalizedBlocks {
    /// Strictly increasing heights.
    records: Vec<UnfinalizedBlockRecord>,
    finalized: Option<Header>,
    last_finalized_verified_height: Option<u64>,
    /// Last height handed to `register_block` or `skip_height`.
    last_height: Option<u64>,
    state: TrackerState,
    jump_threshold: u64,
}

impl Default for UnfinalizedBlocks {
    fn default() -> Self {
        Self::new(DEFAULT_ANCESTRY_JUMP_THRESHOLD)
    }
}

impl UnfinalizedBlocks {
    pub fn new(jump_threshold: u64) -> Self {
        Self {
            records: Vec::new(),
            finalized: None,
            last_finalized_verified_height: None,
            last_height: None,
            state: TrackerState::Idle,
            jump_threshold: jump_threshold.max(1),
        }
    }

    /// Restore from persisted metadata.
    pub fn load(metadata: &IndexerMetadata, jump_threshold: u64) -> Result<Self, IndexerError> {
        let mut tracker = Self::new(jump_threshold);
        if let Some(json) = metadata.unfinalized_blocks.as_deref().filter(|s| !s.is_empty()) {
            let records: Vec<UnfinalizedBlockRecord> = serde_json::from_str(json).map_err(|e| {
                IndexerError::ForkIntegrity(format!("corrupt unfinalized blocks state: {e}"))
            })?;
            if let Some(pair) = records.windows(2).find(|w| w[1].height <= w[0].height) {
                return Err(IndexerError::ForkIntegrity(format!(
                    "persisted unfinalized heights out of order at {}",
                    pair[1].height
                )));
            }
            tracker.records = records;
        }
        tracker.last_finalized_verified_height = metadata.last_finalized_verified_height;
        tracker.last_height = metadata
            .last_processed_height
            .or_else(|| tracker.records.last().map(|r| r.height));
        tracing::debug!(
            records = tracker.records.len(),
            verified = ?tracker.last_finalized_verified_height,
            last = ?tracker.last_height,
            "Loaded unfinalized blocks"
        );
        Ok(tracker)
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn records(&self) -> &[UnfinalizedBlockRecord] {
        &self.records
    }

    pub fn finalized_header(&self) -> Option<&Header> {
        self.finalized.as_ref()
    }

    pub fn finalized_height(&self) -> Option<u64> {
        self.finalized.as_ref().map(|h| h.block_height)
    }

    pub fn last_finalized_verified_height(&self) -> Option<u64> {
        self.last_finalized_verified_height
    }

    fn expect_next(&self, height: u64) -> Result<(), IndexerError> {
        match self.last_height {
            Some(last) if height != last + 1 => Err(IndexerError::ForkIntegrity(format!(
                "unfinalized heights not contiguous: got {height} after {last}"
            ))),
            _ => Ok(()),
        }
    }

    /// Record an indexed block. Blocks at or below the finalized height
    /// only advance the contiguity cursor.
    pub fn register_block(&mut self, height: u64, hash: impl Into<String>) -> Result<(), IndexerError> {
        if self.state == TrackerState::ForkDetected {
            return Err(IndexerError::ForkIntegrity(format!(
                "block {height} registered while a rollback is pending"
            )));
        }
        self.expect_next(height)?;
        self.last_height = Some(height);
        if self.finalized_height().map_or(false, |f| height <= f) {
            return Ok(());
        }
        self.records.push(UnfinalizedBlockRecord {
            height,
            hash: hash.into(),
        });
        self.state = TrackerState::Tracking;
        Ok(())
    }

    /// Advance the contiguity cursor over a height that has no block.
    pub fn skip_height(&mut self, height: u64) -> Result<(), IndexerError> {
        self.expect_next(height)?;
        self.last_height = Some(height);
        Ok(())
    }

    /// Advance the contiguity cursor over `start..=end`, none of which
    /// hold a block the indexer needs.
    pub fn skip_range(&mut self, start: u64, end: u64) -> Result<(), IndexerError> {
        if end < start {
            return Ok(());
        }
        self.expect_next(start)?;
        self.last_height = Some(end);
        Ok(())
    }

    /// Cache a finalized header. Lower or equal heights are ignored.
    pub fn register_finalized_header(&mut self, header: Header) {
        if self.finalized_height().map_or(true, |f| header.block_height > f) {
            tracing::trace!(height = header.block_height, "New finalized header");
            self.finalized = Some(header);
        }
    }

    /// Compare the tracked record closest to finality with the canonical
    /// chain. Returns the canonical header where they disagree.
    pub async fn check_for_fork<C: ChainClient + ?Sized>(
        &mut self,
        client: &C,
    ) -> Result<Option<Header>, IndexerError> {
        let Some(finalized) = self.finalized.clone() else {
            return Ok(None);
        };
        let Some(record) = self
            .records
            .iter()
            .rev()
            .find(|r| r.height <= finalized.block_height)
            .cloned()
        else {
            return Ok(None);
        };

        let canonical = if record.height == finalized.block_height {
            finalized
        } else {
            self.ancestor_at(client, &finalized, record.height).await?
        };

        if canonical.block_height == record.height && canonical.block_hash == record.hash {
            return Ok(None);
        }

        tracing::warn!(
            height = record.height,
            tracked = %record.hash,
            canonical = %canonical.block_hash,
            "Fork detected in unfinalized blocks"
        );
        self.state = TrackerState::ForkDetected;
        Ok(Some(canonical))
    }

    /// Find the highest tracked height that is still canonical, walking back
    /// from `fork_header`.
    ///
    /// When no tracked record matches, falls back to the last finalized
    /// verified height (and logs it as an error). Without one, no safe
    /// target exists and a [`IndexerError::ForkIntegrity`] is returned.
    pub async fn rollback_target<C: ChainClient + ?Sized>(
        &self,
        client: &C,
        fork_header: &Header,
    ) -> Result<u64, IndexerError> {
        let mut checking = fork_header.clone();
        let candidates = self
            .records
            .iter()
            .rev()
            .filter(|r| r.height <= fork_header.block_height);

        for record in candidates {
            if checking.block_height > record.height {
                if checking.parent_hash == record.hash {
                    return Ok(record.height);
                }
                checking = self.ancestor_at(client, &checking, record.height).await?;
            }
            if checking.block_height == record.height && checking.block_hash == record.hash {
                return Ok(record.height);
            }
        }

        match self.last_finalized_verified_height {
            Some(verified) => {
                tracing::error!(
                    fork_height = fork_header.block_height,
                    fallback = verified,
                    tracked = self.records.len(),
                    "No common ancestor among unfinalized blocks, rolling back to last verified finalized height"
                );
                Ok(verified)
            }
            None => Err(IndexerError::ForkIntegrity(format!(
                "no common ancestor found for fork at {} and no verified finalized height",
                fork_header.block_height
            ))),
        }
    }

    /// Drop records confirmed by the finalized header.
    pub fn confirm_finalized(&mut self) {
        let Some(finalized) = self.finalized_height() else {
            return;
        };
        let before = self.records.len();
        self.records.retain(|r| r.height > finalized);
        if self
            .last_finalized_verified_height
            .map_or(true, |v| finalized > v)
        {
            self.last_finalized_verified_height = Some(finalized);
        }
        if before != self.records.len() {
            tracing::trace!(
                finalized,
                removed = before - self.records.len(),
                remaining = self.records.len(),
                "Confirmed finalized blocks"
            );
        }
    }

    /// Register `header`, check finality and either return a rollback
    /// target or confirm finalized records.
    pub async fn process_block<C: ChainClient + ?Sized>(
        &mut self,
        client: &C,
        header: &Header,
    ) -> Result<Option<u64>, IndexerError> {
        self.register_block(header.block_height, header.block_hash.clone())?;
        match self.check_for_fork(client).await? {
            Some(fork_header) => {
                let target = self.rollback_target(client, &fork_header).await?;
                tracing::warn!(
                    at = header.block_height,
                    target,
                    "Rollback required"
                );
                Ok(Some(target))
            }
            None => {
                self.confirm_finalized();
                Ok(None)
            }
        }
    }

    /// Discard records above `target` and resume tracking from there.
    pub fn rollback_to(&mut self, target: u64) {
        self.records.retain(|r| r.height <= target);
        self.last_height = Some(target);
        self.state = if self.records.is_empty() {
            TrackerState::Idle
        } else {
            TrackerState::Tracking
        };
    }

    /// State to persist for crash-safe resume.
    pub fn persisted_state(&self) -> Result<UnfinalizedState, IndexerError> {
        Ok(UnfinalizedState {
            unfinalized_blocks: serde_json::to_string(&self.records)?,
            last_finalized_verified_height: self.last_finalized_verified_height,
        })
    }

    /// Canonical header at `height`, or the first one below it when the
    /// chain produced no block there.
    async fn ancestor_at<C: ChainClient + ?Sized>(
        &self,
        client: &C,
        from: &Header,
        height: u64,
    ) -> Result<Header, IndexerError> {
        let mut current = from.clone();
        while current.block_height > height {
            current = if current.block_height - height > self.jump_threshold {
                client.get_header(BlockRef::Height(height)).await?
            } else {
                client
                    .get_header(BlockRef::Hash(current.parent_hash.clone()))
                    .await?
            };
        }
        Ok(current)
    }
}
