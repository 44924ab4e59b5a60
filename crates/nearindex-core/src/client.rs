//! The chain access boundary consumed by the tracker and the dispatcher.

use async_trait::async_trait;

use crate::error::IndexerError;
use crate::raw::RawBlock;
use crate::types::Header;

/// Address of a block: by height or by hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BlockRef {
    Height(u64),
    Hash(String),
}

impl std::fmt::Display for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Height(h) => write!(f, "#{h}"),
            Self::Hash(hash) => f.write_str(hash),
        }
    }
}

impl From<u64> for BlockRef {
    fn from(h: u64) -> Self {
        Self::Height(h)
    }
}

impl From<&str> for BlockRef {
    fn from(hash: &str) -> Self {
        Self::Hash(hash.to_string())
    }
}

/// Read access to a NEAR-compatible chain.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Fetch raw blocks for `heights`, in the same order. `None` marks a
    /// height the chain never produced or has pruned.
    async fn fetch_blocks(&self, heights: &[u64]) -> Result<Vec<Option<RawBlock>>, IndexerError>;

    /// Header of `block`. A height the chain skipped resolves to the
    /// nearest lower block.
    async fn get_header(&self, block: BlockRef) -> Result<Header, IndexerError>;

    async fn get_finalized_header(&self) -> Result<Header, IndexerError>;

    async fn get_finalized_height(&self) -> Result<u64, IndexerError> {
        Ok(self.get_finalized_header().await?.block_height)
    }

    async fn get_best_height(&self) -> Result<u64, IndexerError>;

    async fn get_chain_id(&self) -> Result<String, IndexerError>;
}

#[async_trait]
impl<C: ChainClient + ?Sized> ChainClient for std::sync::Arc<C> {
    async fn fetch_blocks(&self, heights: &[u64]) -> Result<Vec<Option<RawBlock>>, IndexerError> {
        (**self).fetch_blocks(heights).await
    }

    async fn get_header(&self, block: BlockRef) -> Result<Header, IndexerError> {
        (**self).get_header(block).await
    }

    async fn get_finalized_header(&self) -> Result<Header, IndexerError> {
        (**self).get_finalized_header().await
    }

    async fn get_best_height(&self) -> Result<u64, IndexerError> {
        (**self).get_best_height().await
    }

    async fn get_chain_id(&self) -> Result<String, IndexerError> {
        (**self).get_chain_id().await
    }
}
