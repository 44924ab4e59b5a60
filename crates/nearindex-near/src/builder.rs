//! Fluent builder API for NEAR indexers.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use nearindex_core::{HandlerRegistry, MemoryMetadataStore, Project};
//! use nearindex_near::IndexerBuilder;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(project: Project) -> Result<(), nearindex_core::IndexerError> {
//! let mut indexer = IndexerBuilder::new()
//!     .id("ft-transfers")
//!     .endpoint("https://rpc.testnet.near.org")
//!     .chain_id("testnet")
//!     .start_block(150_000_000)
//!     .workers(4)
//!     .unfinalized_blocks(true)
//!     .build_http(project, HandlerRegistry::new(), Arc::new(MemoryMetadataStore::new()))?;
//! indexer.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use nearindex_core::{
    ChainClient, Dictionary, HandlerExecutor, IndexerConfig, IndexerError, MetadataStore, Project,
    RetryConfig,
};

use crate::client::NearRpcClient;
use crate::dispatcher::FetchDispatcher;
use crate::retry::RetryingClient;

/// Fluent builder for [`IndexerConfig`] and the [`FetchDispatcher`] it drives.
#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
    dictionary: Option<Arc<dyn Dictionary>>,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn from_config(config: IndexerConfig) -> Self {
        Self {
            config,
            dictionary: None,
        }
    }

    /// Set the indexer ID (used as the metadata key).
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.config.endpoint = url.into();
        self
    }

    /// Expected chain id, verified against the node at startup.
    pub fn chain_id(mut self, chain_id: impl Into<String>) -> Self {
        self.config.chain_id = Some(chain_id.into());
        self
    }

    pub fn start_block(mut self, block: u64) -> Self {
        self.config.start_block = Some(block);
        self
    }

    /// Stop after indexing this height.
    pub fn end_block(mut self, block: u64) -> Self {
        self.config.end_block = Some(block);
        self
    }

    /// Heights per fetch job.
    pub fn batch_size(mut self, size: u64) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.config.workers = n;
        self
    }

    pub fn fetch_ahead(mut self, heights: u64) -> Self {
        self.config.fetch_ahead = heights;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.request_timeout_ms = ms;
        self
    }

    /// Index past the finalized height and roll back on forks.
    pub fn unfinalized_blocks(mut self, enabled: bool) -> Self {
        self.config.unfinalized_blocks = enabled;
        self
    }

    pub fn bypass_blocks(mut self, heights: impl IntoIterator<Item = u64>) -> Self {
        self.config.bypass_blocks.extend(heights);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn ancestry_jump_threshold(mut self, heights: u64) -> Self {
        self.config.ancestry_jump_threshold = heights;
        self
    }

    pub fn dictionary(mut self, dictionary: Arc<dyn Dictionary>) -> Self {
        self.dictionary = Some(dictionary);
        self
    }

    /// Build the `IndexerConfig`.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }

    /// Wire a dispatcher around `client`, adding retries and per-call
    /// timeouts.
    pub fn build<C, E>(
        self,
        client: C,
        project: Project,
        executor: E,
        store: Arc<dyn MetadataStore>,
    ) -> Result<FetchDispatcher<RetryingClient<C>, E>, IndexerError>
    where
        C: ChainClient + 'static,
        E: HandlerExecutor,
    {
        self.config.validate()?;
        let client = RetryingClient::new(client, self.config.retry.clone(), self.config.request_timeout());
        let dispatcher = FetchDispatcher::new(self.config, Arc::new(client), project, executor, store);
        Ok(match self.dictionary {
            Some(dictionary) => dispatcher.with_dictionary(dictionary),
            None => dispatcher,
        })
    }

    /// Like [`IndexerBuilder::build`], connecting to the configured endpoint.
    pub fn build_http<E: HandlerExecutor>(
        self,
        project: Project,
        executor: E,
        store: Arc<dyn MetadataStore>,
    ) -> Result<FetchDispatcher<RetryingClient<NearRpcClient>, E>, IndexerError> {
        let client = NearRpcClient::new(self.config.endpoint.clone(), self.config.request_timeout())?;
        self.build(client, project, executor, store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let cfg = IndexerBuilder::new().build_config();
        assert_eq!(cfg, IndexerConfig::default());
        assert!(!cfg.unfinalized_blocks);
    }

    #[test]
    fn builder_custom() {
        let cfg = IndexerBuilder::new()
            .id("ft")
            .endpoint("http://localhost:3030")
            .chain_id("localnet")
            .start_block(10)
            .end_block(20)
            .batch_size(5)
            .workers(3)
            .unfinalized_blocks(true)
            .bypass_blocks([12, 13])
            .build_config();

        assert_eq!(cfg.id, "ft");
        assert_eq!(cfg.endpoint, "http://localhost:3030");
        assert_eq!(cfg.chain_id.as_deref(), Some("localnet"));
        assert_eq!((cfg.start_block, cfg.end_block), (Some(10), Some(20)));
        assert_eq!(cfg.batch_size, 5);
        assert_eq!(cfg.workers, 3);
        assert!(cfg.unfinalized_blocks);
        assert_eq!(cfg.bypass_blocks, vec![12, 13]);
    }
}
