//! nearindex-core — block decoding, filter matching, fork tracking and
//! per-block sequencing for a NEAR indexing pipeline.
//!
//! # Architecture
//!
//! ```text
//! FetchDispatcher (nearindex-near)
//!     ├── ChainClient           (raw blocks, headers, finality)
//!     ├── decoder::decode       (RawBlock → Block)
//!     ├── UnfinalizedBlocks     (fork detection, rollback target)
//!     ├── IndexerManager        (filter + dispatch, dynamic datasources)
//!     │       ├── filter        (runtime filters, cron cursors)
//!     │       ├── Project       (static / dynamic datasources)
//!     │       └── HandlerExecutor
//!     └── MetadataStore         (progress, unfinalized state)
//! ```

pub mod client;
pub mod config;
pub mod cron;
pub mod datasource;
pub mod decoder;
pub mod dictionary;
pub mod error;
pub mod filter;
pub mod handler;
pub mod metadata;
pub mod processor;
pub mod project;
pub mod raw;
pub mod sequencer;
pub mod types;
pub mod unfinalized;

pub use client::{BlockRef, ChainClient};
pub use config::{IndexerConfig, IndexerState, RetryConfig};
pub use datasource::{Datasource, HandlerKind};
pub use decoder::decode;
pub use dictionary::{build_query_plan, Dictionary, QueryPlan};
pub use error::{ErrorKind, IndexerError};
pub use filter::RuntimeFilter;
pub use handler::{HandlerArgs, HandlerContext, HandlerExecutor, HandlerRegistry};
pub use metadata::{IndexerMetadata, MemoryMetadataStore, MetadataStore};
pub use processor::{DatasourceProcessor, HandlerProcessor, ProcessorRegistry};
pub use project::{Project, ProjectManifest};
pub use raw::RawBlock;
pub use sequencer::{IndexerManager, ProcessBlockResponse};
pub use types::{Action, Block, Header, Receipt, Transaction};
pub use unfinalized::UnfinalizedBlocks;
