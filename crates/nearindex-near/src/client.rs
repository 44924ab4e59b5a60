//! [`ChainClient`] over a NEAR JSON-RPC node.
//!
//! A block is assembled from three methods: `block` for the header and chunk
//! list, `chunk` for each newly included chunk's transactions, and
//! `EXPERIMENTAL_tx_status` for each transaction's outcome and receipts.
//! Calls for chunks and transactions of one block run concurrently.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use nearindex_core::raw::{RawBlockView, RawChunkView, RawTransaction, RawTransactionWithOutcome, RawTxStatus};
use nearindex_core::{BlockRef, ChainClient, Header, IndexerError, RawBlock};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::rpc::{HttpRpcClient, RpcError};

/// How far below a skipped height `get_header` looks for a block.
pub const DEFAULT_HEADER_LOOKBACK: u64 = 64;

#[derive(Debug, Deserialize)]
struct StatusView {
    chain_id: String,
    sync_info: SyncInfo,
}

#[derive(Debug, Deserialize)]
struct SyncInfo {
    latest_block_height: u64,
}

/// NEAR JSON-RPC chain client.
#[derive(Debug)]
pub struct NearRpcClient {
    rpc: HttpRpcClient,
    header_lookback: u64,
}

impl NearRpcClient {
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Result<Self, IndexerError> {
        Ok(Self::from_rpc(HttpRpcClient::new(endpoint, request_timeout)?))
    }

    pub fn from_rpc(rpc: HttpRpcClient) -> Self {
        Self {
            rpc,
            header_lookback: DEFAULT_HEADER_LOOKBACK,
        }
    }

    pub fn with_header_lookback(mut self, lookback: u64) -> Self {
        self.header_lookback = lookback.max(1);
        self
    }

    pub fn endpoint(&self) -> &str {
        self.rpc.url()
    }

    /// `block` view, `None` when the node has no such block.
    async fn block_view(&self, params: Value) -> Result<Option<RawBlockView>, IndexerError> {
        match self.rpc.call::<RawBlockView>("block", params).await {
            Ok(view) => Ok(Some(view)),
            Err(e) if e.is_unknown_block() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_block(&self, height: u64) -> Result<Option<RawBlock>, IndexerError> {
        let Some(view) = self.block_view(json!({ "block_id": height })).await? else {
            tracing::warn!(height, "Block unavailable on chain, skipping");
            return Ok(None);
        };

        let chunk_calls = view
            .chunks
            .iter()
            .filter(|c| c.is_new_at(height))
            .map(|c| self.rpc.call::<RawChunkView>("chunk", json!({ "chunk_id": c.chunk_hash })));
        let chunks = try_join_all(chunk_calls).await?;

        let tx_calls = chunks
            .into_iter()
            .flat_map(|chunk| chunk.transactions)
            .map(|tx| self.with_outcome(tx));
        let transactions = try_join_all(tx_calls).await?;

        tracing::trace!(height, transactions = transactions.len(), "Fetched block");
        Ok(Some(RawBlock {
            author: view.author,
            header: view.header,
            chunks: view.chunks,
            transactions,
        }))
    }

    async fn with_outcome(&self, transaction: RawTransaction) -> Result<RawTransactionWithOutcome, RpcError> {
        let status: RawTxStatus = self
            .rpc
            .call(
                "EXPERIMENTAL_tx_status",
                json!([transaction.hash, transaction.signer_id]),
            )
            .await?;
        Ok(RawTransactionWithOutcome {
            transaction,
            outcome: status.transaction_outcome,
            receipts: status.receipts,
        })
    }

    async fn status(&self) -> Result<StatusView, IndexerError> {
        Ok(self.rpc.call("status", json!([])).await?)
    }
}

#[async_trait]
impl ChainClient for NearRpcClient {
    async fn fetch_blocks(&self, heights: &[u64]) -> Result<Vec<Option<RawBlock>>, IndexerError> {
        try_join_all(heights.iter().map(|&h| self.fetch_block(h))).await
    }

    async fn get_header(&self, block: BlockRef) -> Result<Header, IndexerError> {
        match block {
            BlockRef::Hash(hash) => self
                .block_view(json!({ "block_id": hash }))
                .await?
                .map(|view| Header::from(&view.header))
                .ok_or_else(|| IndexerError::Other(format!("unknown block {hash}"))),
            BlockRef::Height(height) => {
                let floor = height.saturating_sub(self.header_lookback);
                for h in (floor..=height).rev() {
                    if let Some(view) = self.block_view(json!({ "block_id": h })).await? {
                        return Ok(Header::from(&view.header));
                    }
                }
                Err(IndexerError::Other(format!(
                    "no block found in heights {floor}..={height}"
                )))
            }
        }
    }

    async fn get_finalized_header(&self) -> Result<Header, IndexerError> {
        self.block_view(json!({ "finality": "final" }))
            .await?
            .map(|view| Header::from(&view.header))
            .ok_or_else(|| IndexerError::Other("node returned no final block".into()))
    }

    async fn get_best_height(&self) -> Result<u64, IndexerError> {
        Ok(self.status().await?.sync_info.latest_block_height)
    }

    async fn get_chain_id(&self) -> Result<String, IndexerError> {
        Ok(self.status().await?.chain_id)
    }
}
