//! Raw shapes returned by a NEAR JSON-RPC node.
//!
//! Only the fields the decoder needs are declared; unknown fields are ignored.
//! Action and receipt bodies stay as [`serde_json::Value`] so that an
//! unrecognized shape surfaces as a decode error rather than an RPC error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Header;

/// `header` of the `block` RPC view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawHeader {
    pub height: u64,
    pub hash: String,
    pub prev_hash: String,
    /// Nanoseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default)]
    pub gas_price: String,
}

impl From<&RawHeader> for Header {
    fn from(raw: &RawHeader) -> Self {
        Header {
            block_height: raw.height,
            block_hash: raw.hash.clone(),
            parent_hash: raw.prev_hash.clone(),
            timestamp: raw.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawChunkHeader {
    pub chunk_hash: String,
    #[serde(default)]
    pub shard_id: u64,
    /// Height the chunk was produced at. Older chunks are repeated in
    /// blocks whose shard missed its slot.
    #[serde(default)]
    pub height_included: Option<u64>,
}

impl RawChunkHeader {
    pub fn is_new_at(&self, height: u64) -> bool {
        self.height_included.map_or(true, |h| h == height)
    }
}

/// Result of the `block` RPC method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBlockView {
    pub author: String,
    pub header: RawHeader,
    #[serde(default)]
    pub chunks: Vec<RawChunkHeader>,
}

/// Result of the `chunk` RPC method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawChunkView {
    #[serde(default)]
    pub transactions: Vec<RawTransaction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub hash: String,
    pub signer_id: String,
    pub public_key: String,
    pub nonce: u64,
    pub receiver_id: String,
    #[serde(default)]
    pub actions: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawExecutionOutcome {
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub receipt_ids: Vec<String>,
    #[serde(default)]
    pub gas_burnt: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOutcomeWithId {
    pub id: String,
    pub outcome: RawExecutionOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawReceipt {
    pub receipt_id: String,
    pub predecessor_id: String,
    pub receiver_id: String,
    /// `{"Action": {...}}` or `{"Data": {...}}`.
    pub receipt: Value,
}

/// Result of the `EXPERIMENTAL_tx_status` RPC method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTxStatus {
    pub transaction_outcome: RawOutcomeWithId,
    #[serde(default)]
    pub receipts: Vec<RawReceipt>,
}

/// A chunk transaction joined with its execution outcome and receipts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTransactionWithOutcome {
    pub transaction: RawTransaction,
    pub outcome: RawOutcomeWithId,
    #[serde(default)]
    pub receipts: Vec<RawReceipt>,
}

/// Everything the decoder needs to build one [`crate::types::Block`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBlock {
    pub author: String,
    pub header: RawHeader,
    #[serde(default)]
    pub chunks: Vec<RawChunkHeader>,
    #[serde(default)]
    pub transactions: Vec<RawTransactionWithOutcome>,
}

impl RawBlock {
    pub fn header(&self) -> Header {
        Header::from(&self.header)
    }
}
