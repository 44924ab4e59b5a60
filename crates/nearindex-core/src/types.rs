//! Decoded NEAR entity graph: headers, blocks, transactions, receipts, actions.
//!
//! Actions never hold pointers to their container. They carry indices into
//! the owning [`Block`]'s `transactions` / `receipts` collections, so the
//! "exactly one owner" rule is checkable from the data alone.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

// ─── Header ──────────────────────────────────────────────────────────────────

/// Normalized block header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub block_height: u64,
    pub block_hash: String,
    pub parent_hash: String,
    /// Block timestamp in nanoseconds since the Unix epoch (NEAR native unit).
    pub timestamp: u64,
}

impl Header {
    /// Timestamp in milliseconds since the Unix epoch.
    pub fn timestamp_ms(&self) -> i64 {
        (self.timestamp / 1_000_000) as i64
    }

    /// Timestamp as a UTC date-time, `None` if out of chrono's range.
    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp_ms())
    }

    /// Returns `true` if `parent` is the block this header builds on.
    pub fn extends(&self, parent: &Header) -> bool {
        self.parent_hash == parent.block_hash && self.block_height > parent.block_height
    }
}

// ─── Transactions ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResult {
    pub id: String,
    pub logs: Vec<String>,
    pub receipt_ids: Vec<String>,
}

/// A signed transaction included in a chunk of the block.
///
/// Its first-layer actions live in [`Block::actions`]; use
/// [`Block::transaction_actions`] to reach them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub signer_id: String,
    pub public_key: String,
    pub nonce: u64,
    pub receiver_id: String,
    pub block_hash: String,
    pub block_height: u64,
    pub timestamp: u64,
    pub gas_price: String,
    pub gas_used: u64,
    pub result: TransactionResult,
}

// ─── Receipts ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataReceiver {
    pub data_id: String,
    pub receiver_id: String,
}

/// Body of a receipt: either it carries actions or it carries data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptKind {
    Action {
        signer_id: String,
        signer_public_key: String,
        gas_price: String,
        input_data_ids: Vec<String>,
        output_data_receivers: Vec<DataReceiver>,
    },
    Data {
        data_id: String,
        data: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Ordinal within the originating transaction's receipt list.
    pub id: u32,
    pub receipt_id: String,
    pub predecessor_id: String,
    pub receiver_id: String,
    pub block_height: u64,
    /// Index into [`Block::transactions`] of the transaction this receipt
    /// was produced by.
    pub transaction: Option<usize>,
    pub kind: ReceiptKind,
}

impl Receipt {
    pub fn signer_id(&self) -> Option<&str> {
        match &self.kind {
            ReceiptKind::Action { signer_id, .. } => Some(signer_id),
            ReceiptKind::Data { .. } => None,
        }
    }

    pub fn signer_public_key(&self) -> Option<&str> {
        match &self.kind {
            ReceiptKind::Action {
                signer_public_key, ..
            } => Some(signer_public_key),
            ReceiptKind::Data { .. } => None,
        }
    }

    pub fn is_action_receipt(&self) -> bool {
        matches!(self.kind, ReceiptKind::Action { .. })
    }
}

// ─── Actions ─────────────────────────────────────────────────────────────────

/// Discriminant of an [`ActionPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ActionType {
    CreateAccount,
    DeployContract,
    FunctionCall,
    Transfer,
    Stake,
    AddKey,
    DeleteKey,
    DeleteAccount,
    SignedDelegate,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateAccount => "CreateAccount",
            Self::DeployContract => "DeployContract",
            Self::FunctionCall => "FunctionCall",
            Self::Transfer => "Transfer",
            Self::Stake => "Stake",
            Self::AddKey => "AddKey",
            Self::DeleteKey => "DeleteKey",
            Self::DeleteAccount => "DeleteAccount",
            Self::SignedDelegate => "SignedDelegate",
        }
    }

    /// Parse the type tag used by the RPC. `Delegate` is the wire name of
    /// a signed delegate action.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "CreateAccount" => Self::CreateAccount,
            "DeployContract" => Self::DeployContract,
            "FunctionCall" => Self::FunctionCall,
            "Transfer" => Self::Transfer,
            "Stake" => Self::Stake,
            "AddKey" => Self::AddKey,
            "DeleteKey" => Self::DeleteKey,
            "DeleteAccount" => Self::DeleteAccount,
            "SignedDelegate" | "Delegate" => Self::SignedDelegate,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Base64-encoded function call arguments, kept as received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionArgs(String);

impl FunctionArgs {
    pub fn new(base64: impl Into<String>) -> Self {
        Self(base64.into())
    }

    pub fn as_base64(&self) -> &str {
        &self.0
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, IndexerError> {
        STANDARD
            .decode(&self.0)
            .map_err(|e| IndexerError::Other(format!("invalid base64 args: {e}")))
    }

    /// Decode base64 → UTF-8 → JSON.
    pub fn to_json<T: DeserializeOwned>(&self) -> Result<T, IndexerError> {
        let bytes = self.to_bytes()?;
        let text = std::str::from_utf8(&bytes)
            .map_err(|e| IndexerError::Other(format!("args are not UTF-8: {e}")))?;
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessKey {
    pub nonce: u64,
    /// `"FullAccess"` or `{"FunctionCall": {...}}`.
    pub permission: serde_json::Value,
}

impl AccessKey {
    /// The permission name used for filter matching: the string itself, or
    /// the single key of an object permission.
    pub fn permission_name(&self) -> Option<&str> {
        match &self.permission {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Object(map) if map.len() == 1 => map.keys().next().map(String::as_str),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "action")]
pub enum ActionPayload {
    CreateAccount,
    DeployContract {
        code: String,
    },
    FunctionCall {
        method_name: String,
        args: FunctionArgs,
        gas: u64,
        deposit: String,
    },
    Transfer {
        deposit: String,
    },
    Stake {
        stake: String,
        public_key: String,
    },
    AddKey {
        public_key: String,
        access_key: AccessKey,
    },
    DeleteKey {
        public_key: String,
    },
    DeleteAccount {
        beneficiary_id: String,
    },
    SignedDelegate {
        delegate_action: serde_json::Value,
        signature: String,
    },
}

impl ActionPayload {
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::CreateAccount => ActionType::CreateAccount,
            Self::DeployContract { .. } => ActionType::DeployContract,
            Self::FunctionCall { .. } => ActionType::FunctionCall,
            Self::Transfer { .. } => ActionType::Transfer,
            Self::Stake { .. } => ActionType::Stake,
            Self::AddKey { .. } => ActionType::AddKey,
            Self::DeleteKey { .. } => ActionType::DeleteKey,
            Self::DeleteAccount { .. } => ActionType::DeleteAccount,
            Self::SignedDelegate { .. } => ActionType::SignedDelegate,
        }
    }
}

/// The primary container of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionOwner {
    /// Index into [`Block::transactions`].
    Transaction(usize),
    /// Index into [`Block::receipts`].
    Receipt(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Action {
    /// Ordinal within its container.
    pub id: u32,
    #[serde(flatten)]
    pub payload: ActionPayload,
    pub owner: ActionOwner,
    /// Originating transaction. For receipt-owned actions this is a lookup
    /// reference only.
    pub transaction: Option<usize>,
}

impl Action {
    pub fn action_type(&self) -> ActionType {
        self.payload.action_type()
    }

    pub fn receipt(&self) -> Option<usize> {
        match self.owner {
            ActionOwner::Receipt(idx) => Some(idx),
            ActionOwner::Transaction(_) => None,
        }
    }
}

// ─── Block ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Block {
    pub header: Header,
    pub author: String,
    pub gas_price: String,
    pub transactions: Vec<Transaction>,
    pub receipts: Vec<Receipt>,
    /// Every action in the block: for each transaction its own actions, then
    /// the actions of each of its receipts.
    pub actions: Vec<Action>,
}

impl Block {
    pub fn height(&self) -> u64 {
        self.header.block_height
    }

    pub fn hash(&self) -> &str {
        &self.header.block_hash
    }

    /// First-layer actions of transaction `tx`, not linked to any receipt.
    pub fn transaction_actions(&self, tx: usize) -> impl Iterator<Item = &Action> + '_ {
        self.actions
            .iter()
            .filter(move |a| a.owner == ActionOwner::Transaction(tx))
    }

    /// Actions carried by receipt `receipt`.
    pub fn receipt_actions(&self, receipt: usize) -> impl Iterator<Item = &Action> + '_ {
        self.actions
            .iter()
            .filter(move |a| a.owner == ActionOwner::Receipt(receipt))
    }

    /// Receipts (with their indices) produced by transaction `tx`.
    pub fn transaction_receipts(&self, tx: usize) -> impl Iterator<Item = (usize, &Receipt)> + '_ {
        self.receipts
            .iter()
            .enumerate()
            .filter(move |(_, r)| r.transaction == Some(tx))
    }
}

// ─── Handler inputs ──────────────────────────────────────────────────────────

/// An action together with the containers it can be looked up through.
#[derive(Debug, Clone, Copy)]
pub struct ActionView<'a> {
    pub action: &'a Action,
    pub transaction: Option<&'a Transaction>,
    pub receipt: Option<&'a Receipt>,
}

impl<'a> ActionView<'a> {
    pub fn new(block: &'a Block, action: &'a Action) -> Self {
        Self {
            action,
            transaction: action.transaction.and_then(|i| block.transactions.get(i)),
            receipt: action.receipt().and_then(|i| block.receipts.get(i)),
        }
    }
}

/// One indexable entity of a block, borrowed for the duration of dispatch.
#[derive(Debug, Clone, Copy)]
pub enum HandlerInput<'a> {
    Block(&'a Block),
    Transaction(&'a Transaction),
    Receipt(&'a Receipt),
    Action(ActionView<'a>),
}

impl HandlerInput<'_> {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Block(_) => "block",
            Self::Transaction(_) => "transaction",
            Self::Receipt(_) => "receipt",
            Self::Action(_) => "action",
        }
    }

    /// JSON form handed to sandboxed handlers.
    pub fn to_json(&self) -> serde_json::Value {
        let value = match self {
            Self::Block(b) => serde_json::to_value(b),
            Self::Transaction(tx) => serde_json::to_value(tx),
            Self::Receipt(r) => serde_json::to_value(r),
            Self::Action(view) => serde_json::to_value(view.action).map(|mut action| {
                if let serde_json::Value::Object(map) = &mut action {
                    map.insert(
                        "transaction".into(),
                        serde_json::to_value(view.transaction).unwrap_or_default(),
                    );
                    map.insert(
                        "receipt".into(),
                        serde_json::to_value(view.receipt).unwrap_or_default(),
                    );
                }
                action
            }),
        };
        value.unwrap_or_default()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
