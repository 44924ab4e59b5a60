//! Turns a [`RawBlock`] into the normalized [`Block`] entity graph.
//!
//! Decoding is pure and synchronous. An action or receipt shape this crate
//! does not understand is a hard error for the block.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{DecodeErrorKind, IndexerError};
use crate::raw::{RawBlock, RawReceipt, RawTransactionWithOutcome};
use crate::types::{
    AccessKey, Action, ActionOwner, ActionPayload, ActionType, Block, DataReceiver, FunctionArgs,
    Receipt, ReceiptKind, Transaction, TransactionResult,
};

/// Decode a raw block.
pub fn decode(raw: &RawBlock) -> Result<Block, IndexerError> {
    let header = raw.header();
    let height = header.block_height;

    let mut transactions = Vec::with_capacity(raw.transactions.len());
    let mut receipts = Vec::new();
    let mut actions = Vec::new();

    for (tx_idx, raw_tx) in raw.transactions.iter().enumerate() {
        transactions.push(wrap_transaction(raw, raw_tx));

        for (id, raw_action) in raw_tx.transaction.actions.iter().enumerate() {
            actions.push(Action {
                id: id as u32,
                payload: wrap_action(raw_action, height)?,
                owner: ActionOwner::Transaction(tx_idx),
                transaction: Some(tx_idx),
            });
        }

        for (id, raw_receipt) in raw_tx.receipts.iter().enumerate() {
            let receipt_idx = receipts.len();
            let (receipt, receipt_actions) =
                wrap_receipt(raw_receipt, id as u32, height, tx_idx)?;
            receipts.push(receipt);
            for (action_id, raw_action) in receipt_actions.iter().enumerate() {
                actions.push(Action {
                    id: action_id as u32,
                    payload: wrap_action(raw_action, height)?,
                    owner: ActionOwner::Receipt(receipt_idx),
                    transaction: Some(tx_idx),
                });
            }
        }
    }

    tracing::trace!(
        height,
        transactions = transactions.len(),
        receipts = receipts.len(),
        actions = actions.len(),
        "Decoded block"
    );

    Ok(Block {
        gas_price: raw.header.gas_price.clone(),
        author: raw.author.clone(),
        header,
        transactions,
        receipts,
        actions,
    })
}

fn wrap_transaction(raw: &RawBlock, raw_tx: &RawTransactionWithOutcome) -> Transaction {
    let tx = &raw_tx.transaction;
    Transaction {
        hash: tx.hash.clone(),
        signer_id: tx.signer_id.clone(),
        public_key: tx.public_key.clone(),
        nonce: tx.nonce,
        receiver_id: tx.receiver_id.clone(),
        block_hash: raw.header.hash.clone(),
        block_height: raw.header.height,
        timestamp: raw.header.timestamp,
        gas_price: raw.header.gas_price.clone(),
        gas_used: raw_tx.outcome.outcome.gas_burnt,
        result: TransactionResult {
            id: raw_tx.outcome.id.clone(),
            logs: raw_tx.outcome.outcome.logs.clone(),
            receipt_ids: raw_tx.outcome.outcome.receipt_ids.clone(),
        },
    }
}

// ─── Receipts ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
enum RawReceiptBody {
    Action {
        signer_id: String,
        signer_public_key: String,
        #[serde(default)]
        gas_price: String,
        #[serde(default)]
        input_data_ids: Vec<String>,
        #[serde(default)]
        output_data_receivers: Vec<DataReceiver>,
        #[serde(default)]
        actions: Vec<Value>,
    },
    Data {
        data_id: String,
        #[serde(default)]
        data: Option<String>,
    },
}

/// Returns the receipt and its raw actions. The actions are hoisted into
/// [`Block::actions`] by the caller; the receipt keeps no copy of them.
fn wrap_receipt(
    raw: &RawReceipt,
    id: u32,
    height: u64,
    tx_idx: usize,
) -> Result<(Receipt, Vec<Value>), IndexerError> {
    let body: RawReceiptBody =
        serde_json::from_value(raw.receipt.clone()).map_err(|e| IndexerError::Decode {
            height,
            kind: DecodeErrorKind::UnsupportedReceipt(format!("{}: {e}", raw.receipt_id)),
        })?;

    let (kind, actions) = match body {
        RawReceiptBody::Action {
            signer_id,
            signer_public_key,
            gas_price,
            input_data_ids,
            output_data_receivers,
            actions,
        } => (
            ReceiptKind::Action {
                signer_id,
                signer_public_key,
                gas_price,
                input_data_ids,
                output_data_receivers,
            },
            actions,
        ),
        RawReceiptBody::Data { data_id, data } => (ReceiptKind::Data { data_id, data }, Vec::new()),
    };

    let receipt = Receipt {
        id,
        receipt_id: raw.receipt_id.clone(),
        predecessor_id: raw.predecessor_id.clone(),
        receiver_id: raw.receiver_id.clone(),
        block_height: height,
        transaction: Some(tx_idx),
        kind,
    };
    Ok((receipt, actions))
}

// ─── Actions ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct FunctionCallBody {
    method_name: String,
    #[serde(default)]
    args: String,
    gas: u64,
    deposit: String,
}

#[derive(Deserialize)]
struct DeployContractBody {
    #[serde(default)]
    code: String,
}

#[derive(Deserialize)]
struct TransferBody {
    deposit: String,
}

#[derive(Deserialize)]
struct StakeBody {
    stake: String,
    public_key: String,
}

#[derive(Deserialize)]
struct AddKeyBody {
    public_key: String,
    access_key: AccessKey,
}

#[derive(Deserialize)]
struct PublicKeyBody {
    public_key: String,
}

#[derive(Deserialize)]
struct DeleteAccountBody {
    beneficiary_id: String,
}

#[derive(Deserialize)]
struct DelegateBody {
    delegate_action: Value,
    signature: String,
}

/// Wrap one raw action: either the bare string `"CreateAccount"` or a
/// single-key object `{ "<Type>": { ... } }`.
pub fn wrap_action(raw: &Value, height: u64) -> Result<ActionPayload, IndexerError> {
    let unsupported = |tag: &str| IndexerError::Decode {
        height,
        kind: DecodeErrorKind::UnsupportedAction(tag.to_string()),
    };

    let (tag, body) = match raw {
        Value::String(tag) => (tag.as_str(), Value::Object(Default::default())),
        Value::Object(map) if map.len() == 1 => match map.iter().next() {
            Some((tag, body)) => (tag.as_str(), body.clone()),
            None => return Err(unsupported("<empty>")),
        },
        other => return Err(unsupported(&other.to_string())),
    };

    let ty = ActionType::from_tag(tag).ok_or_else(|| unsupported(tag))?;
    let payload = match ty {
        ActionType::CreateAccount => ActionPayload::CreateAccount,
        ActionType::DeployContract => {
            let b: DeployContractBody = parse_body(body, ty, height)?;
            ActionPayload::DeployContract { code: b.code }
        }
        ActionType::FunctionCall => {
            let b: FunctionCallBody = parse_body(body, ty, height)?;
            ActionPayload::FunctionCall {
                method_name: b.method_name,
                args: FunctionArgs::new(b.args),
                gas: b.gas,
                deposit: b.deposit,
            }
        }
        ActionType::Transfer => {
            let b: TransferBody = parse_body(body, ty, height)?;
            ActionPayload::Transfer { deposit: b.deposit }
        }
        ActionType::Stake => {
            let b: StakeBody = parse_body(body, ty, height)?;
            ActionPayload::Stake {
                stake: b.stake,
                public_key: b.public_key,
            }
        }
        ActionType::AddKey => {
            let b: AddKeyBody = parse_body(body, ty, height)?;
            ActionPayload::AddKey {
                public_key: b.public_key,
                access_key: b.access_key,
            }
        }
        ActionType::DeleteKey => {
            let b: PublicKeyBody = parse_body(body, ty, height)?;
            ActionPayload::DeleteKey {
                public_key: b.public_key,
            }
        }
        ActionType::DeleteAccount => {
            let b: DeleteAccountBody = parse_body(body, ty, height)?;
            ActionPayload::DeleteAccount {
                beneficiary_id: b.beneficiary_id,
            }
        }
        ActionType::SignedDelegate => {
            let b: DelegateBody = parse_body(body, ty, height)?;
            ActionPayload::SignedDelegate {
                delegate_action: b.delegate_action,
                signature: b.signature,
            }
        }
    };
    Ok(payload)
}

fn parse_body<T: DeserializeOwned>(
    body: Value,
    ty: ActionType,
    height: u64,
) -> Result<T, IndexerError> {
    serde_json::from_value(body).map_err(|e| IndexerError::Decode {
        height,
        kind: DecodeErrorKind::MalformedAction(format!("{ty} ({e})")),
    })
}
