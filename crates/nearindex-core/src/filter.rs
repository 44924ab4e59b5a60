//! Filter engine: decides whether a decoded entity is relevant to a handler.
//!
//! An absent filter always matches. Equality fields left unset are
//! wildcards. Block timestamp filters consult a [`CronCursor`] owned by the
//! caller; see [`ScheduleCursors`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::cron::{CronCursor, CronSchedule};
use crate::error::IndexerError;
use crate::types::{
    ActionPayload, ActionType, ActionView, Block, HandlerInput, Receipt, Transaction,
};

// ─── Filter shapes ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modulo: Option<u64>,
    /// Cron expression evaluated against block timestamps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionFilter {
    /// Matches the transaction's `signer_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptFilter {
    /// Matches the receipt's `predecessor_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    /// Matches the action receipt's `signer_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<ActionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beneficiary_id: Option<String>,
}

impl ActionFilter {
    fn receipt_shape(&self) -> ReceiptFilter {
        ReceiptFilter {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            signer: self.signer.clone(),
        }
    }

    fn field_value(&self, field: ActionField) -> Option<&str> {
        match field {
            ActionField::MethodName => self.method_name.as_deref(),
            ActionField::Args => self.args.as_deref(),
            ActionField::PublicKey => self.public_key.as_deref(),
            ActionField::AccessKey => self.access_key.as_deref(),
            ActionField::BeneficiaryId => self.beneficiary_id.as_deref(),
        }
    }
}

/// A filter for one of the four base handler kinds. Which variant applies
/// is decided by the handler kind, so this type is never deserialized on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RuntimeFilter {
    Block(BlockFilter),
    Transaction(TransactionFilter),
    Receipt(ReceiptFilter),
    Action(ActionFilter),
}

// ─── Action field table ──────────────────────────────────────────────────────

/// Type-specific action filter fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionField {
    MethodName,
    Args,
    PublicKey,
    AccessKey,
    BeneficiaryId,
}

const ALL_ACTION_FIELDS: [ActionField; 5] = [
    ActionField::MethodName,
    ActionField::Args,
    ActionField::PublicKey,
    ActionField::AccessKey,
    ActionField::BeneficiaryId,
];

/// Which filter fields apply to each action type.
pub fn action_filter_fields(ty: ActionType) -> &'static [ActionField] {
    match ty {
        ActionType::FunctionCall => &[ActionField::MethodName, ActionField::Args],
        ActionType::Stake | ActionType::DeleteKey => &[ActionField::PublicKey],
        ActionType::AddKey => &[ActionField::PublicKey, ActionField::AccessKey],
        ActionType::DeleteAccount => &[ActionField::BeneficiaryId],
        ActionType::CreateAccount
        | ActionType::DeployContract
        | ActionType::Transfer
        | ActionType::SignedDelegate => &[],
    }
}

/// Resolve a filter field inside an action payload. `None` when the field
/// does not apply to the payload's type.
pub fn resolve_action_field(payload: &ActionPayload, field: ActionField) -> Option<&str> {
    match (payload, field) {
        (ActionPayload::FunctionCall { method_name, .. }, ActionField::MethodName) => {
            Some(method_name.as_str())
        }
        (ActionPayload::FunctionCall { args, .. }, ActionField::Args) => Some(args.as_base64()),
        (ActionPayload::Stake { public_key, .. }, ActionField::PublicKey)
        | (ActionPayload::AddKey { public_key, .. }, ActionField::PublicKey)
        | (ActionPayload::DeleteKey { public_key }, ActionField::PublicKey) => {
            Some(public_key.as_str())
        }
        (ActionPayload::AddKey { access_key, .. }, ActionField::AccessKey) => {
            access_key.permission_name()
        }
        (ActionPayload::DeleteAccount { beneficiary_id }, ActionField::BeneficiaryId) => {
            Some(beneficiary_id.as_str())
        }
        _ => None,
    }
}

// ─── Matchers ────────────────────────────────────────────────────────────────

fn field_eq(expected: &Option<String>, actual: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(e) => actual == Some(e.as_str()),
    }
}

/// Block filter: `modulo` and the optional cron schedule. The cursor is
/// evaluated for every block that reaches this filter.
pub fn matches_block(block: &Block, filter: &BlockFilter, cursor: Option<&mut CronCursor>) -> bool {
    let schedule_ok = match (&filter.timestamp, cursor) {
        (Some(_), Some(cursor)) => match block.header.datetime() {
            Some(ts) => cursor.evaluate(ts),
            None => false,
        },
        (Some(expr), None) => {
            tracing::warn!(schedule = %expr, "No cron cursor supplied for timestamp filter");
            false
        }
        (None, _) => true,
    };

    let modulo_ok = match filter.modulo {
        Some(0) | None => true,
        Some(m) => block.height() % m == 0,
    };

    modulo_ok && schedule_ok
}

pub fn matches_transaction(tx: &Transaction, filter: &TransactionFilter) -> bool {
    field_eq(&filter.sender, Some(tx.signer_id.as_str()))
        && field_eq(&filter.receiver, Some(tx.receiver_id.as_str()))
}

pub fn matches_receipt(receipt: &Receipt, filter: &ReceiptFilter) -> bool {
    field_eq(&filter.sender, Some(receipt.predecessor_id.as_str()))
        && field_eq(&filter.receiver, Some(receipt.receiver_id.as_str()))
        && field_eq(&filter.signer, receipt.signer_id())
}

pub fn matches_action(view: &ActionView<'_>, filter: &ActionFilter) -> bool {
    let owner_ok = match (view.receipt, view.transaction) {
        (Some(receipt), _) => matches_receipt(receipt, &filter.receipt_shape()),
        (None, Some(tx)) => {
            field_eq(&filter.sender, Some(tx.signer_id.as_str()))
                && field_eq(&filter.receiver, Some(tx.receiver_id.as_str()))
                && field_eq(&filter.signer, Some(tx.signer_id.as_str()))
        }
        (None, None) => true,
    };
    if !owner_ok {
        return false;
    }

    let ty = view.action.action_type();
    if filter.action_type.is_some_and(|t| t != ty) {
        return false;
    }

    action_filter_fields(ty).iter().all(|&field| {
        match (
            filter.field_value(field),
            resolve_action_field(&view.action.payload, field),
        ) {
            (Some(expected), Some(actual)) => expected == actual,
            _ => true,
        }
    })
}

/// Match `input` against one filter. A filter of a different kind than the
/// input never matches.
pub fn matches(
    input: &HandlerInput<'_>,
    filter: Option<&RuntimeFilter>,
    cursor: Option<&mut CronCursor>,
) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    match (input, filter) {
        (HandlerInput::Block(b), RuntimeFilter::Block(f)) => matches_block(b, f, cursor),
        (HandlerInput::Transaction(tx), RuntimeFilter::Transaction(f)) => matches_transaction(tx, f),
        (HandlerInput::Receipt(r), RuntimeFilter::Receipt(f)) => matches_receipt(r, f),
        (HandlerInput::Action(view), RuntimeFilter::Action(f)) => matches_action(view, f),
        _ => {
            tracing::trace!(input = input.label(), "Filter kind does not match input kind");
            false
        }
    }
}

/// Coarse pre-filter for custom handlers: an empty list passes, otherwise
/// any one filter matching is enough. Every block filter in the list gets
/// its cursor evaluated.
pub fn matches_any(
    input: &HandlerInput<'_>,
    filters: &[RuntimeFilter],
    cursors: &mut ScheduleCursors,
    key: CursorKey,
) -> Result<bool, IndexerError> {
    if filters.is_empty() {
        return Ok(true);
    }
    let mut any = false;
    for (slot, filter) in filters.iter().enumerate() {
        let cursor = match filter {
            RuntimeFilter::Block(bf) => cursors.cursor_for(CursorKey { slot, ..key }, bf)?,
            _ => None,
        };
        any |= matches(input, Some(filter), cursor);
    }
    Ok(any)
}

// ─── Schedule cursors ────────────────────────────────────────────────────────

/// Identifies one block filter instance: datasource, handler and filter
/// position within that handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorKey {
    pub datasource: usize,
    pub handler: usize,
    pub slot: usize,
}

impl CursorKey {
    pub fn new(datasource: usize, handler: usize) -> Self {
        Self {
            datasource,
            handler,
            slot: 0,
        }
    }
}

/// Owner of every cron cursor used during indexing.
#[derive(Debug, Default)]
pub struct ScheduleCursors {
    cursors: HashMap<CursorKey, CronCursor>,
}

impl ScheduleCursors {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cursor for a block filter, created on first use. `None` when the
    /// filter has no timestamp schedule.
    pub fn cursor_for(
        &mut self,
        key: CursorKey,
        filter: &BlockFilter,
    ) -> Result<Option<&mut CronCursor>, IndexerError> {
        let Some(expr) = &filter.timestamp else {
            return Ok(None);
        };
        if !self.cursors.contains_key(&key) {
            let schedule = CronSchedule::parse(expr)?;
            self.cursors.insert(key, CronCursor::new(schedule));
        }
        Ok(self.cursors.get_mut(&key))
    }

    /// Forget cursors of datasources at or beyond `first_removed`.
    pub fn truncate_datasources(&mut self, first_removed: usize) {
        self.cursors.retain(|k, _| k.datasource < first_removed);
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

/// Returns every type-specific field set on `filter`.
pub fn set_action_fields(filter: &ActionFilter) -> impl Iterator<Item = ActionField> + '_ {
    ALL_ACTION_FIELDS
        .into_iter()
        .filter(|f| filter.field_value(*f).is_some())
}
