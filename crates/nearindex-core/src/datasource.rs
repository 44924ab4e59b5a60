//! Datasource manifest model.
//!
//! A datasource is either `near/Runtime`, whose handlers use the four base
//! handler kinds directly, or a custom kind whose handlers are resolved
//! through a registered [`crate::processor::DatasourceProcessor`].

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::cron::CronSchedule;
use crate::error::IndexerError;
use crate::filter::{ActionFilter, BlockFilter, ReceiptFilter, RuntimeFilter, TransactionFilter};

pub const RUNTIME_DATASOURCE_KIND: &str = "near/Runtime";

// ─── Handler kinds ───────────────────────────────────────────────────────────

/// The four base handler kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HandlerKind {
    #[serde(rename = "near/BlockHandler")]
    Block,
    #[serde(rename = "near/TransactionHandler")]
    Transaction,
    #[serde(rename = "near/ActionHandler")]
    Action,
    #[serde(rename = "near/ReceiptHandler")]
    Receipt,
}

impl HandlerKind {
    pub const ALL: [HandlerKind; 4] = [Self::Block, Self::Transaction, Self::Action, Self::Receipt];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "near/BlockHandler",
            Self::Transaction => "near/TransactionHandler",
            Self::Action => "near/ActionHandler",
            Self::Receipt => "near/ReceiptHandler",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }

    /// Parse a filter value for this kind. `null` means no filter.
    pub fn parse_filter(&self, value: Option<&Value>) -> Result<Option<RuntimeFilter>, IndexerError> {
        let Some(value) = value.filter(|v| !v.is_null()) else {
            return Ok(None);
        };
        let bad = |e: serde_json::Error| {
            IndexerError::Configuration(format!("invalid {} filter: {e}", self.as_str()))
        };
        let filter = match self {
            Self::Block => RuntimeFilter::Block(
                serde_json::from_value::<BlockFilter>(value.clone()).map_err(bad)?,
            ),
            Self::Transaction => RuntimeFilter::Transaction(
                serde_json::from_value::<TransactionFilter>(value.clone()).map_err(bad)?,
            ),
            Self::Receipt => RuntimeFilter::Receipt(
                serde_json::from_value::<ReceiptFilter>(value.clone()).map_err(bad)?,
            ),
            Self::Action => RuntimeFilter::Action(
                serde_json::from_value::<ActionFilter>(value.clone()).map_err(bad)?,
            ),
        };
        Ok(Some(filter))
    }
}

impl std::fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

/// A handler as written in the manifest. Custom datasources keep handlers in
/// this form since only their processor knows the filter shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomHandler {
    pub kind: String,
    pub handler: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
}

/// A handler of a runtime datasource, with its filter parsed for its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CustomHandler", into = "CustomHandler")]
pub struct RuntimeHandler {
    pub kind: HandlerKind,
    pub handler: String,
    pub filter: Option<RuntimeFilter>,
}

impl TryFrom<CustomHandler> for RuntimeHandler {
    type Error = IndexerError;

    fn try_from(raw: CustomHandler) -> Result<Self, Self::Error> {
        let kind = HandlerKind::parse(&raw.kind).ok_or_else(|| IndexerError::UnknownHandlerKind {
            kind: raw.kind.clone(),
            ds_kind: RUNTIME_DATASOURCE_KIND.into(),
        })?;
        let filter = kind.parse_filter(raw.filter.as_ref())?;
        Ok(Self {
            kind,
            handler: raw.handler,
            filter,
        })
    }
}

impl From<RuntimeHandler> for CustomHandler {
    fn from(h: RuntimeHandler) -> Self {
        CustomHandler {
            kind: h.kind.as_str().to_string(),
            handler: h.handler,
            filter: h.filter.and_then(|f| serde_json::to_value(f).ok()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping<H> {
    #[serde(default)]
    pub file: String,
    pub handlers: Vec<H>,
}

// ─── Datasources ─────────────────────────────────────────────────────────────

fn default_start_block() -> u64 {
    1
}

fn runtime_kind() -> String {
    RUNTIME_DATASOURCE_KIND.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeDatasource {
    #[serde(default = "runtime_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_start_block")]
    pub start_block: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_block: Option<u64>,
    pub mapping: Mapping<RuntimeHandler>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReference {
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorRef {
    pub file: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub options: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomDatasource {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_start_block")]
    pub start_block: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_block: Option<u64>,
    pub processor: ProcessorRef,
    #[serde(default)]
    pub assets: BTreeMap<String, FileReference>,
    pub mapping: Mapping<CustomHandler>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Datasource {
    Runtime(RuntimeDatasource),
    Custom(CustomDatasource),
}

impl<'de> Deserialize<'de> for Datasource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let value = Value::deserialize(deserializer)?;
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| D::Error::missing_field("kind"))?;
        if kind == RUNTIME_DATASOURCE_KIND {
            serde_json::from_value(value)
                .map(Datasource::Runtime)
                .map_err(D::Error::custom)
        } else {
            serde_json::from_value(value)
                .map(Datasource::Custom)
                .map_err(D::Error::custom)
        }
    }
}

impl Datasource {
    pub fn kind(&self) -> &str {
        match self {
            Self::Runtime(ds) => &ds.kind,
            Self::Custom(ds) => &ds.kind,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Runtime(ds) => ds.name.as_deref(),
            Self::Custom(ds) => ds.name.as_deref(),
        }
    }

    pub fn start_block(&self) -> u64 {
        match self {
            Self::Runtime(ds) => ds.start_block,
            Self::Custom(ds) => ds.start_block,
        }
    }

    pub fn set_start_block(&mut self, height: u64) {
        match self {
            Self::Runtime(ds) => ds.start_block = height,
            Self::Custom(ds) => ds.start_block = height,
        }
    }

    pub fn end_block(&self) -> Option<u64> {
        match self {
            Self::Runtime(ds) => ds.end_block,
            Self::Custom(ds) => ds.end_block,
        }
    }

    /// Whether `height` lies within `[start_block, end_block]`.
    pub fn covers(&self, height: u64) -> bool {
        self.start_block() <= height && self.end_block().map_or(true, |end| height <= end)
    }

    pub fn handler_count(&self) -> usize {
        match self {
            Self::Runtime(ds) => ds.mapping.handlers.len(),
            Self::Custom(ds) => ds.mapping.handlers.len(),
        }
    }
}

impl RuntimeDatasource {
    /// Static checks on handler filters: positive `modulo`, parseable cron
    /// schedule, and a `type` on every action filter.
    pub fn validate(&self) -> Result<(), IndexerError> {
        for handler in &self.mapping.handlers {
            match &handler.filter {
                Some(RuntimeFilter::Block(f)) => {
                    if f.modulo == Some(0) {
                        return Err(IndexerError::Configuration(format!(
                            "handler '{}': block filter modulo must be greater than 0",
                            handler.handler
                        )));
                    }
                    if let Some(expr) = &f.timestamp {
                        CronSchedule::parse(expr)?;
                    }
                }
                Some(RuntimeFilter::Action(f)) if f.action_type.is_none() => {
                    return Err(IndexerError::Configuration(format!(
                        "handler '{}': action filter requires a type",
                        handler.handler
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}
