//! Dictionary overlay: turns datasource filters into height-pruning queries.
//!
//! The dictionary is an optimization only. Whenever a handler's filter
//! cannot be expressed as a dictionary query the whole plan is abandoned
//! and the caller falls back to scanning every height.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::datasource::{Datasource, HandlerKind};
use crate::error::IndexerError;
use crate::filter::RuntimeFilter;
use crate::processor::{base_handler_kind, ProcessorRegistry};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DictionaryQueryCondition {
    pub field: String,
    pub value: String,
    pub matcher: String,
}

impl DictionaryQueryCondition {
    pub fn equal_to(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
            matcher: "equalTo".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DictionaryQueryEntry {
    pub entity: String,
    pub conditions: Vec<DictionaryQueryCondition>,
}

impl DictionaryQueryEntry {
    /// Entry with one equality condition per field set on `filter`.
    pub fn from_filter(entity: &str, filter: &impl Serialize) -> Self {
        let conditions = match serde_json::to_value(filter) {
            Ok(serde_json::Value::Object(map)) => map
                .into_iter()
                .filter_map(|(field, value)| match value {
                    serde_json::Value::String(s) => Some(DictionaryQueryCondition::equal_to(field, s)),
                    serde_json::Value::Null => None,
                    other => Some(DictionaryQueryCondition::equal_to(field, other.to_string())),
                })
                .collect(),
            _ => Vec::new(),
        };
        Self {
            entity: entity.to_string(),
            conditions,
        }
    }
}

/// A dictionary query plan for a set of datasources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPlan {
    /// Unique entries, conditions sorted by field.
    pub entries: Vec<DictionaryQueryEntry>,
    /// Block handler moduli; their heights are computed locally.
    pub block_modulos: Vec<u64>,
}

impl QueryPlan {
    /// Heights in `[start, end]` selected by a block modulo.
    pub fn modulo_heights(&self, start: u64, end: u64) -> Vec<u64> {
        let mut out = BTreeSet::new();
        for &m in &self.block_modulos {
            let mut h = start.div_ceil(m) * m;
            while h <= end {
                out.insert(h);
                h += m;
            }
        }
        out.into_iter().collect()
    }

    /// Whether the remote dictionary needs to be queried at all.
    pub fn needs_query(&self) -> bool {
        !self.entries.is_empty()
    }
}

/// Why a set of datasources cannot use the dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsafeHandler {
    pub datasource: usize,
    pub handler: String,
    pub reason: &'static str,
}

impl std::fmt::Display for UnsafeHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "datasource #{} handler '{}': {}",
            self.datasource, self.handler, self.reason
        )
    }
}

/// Build a plan, or report the first handler that makes it unsafe.
pub fn analyze_datasources<'a>(
    datasources: impl IntoIterator<Item = &'a Datasource>,
    registry: &ProcessorRegistry,
) -> Result<Result<QueryPlan, UnsafeHandler>, IndexerError> {
    let mut entries = BTreeSet::new();
    let mut modulos = BTreeSet::new();

    for (ds_idx, ds) in datasources.into_iter().enumerate() {
        for handler_idx in 0..ds.handler_count() {
            let kind = base_handler_kind(ds, handler_idx, registry)?;
            let unsafe_handler = |handler: &str, reason: &'static str| UnsafeHandler {
                datasource: ds_idx,
                handler: handler.to_string(),
                reason,
            };

            let (handler_name, filters): (&str, Vec<RuntimeFilter>) = match ds {
                Datasource::Runtime(rt) => {
                    let h = &rt.mapping.handlers[handler_idx];
                    (h.handler.as_str(), h.filter.iter().cloned().collect())
                }
                Datasource::Custom(custom) => {
                    let h = &custom.mapping.handlers[handler_idx];
                    let hp = registry.handler_processor(custom, &h.kind)?;
                    if let Some(entry) = hp.dictionary_query(h.filter.as_ref(), custom) {
                        entries.insert(normalize(entry));
                        continue;
                    }
                    (h.handler.as_str(), hp.base_filters().to_vec())
                }
            };

            if filters.is_empty() {
                return Ok(Err(unsafe_handler(handler_name, "handler has no filter")));
            }

            for filter in &filters {
                match (kind, filter) {
                    (HandlerKind::Block, RuntimeFilter::Block(f)) => match f.modulo {
                        Some(m) if m > 0 => {
                            modulos.insert(m);
                        }
                        _ => {
                            return Ok(Err(unsafe_handler(
                                handler_name,
                                "block filter without modulo",
                            )))
                        }
                    },
                    (HandlerKind::Transaction, RuntimeFilter::Transaction(f)) => {
                        if f.sender.is_none() && f.receiver.is_none() {
                            return Ok(Err(unsafe_handler(
                                handler_name,
                                "transaction filter without sender or receiver",
                            )));
                        }
                        entries.insert(normalize(DictionaryQueryEntry::from_filter("transactions", f)));
                    }
                    (HandlerKind::Receipt, RuntimeFilter::Receipt(f)) => {
                        if f.sender.is_none() && f.receiver.is_none() && f.signer.is_none() {
                            return Ok(Err(unsafe_handler(
                                handler_name,
                                "receipt filter without sender, receiver or signer",
                            )));
                        }
                        entries.insert(normalize(DictionaryQueryEntry::from_filter("receipts", f)));
                    }
                    (HandlerKind::Action, RuntimeFilter::Action(f)) => {
                        if f.action_type.is_none() {
                            return Ok(Err(unsafe_handler(
                                handler_name,
                                "action filter without type",
                            )));
                        }
                        entries.insert(normalize(DictionaryQueryEntry::from_filter("actions", f)));
                    }
                    _ => {
                        return Ok(Err(unsafe_handler(
                            handler_name,
                            "filter kind does not match handler kind",
                        )))
                    }
                }
            }
        }
    }

    if entries.is_empty() && modulos.is_empty() {
        return Ok(Err(UnsafeHandler {
            datasource: 0,
            handler: String::new(),
            reason: "no handlers",
        }));
    }

    Ok(Ok(QueryPlan {
        entries: entries.into_iter().collect(),
        block_modulos: modulos.into_iter().collect(),
    }))
}

/// `Some(plan)` when every handler is dictionary-safe, `None` when a full
/// scan is required.
pub fn build_query_plan<'a>(
    datasources: impl IntoIterator<Item = &'a Datasource>,
    registry: &ProcessorRegistry,
) -> Result<Option<QueryPlan>, IndexerError> {
    match analyze_datasources(datasources, registry)? {
        Ok(plan) => Ok(Some(plan)),
        Err(reason) => {
            tracing::debug!(%reason, "Dictionary disabled for datasources");
            Ok(None)
        }
    }
}

fn normalize(mut entry: DictionaryQueryEntry) -> DictionaryQueryEntry {
    entry.conditions.sort();
    entry.conditions.dedup();
    entry
}

// ─── Dictionary service ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryResult {
    /// Heights with matching entities, ascending.
    pub heights: Vec<u64>,
    /// Highest height the dictionary has scanned in this query.
    pub last_scanned: u64,
}

/// A remote index able to list heights that contain matching entities.
#[async_trait]
pub trait Dictionary: Send + Sync {
    /// `Ok(None)` means the dictionary cannot answer for this range.
    async fn query_heights(
        &self,
        start: u64,
        end: u64,
        limit: usize,
        plan: &QueryPlan,
    ) -> Result<Option<DictionaryResult>, IndexerError>;
}
