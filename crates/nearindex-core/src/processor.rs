//! Second-layer processor plugins for custom datasources.
//!
//! A [`DatasourceProcessor`] is registered under the `processor.file` value
//! that custom datasources reference. Each of its [`HandlerProcessor`]s maps
//! one custom handler kind onto a base [`HandlerKind`], contributes a coarse
//! base filter, a fine-grained filter and a transformer.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::datasource::{CustomDatasource, Datasource, HandlerKind};
use crate::dictionary::DictionaryQueryEntry;
use crate::error::IndexerError;
use crate::filter::RuntimeFilter;
use crate::types::HandlerInput;

/// Asset name → file contents.
pub type Assets = BTreeMap<String, String>;

#[async_trait]
pub trait HandlerProcessor: Send + Sync {
    fn base_handler_kind(&self) -> HandlerKind;

    /// Coarse filters applied before [`HandlerProcessor::filter`].
    fn base_filters(&self) -> &[RuntimeFilter] {
        &[]
    }

    fn validate_filter(&self, _filter: Option<&Value>) -> Result<(), IndexerError> {
        Ok(())
    }

    /// A dictionary entry for this handler, if the processor can express one.
    fn dictionary_query(
        &self,
        _filter: Option<&Value>,
        _ds: &CustomDatasource,
    ) -> Option<DictionaryQueryEntry> {
        None
    }

    fn filter(
        &self,
        input: &HandlerInput<'_>,
        filter: Option<&Value>,
        ds: &CustomDatasource,
    ) -> Result<bool, IndexerError>;

    /// Produce the values handed to the user handler, in order.
    async fn transform(
        &self,
        input: &HandlerInput<'_>,
        ds: &CustomDatasource,
        filter: Option<&Value>,
        assets: &Assets,
    ) -> Result<Vec<Value>, IndexerError>;
}

pub trait DatasourceProcessor: Send + Sync {
    /// The datasource kind this processor serves.
    fn kind(&self) -> &str;

    fn validate(&self, ds: &CustomDatasource, assets: &Assets) -> Result<(), IndexerError>;

    /// Whether the datasource applies at all.
    fn ds_filter(&self, _ds: &CustomDatasource) -> bool {
        true
    }

    fn handler_processor(&self, kind: &str) -> Option<Arc<dyn HandlerProcessor>>;
}

// ─── ProcessorRegistry ───────────────────────────────────────────────────────

/// Processors keyed by the `processor.file` they are referenced by.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn DatasourceProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, file: impl Into<String>, processor: Arc<dyn DatasourceProcessor>) {
        self.processors.insert(file.into(), processor);
    }

    pub fn get(&self, ds: &CustomDatasource) -> Result<Arc<dyn DatasourceProcessor>, IndexerError> {
        self.processors
            .get(&ds.processor.file)
            .cloned()
            .ok_or_else(|| {
                IndexerError::Configuration(format!(
                    "no processor registered for '{}' (datasource kind '{}')",
                    ds.processor.file, ds.kind
                ))
            })
    }

    /// Look up the handler processor for a custom handler kind.
    pub fn handler_processor(
        &self,
        ds: &CustomDatasource,
        kind: &str,
    ) -> Result<Arc<dyn HandlerProcessor>, IndexerError> {
        self.get(ds)?
            .handler_processor(kind)
            .ok_or_else(|| IndexerError::UnknownHandlerKind {
                kind: kind.to_string(),
                ds_kind: ds.kind.clone(),
            })
    }

    /// Whether the datasource's processor accepts it. Runtime datasources
    /// always apply.
    pub fn ds_filter(&self, ds: &Datasource) -> Result<bool, IndexerError> {
        match ds {
            Datasource::Runtime(_) => Ok(true),
            Datasource::Custom(custom) => Ok(self.get(custom)?.ds_filter(custom)),
        }
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("files", &self.processors.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Resolve the base handler kind of handler `index` of `ds`.
pub fn base_handler_kind(
    ds: &Datasource,
    index: usize,
    registry: &ProcessorRegistry,
) -> Result<HandlerKind, IndexerError> {
    match ds {
        Datasource::Runtime(rt) => rt
            .mapping
            .handlers
            .get(index)
            .map(|h| h.kind)
            .ok_or_else(|| IndexerError::Configuration(format!("no handler at index {index}"))),
        Datasource::Custom(custom) => {
            let handler = custom.mapping.handlers.get(index).ok_or_else(|| {
                IndexerError::Configuration(format!("no handler at index {index}"))
            })?;
            Ok(registry
                .handler_processor(custom, &handler.kind)?
                .base_handler_kind())
        }
    }
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Read every asset of a custom datasource as UTF-8 text, relative to `root`.
pub fn load_assets(ds: &CustomDatasource, root: &Path) -> Result<Assets, IndexerError> {
    ds.assets
        .iter()
        .map(|(name, reference)| {
            let path = root.join(&reference.file);
            std::fs::read_to_string(&path)
                .map(|text| (name.clone(), text))
                .map_err(|e| {
                    IndexerError::Configuration(format!(
                        "failed to read asset '{name}' at {}: {e}",
                        path.display()
                    ))
                })
        })
        .collect()
}

/// Full validation of a custom datasource: processor present and of the
/// right kind, every handler kind known, every filter accepted, then the
/// processor's own checks.
pub fn validate_custom(
    ds: &CustomDatasource,
    registry: &ProcessorRegistry,
    assets: &Assets,
) -> Result<(), IndexerError> {
    let processor = registry.get(ds)?;
    if processor.kind() != ds.kind {
        return Err(IndexerError::Configuration(format!(
            "datasource kind '{}' does not match processor kind '{}'",
            ds.kind,
            processor.kind()
        )));
    }
    for handler in &ds.mapping.handlers {
        let hp = processor
            .handler_processor(&handler.kind)
            .ok_or_else(|| IndexerError::UnknownHandlerKind {
                kind: handler.kind.clone(),
                ds_kind: ds.kind.clone(),
            })?;
        hp.validate_filter(handler.filter.as_ref())?;
    }
    processor.validate(ds, assets)
}
