//! Project service: the datasources an indexer runs, their templates, and
//! the dynamic datasources created from those templates while indexing.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::datasource::Datasource;
use crate::error::IndexerError;
use crate::metadata::DynamicDatasourceParams;
use crate::processor::{load_assets, validate_custom, Assets, ProcessorRegistry};

// ─── Manifest ────────────────────────────────────────────────────────────────

/// Either a single height or an inclusive `"start-end"` range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BypassBlock {
    Height(u64),
    Range(String),
}

impl BypassBlock {
    pub fn to_range(&self) -> Result<RangeInclusive<u64>, IndexerError> {
        match self {
            Self::Height(h) => Ok(*h..=*h),
            Self::Range(text) => {
                let bad = || IndexerError::Configuration(format!("invalid bypass block range '{text}'"));
                let (start, end) = text.split_once('-').ok_or_else(bad)?;
                let start: u64 = start.trim().parse().map_err(|_| bad())?;
                let end: u64 = end.trim().parse().map_err(|_| bad())?;
                if start > end {
                    return Err(bad());
                }
                Ok(start..=end)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default, alias = "chain_id")]
    pub chain_id: Option<String>,
    #[serde(default)]
    pub dictionary: Option<String>,
}

/// Project file as written by users.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectManifest {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default, alias = "data_sources")]
    pub data_sources: Vec<Datasource>,
    #[serde(default)]
    pub templates: Vec<Datasource>,
    #[serde(default, alias = "bypass_blocks")]
    pub bypass_blocks: Vec<BypassBlock>,
}

// ─── Project ─────────────────────────────────────────────────────────────────

/// A datasource with its stable id, loaded assets and, for dynamic ones,
/// the parameters it was created with.
#[derive(Debug, Clone)]
pub struct ProjectDatasource {
    pub id: usize,
    pub datasource: Datasource,
    pub assets: Assets,
    pub dynamic: Option<DynamicDatasourceParams>,
}

#[derive(Debug, Clone)]
pub struct Project {
    root: PathBuf,
    /// Static datasources first, then dynamic ones in creation order.
    entries: Vec<ProjectDatasource>,
    static_count: usize,
    templates: Vec<Datasource>,
    registry: ProcessorRegistry,
    bypass: Vec<RangeInclusive<u64>>,
}

impl Project {
    /// Build and validate a project. `root` resolves asset paths.
    pub fn new(
        manifest: ProjectManifest,
        registry: ProcessorRegistry,
        root: impl Into<PathBuf>,
    ) -> Result<Self, IndexerError> {
        let root = root.into();
        if manifest.data_sources.is_empty() {
            return Err(IndexerError::Configuration("project has no datasources".into()));
        }
        for template in &manifest.templates {
            if template.name().is_none() {
                return Err(IndexerError::Configuration(format!(
                    "template of kind '{}' has no name",
                    template.kind()
                )));
            }
        }
        let bypass = manifest
            .bypass_blocks
            .iter()
            .map(BypassBlock::to_range)
            .collect::<Result<Vec<_>, _>>()?;

        let mut entries = Vec::with_capacity(manifest.data_sources.len());
        for (id, datasource) in manifest.data_sources.into_iter().enumerate() {
            let assets = validate_datasource(&datasource, &registry, &root)?;
            entries.push(ProjectDatasource {
                id,
                datasource,
                assets,
                dynamic: None,
            });
        }
        tracing::info!(
            datasources = entries.len(),
            templates = manifest.templates.len(),
            bypass_ranges = bypass.len(),
            "Project loaded"
        );
        Ok(Self {
            root,
            static_count: entries.len(),
            entries,
            templates: manifest.templates,
            registry,
            bypass,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    pub fn templates(&self) -> &[Datasource] {
        &self.templates
    }

    pub fn get(&self, id: usize) -> Option<&ProjectDatasource> {
        self.entries.get(id)
    }

    /// Every datasource, static and dynamic.
    pub fn all(&self) -> impl Iterator<Item = &ProjectDatasource> + '_ {
        self.entries.iter()
    }

    /// Lowest start block across static datasources.
    pub fn start_height(&self) -> u64 {
        self.entries[..self.static_count]
            .iter()
            .map(|e| e.datasource.start_block())
            .min()
            .unwrap_or(1)
    }

    /// Whether `id` can apply to `height`: within range and accepted by its
    /// processor.
    pub fn is_active(&self, id: usize, height: u64) -> Result<bool, IndexerError> {
        match self.entries.get(id) {
            Some(e) if e.datasource.covers(height) => self.registry.ds_filter(&e.datasource),
            _ => Ok(false),
        }
    }

    /// Ids of datasources applying at `height`, static before dynamic.
    pub fn active_ids(&self, height: u64) -> Result<Vec<usize>, IndexerError> {
        let mut ids = Vec::new();
        for entry in &self.entries {
            if self.is_active(entry.id, height)? {
                ids.push(entry.id);
            }
        }
        if ids.is_empty() {
            return Err(IndexerError::Configuration(format!(
                "no datasources apply at height {height}"
            )));
        }
        Ok(ids)
    }

    pub fn datasources_at(&self, height: u64) -> Result<Vec<&ProjectDatasource>, IndexerError> {
        Ok(self
            .active_ids(height)?
            .into_iter()
            .filter_map(|id| self.entries.get(id))
            .collect())
    }

    pub fn is_bypassed(&self, height: u64) -> bool {
        self.bypass.iter().any(|r| r.contains(&height))
    }

    // ─── Dynamic datasources ─────────────────────────────────────────────────

    /// Instantiate `template` at `start_block`, validate it and return its id.
    pub fn create_dynamic_datasource(
        &mut self,
        template: &str,
        args: Option<Value>,
        start_block: u64,
    ) -> Result<usize, IndexerError> {
        let mut datasource = self
            .templates
            .iter()
            .find(|t| t.name() == Some(template))
            .cloned()
            .ok_or_else(|| IndexerError::Configuration(format!("unknown template '{template}'")))?;
        datasource.set_start_block(start_block);

        if let (Datasource::Custom(custom), Some(args)) = (&mut datasource, &args) {
            merge_options(&mut custom.processor.options, args, template)?;
        }

        let assets = validate_datasource(&datasource, &self.registry, &self.root)?;
        let id = self.entries.len();
        self.entries.push(ProjectDatasource {
            id,
            datasource,
            assets,
            dynamic: Some(DynamicDatasourceParams {
                template_name: template.to_string(),
                args,
                start_block,
            }),
        });
        tracing::info!(template, start_block, id, "Created dynamic datasource");
        Ok(id)
    }

    /// Recreate dynamic datasources from persisted parameters.
    pub fn restore_dynamic(&mut self, params: &[DynamicDatasourceParams]) -> Result<(), IndexerError> {
        for p in params {
            self.create_dynamic_datasource(&p.template_name, p.args.clone(), p.start_block)?;
        }
        Ok(())
    }

    pub fn dynamic_params(&self) -> Vec<DynamicDatasourceParams> {
        self.entries
            .iter()
            .filter_map(|e| e.dynamic.clone())
            .collect()
    }

    pub fn dynamic_count(&self) -> usize {
        self.entries.len() - self.static_count
    }

    /// Drop dynamic datasources starting above `target`. Returns the lowest
    /// id whose datasource changed, if any.
    pub fn rollback_dynamic(&mut self, target: u64) -> Option<usize> {
        let first_removed = self.entries[self.static_count..]
            .iter()
            .position(|e| e.datasource.start_block() > target)
            .map(|pos| pos + self.static_count)?;

        let before = self.entries.len();
        let tail = self.entries.split_off(first_removed);
        self.entries
            .extend(tail.into_iter().filter(|e| e.datasource.start_block() <= target));
        for (id, entry) in self.entries.iter_mut().enumerate().skip(first_removed) {
            entry.id = id;
        }
        tracing::info!(
            target,
            removed = before - self.entries.len(),
            "Removed dynamic datasources after rollback"
        );
        Some(first_removed)
    }
}

fn validate_datasource(
    ds: &Datasource,
    registry: &ProcessorRegistry,
    root: &Path,
) -> Result<Assets, IndexerError> {
    match ds {
        Datasource::Runtime(rt) => {
            rt.validate()?;
            Ok(Assets::new())
        }
        Datasource::Custom(custom) => {
            let assets = load_assets(custom, root)?;
            validate_custom(custom, registry, &assets)?;
            Ok(assets)
        }
    }
}

fn merge_options(options: &mut Value, args: &Value, template: &str) -> Result<(), IndexerError> {
    if options.is_null() {
        *options = args.clone();
        return Ok(());
    }
    match (options.as_object_mut(), args.as_object()) {
        (Some(opts), Some(extra)) => {
            opts.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
            Ok(())
        }
        _ => Err(IndexerError::Configuration(format!(
            "template '{template}': args cannot be merged into processor options"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::{CustomDatasource, HandlerKind};
    use crate::processor::{DatasourceProcessor, HandlerProcessor};
    use crate::types::HandlerInput;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct FtTransfer;

    #[async_trait]
    impl HandlerProcessor for FtTransfer {
        fn base_handler_kind(&self) -> HandlerKind {
            HandlerKind::Action
        }

        fn filter(
            &self,
            _input: &HandlerInput<'_>,
            _filter: Option<&Value>,
            _ds: &CustomDatasource,
        ) -> Result<bool, IndexerError> {
            Ok(true)
        }

        async fn transform(
            &self,
            _input: &HandlerInput<'_>,
            _ds: &CustomDatasource,
            _filter: Option<&Value>,
            _assets: &Assets,
        ) -> Result<Vec<Value>, IndexerError> {
            Ok(vec![])
        }
    }

    struct Ft;

    impl DatasourceProcessor for Ft {
        fn kind(&self) -> &str {
            "near/Ft"
        }

        fn validate(&self, ds: &CustomDatasource, _assets: &Assets) -> Result<(), IndexerError> {
            match ds.processor.options.get("decimals") {
                Some(Value::Number(_)) => Ok(()),
                _ => Err(IndexerError::Configuration("decimals option required".into())),
            }
        }

        fn handler_processor(&self, kind: &str) -> Option<Arc<dyn HandlerProcessor>> {
            (kind == "near/FtTransfer").then(|| Arc::new(FtTransfer) as Arc<dyn HandlerProcessor>)
        }
    }

    fn manifest() -> ProjectManifest {
        serde_json::from_value(serde_json::json!({
            "network": { "endpoint": "http://localhost:3030", "chainId": "testnet" },
            "dataSources": [
                {
                    "kind": "near/Runtime",
                    "startBlock": 100,
                    "mapping": { "handlers": [ { "kind": "near/BlockHandler", "handler": "handleBlock" } ] }
                }
            ],
            "templates": [
                {
                    "kind": "near/Runtime",
                    "name": "Pool",
                    "mapping": { "handlers": [
                        { "kind": "near/ActionHandler", "handler": "handlePool", "filter": { "type": "FunctionCall" } }
                    ] }
                },
                {
                    "kind": "near/Ft",
                    "name": "Token",
                    "processor": { "file": "./ft.js", "options": { "decimals": 6 } },
                    "mapping": { "handlers": [ { "kind": "near/FtTransfer", "handler": "handleFt" } ] }
                }
            ],
            "bypassBlocks": [105, "110-112"]
        }))
        .unwrap()
    }

    fn registry() -> ProcessorRegistry {
        let mut registry = ProcessorRegistry::new();
        registry.register("./ft.js", Arc::new(Ft));
        registry
    }

    #[test]
    fn datasources_at_respects_start_block() {
        let project = Project::new(manifest(), registry(), ".").unwrap();
        assert_eq!(project.start_height(), 100);
        assert!(project.datasources_at(99).is_err());
        assert_eq!(project.active_ids(100).unwrap(), vec![0]);
    }

    #[test]
    fn bypass_blocks_accept_heights_and_ranges() {
        let project = Project::new(manifest(), registry(), ".").unwrap();
        assert!(project.is_bypassed(105));
        assert!(project.is_bypassed(111));
        assert!(!project.is_bypassed(113));
        assert!(BypassBlock::Range("9-3".into()).to_range().is_err());
    }

    #[test]
    fn dynamic_datasources_are_created_and_rolled_back() {
        let mut project = Project::new(manifest(), registry(), ".").unwrap();
        let pool = project.create_dynamic_datasource("Pool", None, 120).unwrap();
        let token = project
            .create_dynamic_datasource("Token", Some(serde_json::json!({ "token": "usdc.near" })), 130)
            .unwrap();
        assert_eq!((pool, token), (1, 2));
        assert_eq!(project.active_ids(125).unwrap(), vec![0, 1]);
        assert_eq!(project.active_ids(130).unwrap(), vec![0, 1, 2]);

        let Datasource::Custom(CustomDatasource { processor, .. }) = &project.get(2).unwrap().datasource
        else {
            panic!("expected custom datasource");
        };
        assert_eq!(processor.options["decimals"], 6);
        assert_eq!(processor.options["token"], "usdc.near");

        assert!(project.create_dynamic_datasource("Missing", None, 130).is_err());

        assert_eq!(project.rollback_dynamic(125), Some(2));
        assert_eq!(project.dynamic_count(), 1);
        assert_eq!(project.rollback_dynamic(125), None);

        let params = project.dynamic_params();
        let mut restored = Project::new(manifest(), registry(), ".").unwrap();
        restored.restore_dynamic(&params).unwrap();
        assert_eq!(restored.dynamic_params(), params);
    }

    #[test]
    fn project_needs_datasources() {
        let empty = ProjectManifest::default();
        assert!(Project::new(empty, registry(), ".").is_err());
    }

    #[test]
    fn parses_snake_case_keys() {
        let m: ProjectManifest = serde_json::from_value(serde_json::json!({
            "network": { "chain_id": "mainnet" },
            "data_sources": [],
            "bypass_blocks": [1]
        }))
        .unwrap();
        assert_eq!(m.network.chain_id.as_deref(), Some("mainnet"));
        assert_eq!(m.bypass_blocks, vec![BypassBlock::Height(1)]);
    }
}
