//! YAML project files and the flags that override them.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nearindex_core::{IndexerConfig, ProcessorRegistry, Project, ProjectManifest};

/// Values given on the command line (or through `NEARINDEX_*` variables)
/// that take precedence over the project file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub id: Option<String>,
    pub endpoint: Option<String>,
    pub dictionary: Option<String>,
    pub start_block: Option<u64>,
    pub end_block: Option<u64>,
    pub workers: Option<usize>,
    pub batch_size: Option<u64>,
    pub unfinalized_blocks: bool,
}

/// A parsed project file together with the directory its assets live in.
#[derive(Debug, Clone)]
pub struct ProjectFile {
    pub path: PathBuf,
    pub manifest: ProjectManifest,
}

impl ProjectFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading project file {}", path.display()))?;
        let manifest: ProjectManifest = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing project file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            manifest,
        })
    }

    /// Directory asset paths are resolved against.
    pub fn root(&self) -> PathBuf {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Indexer id when none is given: the file name without extension.
    pub fn default_id(&self) -> String {
        self.path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("default")
            .to_string()
    }

    pub fn project(&self) -> Result<Project> {
        Project::new(self.manifest.clone(), ProcessorRegistry::new(), self.root())
            .context("validating project")
    }

    pub fn dictionary(&self, overrides: &Overrides) -> Option<String> {
        overrides
            .dictionary
            .clone()
            .or_else(|| self.manifest.network.dictionary.clone())
    }

    /// Indexer configuration: defaults, then the file, then `overrides`.
    pub fn indexer_config(&self, overrides: &Overrides) -> IndexerConfig {
        let network = &self.manifest.network;
        let mut config = IndexerConfig {
            id: overrides.id.clone().unwrap_or_else(|| self.default_id()),
            chain_id: network.chain_id.clone(),
            ..IndexerConfig::default()
        };
        if let Some(endpoint) = overrides.endpoint.clone().or_else(|| network.endpoint.clone()) {
            config.endpoint = endpoint;
        }
        config.start_block = overrides.start_block;
        config.end_block = overrides.end_block;
        if let Some(workers) = overrides.workers {
            config.workers = workers;
        }
        if let Some(batch_size) = overrides.batch_size {
            config.batch_size = batch_size;
        }
        config.unfinalized_blocks = overrides.unfinalized_blocks;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROJECT: &str = r#"
network:
  endpoint: https://rpc.testnet.near.org
  chainId: testnet
  dictionary: https://dictionary.example/graphql
dataSources:
  - kind: near/Runtime
    startBlock: 100
    mapping:
      file: ./dist/index.js
      handlers:
        - kind: near/BlockHandler
          handler: handleBlock
          filter:
            modulo: 10
        - kind: near/ActionHandler
          handler: handleTransfer
          filter:
            type: Transfer
bypassBlocks: [105, "110-120"]
"#;

    fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn file_values_fill_config() {
        let dir = tempfile::tempdir().unwrap();
        let file = ProjectFile::load(write(dir.path(), "ft-transfers.yaml", PROJECT)).unwrap();

        let config = file.indexer_config(&Overrides::default());
        assert_eq!(config.id, "ft-transfers");
        assert_eq!(config.endpoint, "https://rpc.testnet.near.org");
        assert_eq!(config.chain_id.as_deref(), Some("testnet"));
        assert_eq!(config.workers, IndexerConfig::default().workers);
        assert!(!config.unfinalized_blocks);
        assert_eq!(
            file.dictionary(&Overrides::default()).as_deref(),
            Some("https://dictionary.example/graphql")
        );
        assert_eq!(file.root(), dir.path());
    }

    #[test]
    fn flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = ProjectFile::load(write(dir.path(), "project.yaml", PROJECT)).unwrap();
        let overrides = Overrides {
            id: Some("ft".into()),
            endpoint: Some("http://localhost:3030".into()),
            dictionary: Some("http://localhost:3000".into()),
            start_block: Some(150),
            end_block: Some(200),
            workers: Some(8),
            batch_size: Some(25),
            unfinalized_blocks: true,
        };

        let config = file.indexer_config(&overrides);
        assert_eq!(config.id, "ft");
        assert_eq!(config.endpoint, "http://localhost:3030");
        assert_eq!((config.start_block, config.end_block), (Some(150), Some(200)));
        assert_eq!(config.workers, 8);
        assert_eq!(config.batch_size, 25);
        assert!(config.unfinalized_blocks);
        assert_eq!(file.dictionary(&overrides).as_deref(), Some("http://localhost:3000"));
        config.validate().unwrap();
    }

    #[test]
    fn project_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let file = ProjectFile::load(write(dir.path(), "project.yaml", PROJECT)).unwrap();

        let project = file.project().unwrap();
        assert_eq!(project.start_height(), 100);
        assert!(project.is_bypassed(105));
        assert!(project.is_bypassed(115));
        assert!(!project.is_bypassed(121));
    }

    #[test]
    fn empty_project_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = ProjectFile::load(write(dir.path(), "empty.yaml", "network: {}\n")).unwrap();
        assert!(file.project().is_err());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = ProjectFile::load("/nonexistent/project.yaml").unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/project.yaml"));
    }
}
