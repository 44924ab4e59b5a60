//! NearIndex CLI — run and validate NEAR indexing projects.
//!
//! # Commands
//! ```text
//! nearindex run      --project <project.yaml> [--db <index.db>] [--unfinalized-blocks]
//! nearindex validate --project <project.yaml>
//! nearindex info
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use nearindex_core::dictionary::analyze_datasources;
use nearindex_core::{IndexerConfig, IndexerError, MetadataStore};
use nearindex_near::{GraphqlDictionary, IndexerBuilder};
use nearindex_storage::{InMemoryStorage, SqliteStorage};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod executor;
mod logging;
mod project_file;

use executor::LoggingExecutor;
use logging::LogConfig;
use project_file::{Overrides, ProjectFile};

#[derive(Parser)]
#[command(
    name = "nearindex",
    about = "Reorg-aware NEAR blockchain indexer — NearIndex CLI",
    long_about = "
NearIndex CLI: fetch NEAR blocks, match them against a project's datasources
and dispatch handlers in order, rolling back on forks.

ENVIRONMENT VARIABLES:
  NEARINDEX_PROJECT     Project file (YAML)
  NEARINDEX_ENDPOINT    NEAR JSON-RPC endpoint
  NEARINDEX_DB          SQLite metadata database
  NEARINDEX_LOG_LEVEL   Log level (RUST_LOG overrides it)
",
    version
)]
struct Cli {
    /// Log level: trace | debug | info | warn | error
    #[arg(long, global = true, env = "NEARINDEX_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit JSON structured logs
    #[arg(long, global = true, env = "NEARINDEX_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a project, logging every handler invocation
    Run(RunArgs),

    /// Load and validate a project without connecting to a node
    Validate {
        /// Path to the project file
        #[arg(short, long, env = "NEARINDEX_PROJECT")]
        project: PathBuf,
    },

    /// Show NearIndex defaults
    Info,
}

#[derive(Args)]
struct RunArgs {
    /// Path to the project file
    #[arg(short, long, env = "NEARINDEX_PROJECT")]
    project: PathBuf,

    /// Indexer id (default: project file name)
    #[arg(long, env = "NEARINDEX_ID")]
    id: Option<String>,

    /// NEAR JSON-RPC endpoint (overrides network.endpoint)
    #[arg(long, env = "NEARINDEX_ENDPOINT")]
    endpoint: Option<String>,

    /// Dictionary GraphQL endpoint (overrides network.dictionary)
    #[arg(long, env = "NEARINDEX_DICTIONARY")]
    dictionary: Option<String>,

    #[arg(long, env = "NEARINDEX_START_BLOCK")]
    start_block: Option<u64>,

    /// Stop after indexing this height
    #[arg(long, env = "NEARINDEX_END_BLOCK")]
    end_block: Option<u64>,

    /// Concurrent fetch workers
    #[arg(long, env = "NEARINDEX_WORKERS")]
    workers: Option<usize>,

    /// Heights per fetch job
    #[arg(long, env = "NEARINDEX_BATCH_SIZE")]
    batch_size: Option<u64>,

    /// Index past the finalized head and roll back on forks
    #[arg(long, env = "NEARINDEX_UNFINALIZED_BLOCKS")]
    unfinalized_blocks: bool,

    /// SQLite metadata database (default: in memory, no resume)
    #[arg(long, env = "NEARINDEX_DB")]
    db: Option<String>,
}

impl RunArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            id: self.id.clone(),
            endpoint: self.endpoint.clone(),
            dictionary: self.dictionary.clone(),
            start_block: self.start_block,
            end_block: self.end_block,
            workers: self.workers,
            batch_size: self.batch_size,
            unfinalized_blocks: self.unfinalized_blocks,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_tracing(&LogConfig {
        level: cli.log_level.clone(),
        json: cli.json_logs,
        ..LogConfig::default()
    });

    let result = match cli.command {
        Commands::Run(args) => cmd_run(args).await,
        Commands::Validate { project } => cmd_validate(&project),
        Commands::Info => {
            cmd_info();
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let kind = err.downcast_ref::<IndexerError>().map(IndexerError::kind);
            error!(kind = ?kind, error = %format!("{err:#}"), "nearindex failed");
            ExitCode::FAILURE
        }
    }
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    let file = ProjectFile::load(&args.project)?;
    let overrides = args.overrides();
    let config = file.indexer_config(&overrides);
    let project = file.project()?;

    let store: Arc<dyn MetadataStore> = match &args.db {
        Some(path) => Arc::new(
            SqliteStorage::open(path, config.id.clone())
                .await
                .with_context(|| format!("opening metadata database {path}"))?,
        ),
        None => {
            warn!("No --db given, progress will not survive a restart");
            Arc::new(InMemoryStorage::new(config.id.clone()))
        }
    };

    let mut builder = IndexerBuilder::from_config(config.clone());
    if let Some(url) = file.dictionary(&overrides) {
        info!(dictionary = %url, "Using dictionary");
        let dictionary = GraphqlDictionary::new(url, config.request_timeout())
            .context("creating dictionary client")?;
        builder = builder.dictionary(Arc::new(dictionary));
    }

    let mut indexer = builder
        .build_http(project, LoggingExecutor, store)
        .context("building indexer")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            on_signal.cancel();
        }
    });

    info!(
        id = %config.id,
        endpoint = %config.endpoint,
        workers = config.workers,
        unfinalized = config.unfinalized_blocks,
        "Starting indexer"
    );
    let summary = indexer.run(cancel).await.context("indexing failed")?;
    info!(
        last_indexed = ?summary.last_indexed,
        blocks = summary.blocks_indexed,
        rollbacks = summary.rollbacks,
        "Indexer stopped"
    );
    Ok(())
}

fn cmd_validate(path: &Path) -> Result<()> {
    let file = ProjectFile::load(path)?;
    let project = file.project()?;

    println!("Project {} is valid", path.display());
    println!("  Datasources: {}", project.all().count());
    println!("  Templates:   {}", project.templates().len());
    println!("  Start block: {}", project.start_height());

    let datasources: Vec<_> = project.all().map(|d| &d.datasource).collect();
    match analyze_datasources(datasources, project.registry())? {
        Ok(plan) => {
            println!("  Dictionary:  usable");
            println!("    query entries: {}", plan.entries.len());
            for entry in &plan.entries {
                let conditions: Vec<String> = entry
                    .conditions
                    .iter()
                    .map(|c| format!("{} {} {}", c.field, c.matcher, c.value))
                    .collect();
                println!("      {} [{}]", entry.entity, conditions.join(", "));
            }
            if !plan.block_modulos.is_empty() {
                println!("    block modulos: {:?}", plan.block_modulos);
            }
        }
        Err(reason) => {
            println!("  Dictionary:  full scan required");
            println!("    {reason}");
        }
    }
    Ok(())
}

fn cmd_info() {
    let defaults = IndexerConfig::default();
    println!("NearIndex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default endpoint: {}", defaults.endpoint);
    println!("  Default batch size: {} heights/job", defaults.batch_size);
    println!("  Default workers: {}", defaults.workers);
    println!("  Default fetch-ahead: {} heights", defaults.fetch_ahead);
    println!("  Default poll interval: {} ms", defaults.poll_interval_ms);
    println!("  Default request timeout: {} ms", defaults.request_timeout_ms);
    println!("  Default max retries: {}", defaults.retry.max_retries);
    println!("  Ancestry jump threshold: {} heights", defaults.ancestry_jump_threshold);
    println!("  Storage backends: memory, SQLite (--db)");
    println!("  Handler kinds: block, transaction, action, receipt");
}
