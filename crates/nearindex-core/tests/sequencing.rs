//! Integration tests for decoding and per-block dispatch.
//!
//! The block under test is `fixtures/near/ordering-block.json`: transaction
//! T1 with two actions and receipts R1 (one action) and R2 (data), then
//! transaction T2 with one action.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use nearindex_core::datasource::CustomDatasource;
use nearindex_core::filter::{self, RuntimeFilter, TransactionFilter};
use nearindex_core::processor::Assets;
use nearindex_core::types::{ActionOwner, HandlerInput};
use nearindex_core::{
    decode, Block, DatasourceProcessor, HandlerArgs, HandlerContext, HandlerExecutor, HandlerKind,
    HandlerProcessor, IndexerError, IndexerManager, ProcessorRegistry, Project, ProjectManifest,
    RawBlock,
};

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn fixture_block() -> Block {
    let mut p = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    p.push("../../fixtures/near/ordering-block.json");
    let content = std::fs::read_to_string(p).expect("fixture not found");
    let raw: RawBlock = serde_json::from_str(&content).expect("invalid fixture JSON");
    decode(&raw).expect("fixture must decode")
}

fn label(args: &HandlerArgs<'_>) -> String {
    match args {
        HandlerArgs::Entity(HandlerInput::Block(b)) => format!("block:{}", b.height()),
        HandlerArgs::Entity(HandlerInput::Transaction(tx)) => format!("tx:{}", tx.hash),
        HandlerArgs::Entity(HandlerInput::Receipt(r)) => format!("receipt:{}", r.receipt_id),
        HandlerArgs::Entity(HandlerInput::Action(view)) => {
            let owner = match (view.transaction, view.receipt) {
                (_, Some(r)) => r.receipt_id.clone(),
                (Some(tx), None) => tx.hash.clone(),
                (None, None) => "?".into(),
            };
            format!("action:{owner}:{}", view.action.id)
        }
        HandlerArgs::Transformed(v) => format!(
            "out:{}:{}:{}",
            v["tx"].as_str().unwrap_or("?"),
            v["step"],
            v.get("tag").and_then(Value::as_str).unwrap_or("-")
        ),
    }
}

/// Records `handler@label` for every invocation. The `spawn` handler asks
/// for a `Watcher` datasource.
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<String>>,
}

impl Recorder {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn labels_for(&self, handler: &str) -> Vec<String> {
        let prefix = format!("{handler}@");
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl HandlerExecutor for Recorder {
    async fn execute(
        &self,
        ctx: &mut HandlerContext,
        handler: &str,
        args: HandlerArgs<'_>,
    ) -> Result<(), IndexerError> {
        if handler == "spawn" {
            ctx.create_dynamic_datasource("Watcher", Some(json!({ "reason": "test" })));
        }
        self.calls
            .lock()
            .unwrap()
            .push(format!("{handler}@{}", label(&args)));
        Ok(())
    }
}

fn project(manifest: Value, registry: ProcessorRegistry) -> Project {
    let manifest: ProjectManifest = serde_json::from_value(manifest).unwrap();
    Project::new(manifest, registry, env!("CARGO_MANIFEST_DIR")).unwrap()
}

fn wildcard_handlers(prefix: &str) -> Value {
    json!([
        { "kind": "near/BlockHandler", "handler": prefix },
        { "kind": "near/TransactionHandler", "handler": prefix },
        { "kind": "near/ReceiptHandler", "handler": prefix },
        { "kind": "near/ActionHandler", "handler": prefix }
    ])
}

// ─── Decoding ─────────────────────────────────────────────────────────────────

#[test]
fn decode_is_idempotent() {
    assert_eq!(fixture_block(), fixture_block());
}

#[test]
fn every_action_has_exactly_one_owner() {
    let block = fixture_block();
    let from_transactions: usize = (0..block.transactions.len())
        .map(|i| block.transaction_actions(i).count())
        .sum();
    let from_receipts: usize = (0..block.receipts.len())
        .map(|i| block.receipt_actions(i).count())
        .sum();
    assert_eq!(block.actions.len(), from_transactions + from_receipts);
    assert_eq!(block.actions.len(), 4);

    let owners: HashSet<_> = block.actions.iter().map(|a| (a.owner, a.id)).collect();
    assert_eq!(owners.len(), block.actions.len(), "duplicate actions");

    for action in &block.actions {
        if let ActionOwner::Receipt(r) = action.owner {
            assert_eq!(action.transaction, block.receipts[r].transaction);
        }
    }
}

#[test]
fn missing_filter_matches_every_entity() {
    let block = fixture_block();
    let mut inputs = vec![HandlerInput::Block(&block)];
    inputs.extend(block.transactions.iter().map(HandlerInput::Transaction));
    inputs.extend(block.receipts.iter().map(HandlerInput::Receipt));
    inputs.extend(
        block
            .actions
            .iter()
            .map(|a| HandlerInput::Action(nearindex_core::types::ActionView::new(&block, a))),
    );
    for input in &inputs {
        assert!(filter::matches(input, None, None), "{}", input.label());
    }
}

// ─── Dispatch order ───────────────────────────────────────────────────────────

#[tokio::test]
async fn entities_dispatch_in_dependency_order() {
    let mut project = project(
        json!({ "dataSources": [ { "kind": "near/Runtime", "mapping": { "handlers": wildcard_handlers("all") } } ] }),
        ProcessorRegistry::new(),
    );
    let mut manager = IndexerManager::new(Recorder::default());
    let response = manager.index_block(&mut project, &fixture_block()).await.unwrap();

    assert_eq!(
        manager.executor().labels_for("all"),
        vec![
            "block:100",
            "tx:T1",
            "action:T1:0",
            "action:T1:1",
            "receipt:R1",
            "action:R1:0",
            "receipt:R2",
            "tx:T2",
            "action:T2:0",
        ]
    );
    assert_eq!(response.handlers_invoked, 9);
    assert_eq!(response.block_hash, "B100");
    assert!(!response.dynamic_ds_created);
}

#[tokio::test]
async fn filters_select_entities() {
    let mut project = project(
        json!({ "dataSources": [ { "kind": "near/Runtime", "mapping": { "handlers": [
            { "kind": "near/TransactionHandler", "handler": "bob", "filter": { "sender": "bob.near" } },
            { "kind": "near/ReceiptHandler", "handler": "toToken", "filter": { "receiver": "token.near" } },
            { "kind": "near/ActionHandler", "handler": "ftTransfer",
              "filter": { "type": "FunctionCall", "methodName": "ft_transfer" } },
            { "kind": "near/ActionHandler", "handler": "fullKeys",
              "filter": { "type": "AddKey", "accessKey": "FullAccess" } },
            { "kind": "near/BlockHandler", "handler": "odd", "filter": { "modulo": 3 } }
        ] } } ] }),
        ProcessorRegistry::new(),
    );
    let mut manager = IndexerManager::new(Recorder::default());
    manager.index_block(&mut project, &fixture_block()).await.unwrap();

    assert_eq!(
        manager.executor().calls(),
        vec![
            "ftTransfer@action:T1:0",
            "toToken@receipt:R1",
            "bob@tx:T2",
            "fullKeys@action:T2:0",
        ]
    );
}

// ─── Dynamic datasources ──────────────────────────────────────────────────────

#[tokio::test]
async fn dynamic_datasource_applies_from_next_entity() {
    let mut project = project(
        json!({
            "dataSources": [ { "kind": "near/Runtime", "mapping": { "handlers": [
                { "kind": "near/TransactionHandler", "handler": "spawn", "filter": { "receiver": "token.near" } }
            ] } } ],
            "templates": [ { "kind": "near/Runtime", "name": "Watcher", "mapping": { "handlers": wildcard_handlers("watch") } } ]
        }),
        ProcessorRegistry::new(),
    );
    let mut manager = IndexerManager::new(Recorder::default());
    let response = manager.index_block(&mut project, &fixture_block()).await.unwrap();
    assert!(response.dynamic_ds_created);

    // Created while handling T1: nothing up to and including T1 is seen.
    assert_eq!(
        manager.executor().labels_for("watch"),
        vec![
            "action:T1:0",
            "action:T1:1",
            "receipt:R1",
            "action:R1:0",
            "receipt:R2",
            "tx:T2",
            "action:T2:0",
        ]
    );

    let params = project.dynamic_params();
    assert_eq!(params.len(), 1);
    assert_eq!(params[0].template_name, "Watcher");
    assert_eq!(params[0].start_block, 100);
}

#[tokio::test]
async fn unknown_template_fails_the_block() {
    let mut project = project(
        json!({ "dataSources": [ { "kind": "near/Runtime", "mapping": { "handlers": [
            { "kind": "near/TransactionHandler", "handler": "spawn" }
        ] } } ] }),
        ProcessorRegistry::new(),
    );
    let mut manager = IndexerManager::new(Recorder::default());
    let err = manager.index_block(&mut project, &fixture_block()).await.unwrap_err();
    assert_eq!(err.kind(), nearindex_core::ErrorKind::Configuration);
}

// ─── Custom datasources ───────────────────────────────────────────────────────

/// Emits one output per log line plus a trailer, for transactions to
/// `token.near`.
struct LogLines {
    base: Vec<RuntimeFilter>,
}

#[async_trait]
impl HandlerProcessor for LogLines {
    fn base_handler_kind(&self) -> HandlerKind {
        HandlerKind::Transaction
    }

    fn base_filters(&self) -> &[RuntimeFilter] {
        &self.base
    }

    fn filter(
        &self,
        input: &HandlerInput<'_>,
        filter: Option<&Value>,
        _ds: &CustomDatasource,
    ) -> Result<bool, IndexerError> {
        let wanted = filter.and_then(|f| f.get("signer")).and_then(Value::as_str);
        Ok(match (input, wanted) {
            (HandlerInput::Transaction(tx), Some(signer)) => tx.signer_id == signer,
            _ => true,
        })
    }

    async fn transform(
        &self,
        input: &HandlerInput<'_>,
        ds: &CustomDatasource,
        _filter: Option<&Value>,
        assets: &Assets,
    ) -> Result<Vec<Value>, IndexerError> {
        let HandlerInput::Transaction(tx) = input else {
            return Ok(vec![]);
        };
        let tag = ds.processor.options.get("tag").cloned().unwrap_or(Value::Null);
        Ok(vec![
            json!({ "tx": tx.hash, "step": 1, "tag": tag }),
            json!({ "tx": tx.hash, "step": 2, "assets": assets.len() }),
        ])
    }
}

struct LogProcessor;

impl DatasourceProcessor for LogProcessor {
    fn kind(&self) -> &str {
        "near/Logs"
    }

    fn validate(&self, _ds: &CustomDatasource, _assets: &Assets) -> Result<(), IndexerError> {
        Ok(())
    }

    fn handler_processor(&self, kind: &str) -> Option<Arc<dyn HandlerProcessor>> {
        (kind == "near/LogHandler").then(|| {
            Arc::new(LogLines {
                base: vec![RuntimeFilter::Transaction(TransactionFilter {
                    sender: None,
                    receiver: Some("token.near".into()),
                })],
            }) as Arc<dyn HandlerProcessor>
        })
    }
}

#[tokio::test]
async fn custom_handlers_run_transformed_outputs_in_order() {
    let mut registry = ProcessorRegistry::new();
    registry.register("./logs.js", Arc::new(LogProcessor));
    let mut project = project(
        json!({ "dataSources": [ {
            "kind": "near/Logs",
            "processor": { "file": "./logs.js", "options": { "tag": "t" } },
            "mapping": { "handlers": [
                { "kind": "near/LogHandler", "handler": "onLog", "filter": { "signer": "alice.near" } },
                { "kind": "near/LogHandler", "handler": "onBob", "filter": { "signer": "bob.near" } }
            ] }
        } ] }),
        registry,
    );
    let mut manager = IndexerManager::new(Recorder::default());
    let response = manager.index_block(&mut project, &fixture_block()).await.unwrap();

    assert_eq!(
        manager.executor().calls(),
        vec![
            "onLog@out:T1:1:t",
            "onLog@out:T1:2:-",
        ]
    );
    assert_eq!(response.handlers_invoked, 2);
}
