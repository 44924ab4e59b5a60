//! Per-block indexing: walks a decoded block in dependency order, matches
//! each entity against the active datasources and runs matched handlers.
//!
//! Dispatch order for one block:
//!
//! ```text
//! Block
//! └─ for each transaction
//!    ├─ Transaction
//!    ├─ its own actions
//!    └─ for each of its receipts
//!       ├─ Receipt
//!       └─ the receipt's actions
//! ```
//!
//! A datasource created by a handler becomes active for the next entity of
//! the same block, never for entities already dispatched.

use crate::datasource::{Datasource, HandlerKind};
use crate::error::IndexerError;
use crate::filter::{self, CursorKey, RuntimeFilter, ScheduleCursors};
use crate::handler::{DynamicDatasourceRequest, HandlerArgs, HandlerContext, HandlerExecutor};
use crate::project::Project;
use crate::types::{ActionView, Block, HandlerInput};

/// Outcome of indexing one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessBlockResponse {
    pub block_height: u64,
    pub block_hash: String,
    pub dynamic_ds_created: bool,
    pub handlers_invoked: usize,
}

/// Drives handler execution for blocks, in height order.
pub struct IndexerManager<E> {
    executor: E,
    cursors: ScheduleCursors,
}

impl<E: HandlerExecutor> IndexerManager<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            cursors: ScheduleCursors::new(),
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Forget schedule state of datasources removed by a rollback.
    pub fn on_rollback(&mut self, first_removed: Option<usize>) {
        if let Some(id) = first_removed {
            self.cursors.truncate_datasources(id);
        }
    }

    pub async fn index_block(
        &mut self,
        project: &mut Project,
        block: &Block,
    ) -> Result<ProcessBlockResponse, IndexerError> {
        let height = block.height();
        let mut run = BlockRun {
            active: project.active_ids(height)?,
            created: false,
            invoked: 0,
        };

        self.dispatch_entity(project, &mut run, height, HandlerInput::Block(block))
            .await?;

        for (tx_idx, tx) in block.transactions.iter().enumerate() {
            self.dispatch_entity(project, &mut run, height, HandlerInput::Transaction(tx))
                .await?;
            for action in block.transaction_actions(tx_idx) {
                let input = HandlerInput::Action(ActionView::new(block, action));
                self.dispatch_entity(project, &mut run, height, input).await?;
            }
            for (r_idx, receipt) in block.transaction_receipts(tx_idx) {
                self.dispatch_receipt(project, &mut run, block, r_idx, receipt)
                    .await?;
            }
        }

        // Receipts whose originating transaction is not part of this block.
        for (r_idx, receipt) in block.receipts.iter().enumerate() {
            if receipt.transaction.is_none() {
                self.dispatch_receipt(project, &mut run, block, r_idx, receipt)
                    .await?;
            }
        }

        tracing::debug!(
            height,
            hash = %block.hash(),
            handlers = run.invoked,
            datasources = run.active.len(),
            "Indexed block"
        );
        Ok(ProcessBlockResponse {
            block_height: height,
            block_hash: block.hash().to_string(),
            dynamic_ds_created: run.created,
            handlers_invoked: run.invoked,
        })
    }

    async fn dispatch_receipt(
        &mut self,
        project: &mut Project,
        run: &mut BlockRun,
        block: &Block,
        r_idx: usize,
        receipt: &crate::types::Receipt,
    ) -> Result<(), IndexerError> {
        let height = block.height();
        self.dispatch_entity(project, run, height, HandlerInput::Receipt(receipt))
            .await?;
        for action in block.receipt_actions(r_idx) {
            let input = HandlerInput::Action(ActionView::new(block, action));
            self.dispatch_entity(project, run, height, input).await?;
        }
        Ok(())
    }

    /// Dispatch one entity to every active datasource, then admit the
    /// datasources its handlers asked for.
    async fn dispatch_entity(
        &mut self,
        project: &mut Project,
        run: &mut BlockRun,
        height: u64,
        input: HandlerInput<'_>,
    ) -> Result<(), IndexerError> {
        let kind = handler_kind_of(&input);
        let mut requests = Vec::new();
        for &id in &run.active {
            run.invoked += self
                .dispatch_to_datasource(project, id, kind, height, input, &mut requests)
                .await?;
        }

        for request in requests {
            let id = project.create_dynamic_datasource(&request.template, request.args, height)?;
            run.created = true;
            if project.is_active(id, height)? {
                run.active.push(id);
            }
        }
        Ok(())
    }

    async fn dispatch_to_datasource(
        &mut self,
        project: &Project,
        id: usize,
        kind: HandlerKind,
        height: u64,
        input: HandlerInput<'_>,
        requests: &mut Vec<DynamicDatasourceRequest>,
    ) -> Result<usize, IndexerError> {
        let entry = project
            .get(id)
            .ok_or_else(|| IndexerError::Other(format!("datasource #{id} disappeared mid-block")))?;
        let mut invoked = 0;

        match &entry.datasource {
            Datasource::Runtime(rt) => {
                for (h_idx, handler) in rt.mapping.handlers.iter().enumerate() {
                    if handler.kind != kind {
                        continue;
                    }
                    let cursor = match &handler.filter {
                        Some(RuntimeFilter::Block(bf)) => {
                            self.cursors.cursor_for(CursorKey::new(id, h_idx), bf)?
                        }
                        _ => None,
                    };
                    if !filter::matches(&input, handler.filter.as_ref(), cursor) {
                        continue;
                    }
                    let mut ctx = HandlerContext::new(height);
                    self.executor
                        .execute(&mut ctx, &handler.handler, HandlerArgs::Entity(input))
                        .await?;
                    requests.extend(ctx.take_requests());
                    invoked += 1;
                }
            }
            Datasource::Custom(custom) => {
                for (h_idx, handler) in custom.mapping.handlers.iter().enumerate() {
                    let hp = project.registry().handler_processor(custom, &handler.kind)?;
                    if hp.base_handler_kind() != kind {
                        continue;
                    }
                    let key = CursorKey::new(id, h_idx);
                    if !filter::matches_any(&input, hp.base_filters(), &mut self.cursors, key)? {
                        continue;
                    }
                    if !hp.filter(&input, handler.filter.as_ref(), custom)? {
                        continue;
                    }
                    let outputs = hp
                        .transform(&input, custom, handler.filter.as_ref(), &entry.assets)
                        .await?;
                    tracing::trace!(
                        handler = %handler.handler,
                        outputs = outputs.len(),
                        "Transformed custom handler input"
                    );
                    // Later outputs may depend on earlier ones.
                    for output in &outputs {
                        let mut ctx = HandlerContext::new(height);
                        self.executor
                            .execute(&mut ctx, &handler.handler, HandlerArgs::Transformed(output))
                            .await?;
                        requests.extend(ctx.take_requests());
                        invoked += 1;
                    }
                }
            }
        }
        Ok(invoked)
    }
}

struct BlockRun {
    active: Vec<usize>,
    created: bool,
    invoked: usize,
}

fn handler_kind_of(input: &HandlerInput<'_>) -> HandlerKind {
    match input {
        HandlerInput::Block(_) => HandlerKind::Block,
        HandlerInput::Transaction(_) => HandlerKind::Transaction,
        HandlerInput::Receipt(_) => HandlerKind::Receipt,
        HandlerInput::Action(_) => HandlerKind::Action,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::ProcessorRegistry;
    use crate::project::ProjectManifest;
    use crate::types::Header;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(u64, String)>>,
    }

    #[async_trait]
    impl HandlerExecutor for Recorder {
        async fn execute(
            &self,
            ctx: &mut HandlerContext,
            handler: &str,
            _args: HandlerArgs<'_>,
        ) -> Result<(), IndexerError> {
            if handler == "fail" {
                return Err(IndexerError::handler(handler, "boom"));
            }
            self.calls
                .lock()
                .unwrap()
                .push((ctx.block_height(), handler.to_string()));
            Ok(())
        }
    }

    fn block(height: u64, timestamp_s: u64) -> Block {
        Block {
            header: Header {
                block_height: height,
                block_hash: format!("h{height}"),
                parent_hash: format!("h{}", height - 1),
                timestamp: timestamp_s * 1_000_000_000,
            },
            author: "node".into(),
            gas_price: "1".into(),
            transactions: vec![],
            receipts: vec![],
            actions: vec![],
        }
    }

    fn project(handlers: serde_json::Value) -> Project {
        let manifest: ProjectManifest = serde_json::from_value(serde_json::json!({
            "dataSources": [ { "kind": "near/Runtime", "mapping": { "handlers": handlers } } ]
        }))
        .unwrap();
        Project::new(manifest, ProcessorRegistry::new(), ".").unwrap()
    }

    #[tokio::test]
    async fn block_handlers_respect_modulo() {
        let mut project = project(serde_json::json!([
            { "kind": "near/BlockHandler", "handler": "every" },
            { "kind": "near/BlockHandler", "handler": "tenth", "filter": { "modulo": 10 } }
        ]));
        let mut manager = IndexerManager::new(Recorder::default());
        for h in 9..=11 {
            manager.index_block(&mut project, &block(h, h)).await.unwrap();
        }
        let calls = manager.executor().calls.lock().unwrap().clone();
        let names: Vec<_> = calls.iter().map(|(h, n)| format!("{h}:{n}")).collect();
        assert_eq!(names, vec!["9:every", "10:every", "10:tenth", "11:every"]);
    }

    #[tokio::test]
    async fn timestamp_filter_keeps_schedule_per_handler() {
        let mut project = project(serde_json::json!([
            { "kind": "near/BlockHandler", "handler": "minutely", "filter": { "timestamp": "* * * * *" } }
        ]));
        let mut manager = IndexerManager::new(Recorder::default());
        // 0s anchors, 30s is before the next minute, 61s fires.
        for (h, ts) in [(1, 0), (2, 30), (3, 61)] {
            manager.index_block(&mut project, &block(h, ts)).await.unwrap();
        }
        let calls = manager.executor().calls.lock().unwrap().clone();
        assert_eq!(calls, vec![(3, "minutely".to_string())]);
    }

    #[tokio::test]
    async fn handler_errors_abort_the_block() {
        let mut project = project(serde_json::json!([
            { "kind": "near/BlockHandler", "handler": "fail" },
            { "kind": "near/BlockHandler", "handler": "after" }
        ]));
        let mut manager = IndexerManager::new(Recorder::default());
        let err = manager.index_block(&mut project, &block(5, 5)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::HandlerExecution);
        assert!(manager.executor().calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_active_datasource_is_a_configuration_error() {
        let manifest: ProjectManifest = serde_json::from_value(serde_json::json!({
            "dataSources": [ { "kind": "near/Runtime", "startBlock": 100,
                "mapping": { "handlers": [ { "kind": "near/BlockHandler", "handler": "h" } ] } } ]
        }))
        .unwrap();
        let mut project = Project::new(manifest, ProcessorRegistry::new(), ".").unwrap();
        let mut manager = IndexerManager::new(Recorder::default());
        let err = manager.index_block(&mut project, &block(50, 1)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }
}
