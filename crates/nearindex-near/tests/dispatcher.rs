//! End-to-end tests for the fetch dispatcher against an in-process chain.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use nearindex_core::dictionary::DictionaryResult;
use nearindex_core::metadata::DynamicDatasourceParams;
use nearindex_core::types::HandlerInput;
use nearindex_core::{
    BlockRef, ChainClient, Dictionary, ErrorKind, HandlerArgs, HandlerContext, HandlerExecutor,
    Header, IndexerError, IndexerMetadata, MemoryMetadataStore, ProcessorRegistry,
    Project, ProjectManifest, QueryPlan, RawBlock,
};
use nearindex_near::IndexerBuilder;

// ─── Mock chain ──────────────────────────────────────────────────────────────

#[derive(Clone)]
struct ChainView {
    blocks: BTreeMap<u64, RawBlock>,
    finalized: u64,
    best: u64,
}

fn raw_block(height: u64, hash: &str, prev_hash: &str) -> RawBlock {
    serde_json::from_value(json!({
        "author": "node.near",
        "header": {
            "height": height,
            "hash": hash,
            "prev_hash": prev_hash,
            "timestamp": height * 1_000_000_000,
            "gas_price": "100000000"
        },
        "chunks": [],
        "transactions": []
    }))
    .unwrap()
}

/// Blocks at `heights`, each linked to the previous one present.
fn chain(heights: impl IntoIterator<Item = u64>, hash: impl Fn(u64) -> String, finalized: u64, best: u64) -> ChainView {
    let mut blocks = BTreeMap::new();
    let mut prev = "genesis".to_string();
    for h in heights {
        let this = hash(h);
        blocks.insert(h, raw_block(h, &this, &prev));
        prev = this;
    }
    ChainView {
        blocks,
        finalized,
        best,
    }
}

struct MockChain {
    chain_id: String,
    view: Mutex<ChainView>,
    fetched: Mutex<Vec<Vec<u64>>>,
    /// Earlier batches answer more slowly, so results arrive out of order.
    staggered: bool,
}

impl MockChain {
    fn new(view: ChainView) -> Arc<Self> {
        Arc::new(Self {
            chain_id: "testnet".into(),
            view: Mutex::new(view),
            fetched: Mutex::new(Vec::new()),
            staggered: false,
        })
    }

    fn staggered(view: ChainView) -> Arc<Self> {
        Arc::new(Self {
            chain_id: "testnet".into(),
            view: Mutex::new(view),
            fetched: Mutex::new(Vec::new()),
            staggered: true,
        })
    }

    fn switch(&self, view: ChainView) {
        *self.view.lock().unwrap() = view;
    }

    fn fetched(&self) -> Vec<Vec<u64>> {
        self.fetched.lock().unwrap().clone()
    }

    fn fetched_heights(&self) -> Vec<u64> {
        let mut all: Vec<u64> = self.fetched().into_iter().flatten().collect();
        all.sort_unstable();
        all.dedup();
        all
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn fetch_blocks(&self, heights: &[u64]) -> Result<Vec<Option<RawBlock>>, IndexerError> {
        self.fetched.lock().unwrap().push(heights.to_vec());
        if self.staggered {
            let first = heights.first().copied().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(40u64.saturating_sub(first * 2))).await;
        }
        let view = self.view.lock().unwrap();
        Ok(heights.iter().map(|h| view.blocks.get(h).cloned()).collect())
    }

    async fn get_header(&self, block: BlockRef) -> Result<Header, IndexerError> {
        let view = self.view.lock().unwrap();
        let found = match &block {
            BlockRef::Height(h) => view.blocks.range(..=*h).next_back().map(|(_, b)| b),
            BlockRef::Hash(hash) => view.blocks.values().find(|b| &b.header.hash == hash),
        };
        found
            .map(RawBlock::header)
            .ok_or_else(|| IndexerError::Other(format!("unknown block {block}")))
    }

    async fn get_finalized_header(&self) -> Result<Header, IndexerError> {
        let view = self.view.lock().unwrap();
        view.blocks
            .range(..=view.finalized)
            .next_back()
            .map(|(_, b)| b.header())
            .ok_or_else(|| IndexerError::Other("no finalized block".into()))
    }

    async fn get_best_height(&self) -> Result<u64, IndexerError> {
        Ok(self.view.lock().unwrap().best)
    }

    async fn get_chain_id(&self) -> Result<String, IndexerError> {
        Ok(self.chain_id.clone())
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

/// Records `handler@height:hash`. `spawn` creates an `Every` datasource at
/// height 5; the first time `a10` is indexed the chain switches to `fork`.
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<String>>,
    chain: Option<Arc<MockChain>>,
    fork: Mutex<Option<ChainView>>,
}

impl Recorder {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn heights(&self) -> Vec<u64> {
        self.calls()
            .iter()
            .filter_map(|c| c.split(['@', ':']).nth(1)?.parse().ok())
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
        let hash = match args {
            HandlerArgs::Entity(HandlerInput::Block(b)) => b.hash().to_string(),
            _ => "-".into(),
        };
        self.calls
            .lock()
            .unwrap()
            .push(format!("{handler}@{}:{hash}", ctx.block_height()));

        if handler == "spawn" && ctx.block_height() == 5 {
            ctx.create_dynamic_datasource("Every", None);
        }
        if hash == "a10" {
            if let (Some(chain), Some(fork)) = (&self.chain, self.fork.lock().unwrap().take()) {
                chain.switch(fork);
            }
        }
        Ok(())
    }
}

fn project(handlers: Value) -> Project {
    let manifest: ProjectManifest = serde_json::from_value(json!({
        "dataSources": [ { "kind": "near/Runtime", "startBlock": 1, "mapping": { "handlers": handlers } } ],
        "templates": [ {
            "kind": "near/Runtime",
            "name": "Every",
            "mapping": { "handlers": [ { "kind": "near/BlockHandler", "handler": "every" } ] }
        } ]
    }))
    .unwrap();
    Project::new(manifest, ProcessorRegistry::new(), ".").unwrap()
}

fn every_block() -> Value {
    json!([ { "kind": "near/BlockHandler", "handler": "every" } ])
}

fn builder(end: u64) -> IndexerBuilder {
    IndexerBuilder::new()
        .id("test")
        .end_block(end)
        .poll_interval_ms(5)
        .request_timeout_ms(2_000)
}

fn a_hash(h: u64) -> String {
    format!("a{h}")
}

// ─── Ordering ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn out_of_order_fetches_are_indexed_in_height_order() {
    let chain = MockChain::staggered(chain((1..=20).filter(|h| *h != 5 && *h != 13), a_hash, 30, 30));
    let store = Arc::new(MemoryMetadataStore::new());
    let mut indexer = builder(20)
        .workers(4)
        .batch_size(2)
        .fetch_ahead(20)
        .build(chain.clone(), project(every_block()), Recorder::default(), store.clone())
        .unwrap();

    let summary = indexer.run(CancellationToken::new()).await.unwrap();

    let expected: Vec<u64> = (1..=20).filter(|h| *h != 5 && *h != 13).collect();
    assert_eq!(indexer.executor().heights(), expected);
    assert_eq!(summary.blocks_indexed, 18);
    assert_eq!(summary.last_indexed, Some(20));
    assert_eq!(store.snapshot().unwrap().last_processed_height, Some(20));
    assert_eq!(store.snapshot().unwrap().chain_id.as_deref(), Some("testnet"));
}

#[tokio::test]
async fn bypassed_blocks_advance_progress_without_handlers() {
    let chain = MockChain::new(chain(1..=6, a_hash, 10, 10));
    let store = Arc::new(MemoryMetadataStore::new());
    let mut indexer = builder(6)
        .bypass_blocks([3, 4])
        .build(chain, project(every_block()), Recorder::default(), store.clone())
        .unwrap();

    indexer.run(CancellationToken::new()).await.unwrap();
    assert_eq!(indexer.executor().heights(), vec![1, 2, 5, 6]);
    assert_eq!(store.snapshot().unwrap().last_processed_height, Some(6));
}

// ─── Startup ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn configured_chain_id_must_match_node() {
    let chain = MockChain::new(chain(1..=3, a_hash, 3, 3));
    let mut indexer = builder(3)
        .chain_id("mainnet")
        .build(chain, project(every_block()), Recorder::default(), Arc::new(MemoryMetadataStore::new()))
        .unwrap();
    let err = indexer.run(CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(indexer.executor().calls().is_empty());
}

#[tokio::test]
async fn stored_chain_id_must_match_node() {
    let chain = MockChain::new(chain(1..=3, a_hash, 3, 3));
    let store = MemoryMetadataStore::with_metadata(IndexerMetadata {
        chain_id: Some("mainnet".into()),
        ..Default::default()
    });
    let mut indexer = builder(3)
        .build(chain, project(every_block()), Recorder::default(), Arc::new(store))
        .unwrap();
    let err = indexer.run(CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[tokio::test]
async fn resumes_after_last_processed_height_with_dynamic_datasources() {
    let chain = MockChain::new(chain(1..=12, a_hash, 12, 12));
    let store = Arc::new(MemoryMetadataStore::with_metadata(IndexerMetadata {
        chain_id: Some("testnet".into()),
        last_processed_height: Some(10),
        dynamic_datasources: vec![DynamicDatasourceParams {
            template_name: "Every".into(),
            args: None,
            start_block: 8,
        }],
        ..Default::default()
    }));
    let handlers = json!([ { "kind": "near/BlockHandler", "handler": "tick" } ]);
    let mut indexer = builder(12)
        .build(chain.clone(), project(handlers), Recorder::default(), store)
        .unwrap();

    indexer.run(CancellationToken::new()).await.unwrap();
    assert_eq!(
        indexer.executor().calls(),
        vec!["tick@11:a11", "every@11:a11", "tick@12:a12", "every@12:a12"]
    );
    assert_eq!(chain.fetched_heights(), vec![11, 12]);
    assert_eq!(indexer.project().dynamic_count(), 1);
}

#[tokio::test]
async fn cancellation_stops_a_live_indexer() {
    let chain = MockChain::new(chain(1..=3, a_hash, 3, 3));
    let mut indexer = IndexerBuilder::new()
        .poll_interval_ms(5)
        .build(chain, project(every_block()), Recorder::default(), Arc::new(MemoryMetadataStore::new()))
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let summary = indexer.run(cancel).await.unwrap();
    assert_eq!(summary.last_indexed, Some(3));
    assert_eq!(indexer.state(), nearindex_core::IndexerState::Stopped);
}

// ─── Pruning ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn block_modulo_prunes_finalized_heights_locally() {
    let chain = MockChain::new(chain(1..=20, a_hash, 50, 50));
    let handlers = json!([ { "kind": "near/BlockHandler", "handler": "tick", "filter": { "modulo": 5 } } ]);
    let mut indexer = builder(20)
        .build(chain.clone(), project(handlers), Recorder::default(), Arc::new(MemoryMetadataStore::new()))
        .unwrap();

    indexer.run(CancellationToken::new()).await.unwrap();
    assert_eq!(chain.fetched_heights(), vec![5, 10, 15, 20]);
    assert_eq!(indexer.executor().heights(), vec![5, 10, 15, 20]);
}

#[tokio::test]
async fn dynamic_datasource_invalidates_pruned_ranges() {
    let chain = MockChain::new(chain(1..=12, a_hash, 50, 50));
    let handlers = json!([ { "kind": "near/BlockHandler", "handler": "spawn", "filter": { "modulo": 5 } } ]);
    let store = Arc::new(MemoryMetadataStore::new());
    let mut indexer = builder(12)
        .workers(1)
        .build(chain.clone(), project(handlers), Recorder::default(), store.clone())
        .unwrap();

    indexer.run(CancellationToken::new()).await.unwrap();
    let names: Vec<String> = indexer
        .executor()
        .calls()
        .iter()
        .map(|c| c.split(':').next().unwrap().to_string())
        .collect();
    assert_eq!(
        names,
        vec![
            "spawn@5", "every@6", "every@7", "every@8", "every@9", "spawn@10", "every@10", "every@11",
            "every@12"
        ]
    );
    assert_eq!(chain.fetched()[0], vec![5, 10]);
    assert_eq!(store.snapshot().unwrap().dynamic_datasources.len(), 1);
}

struct FixedDictionary {
    heights: Option<Vec<u64>>,
}

#[async_trait]
impl Dictionary for FixedDictionary {
    async fn query_heights(
        &self,
        _start: u64,
        end: u64,
        _limit: usize,
        plan: &QueryPlan,
    ) -> Result<Option<DictionaryResult>, IndexerError> {
        assert_eq!(plan.entries[0].entity, "transactions");
        match &self.heights {
            Some(heights) => Ok(Some(DictionaryResult {
                heights: heights.clone(),
                last_scanned: end,
            })),
            None => Err(IndexerError::Connection("dictionary down".into())),
        }
    }
}

fn token_transactions() -> Value {
    json!([ { "kind": "near/TransactionHandler", "handler": "tx", "filter": { "receiver": "token.near" } } ])
}

#[tokio::test]
async fn dictionary_heights_replace_full_scan() {
    let chain = MockChain::new(chain(1..=12, a_hash, 50, 50));
    let mut indexer = builder(12)
        .dictionary(Arc::new(FixedDictionary {
            heights: Some(vec![4, 9]),
        }))
        .build(chain.clone(), project(token_transactions()), Recorder::default(), Arc::new(MemoryMetadataStore::new()))
        .unwrap();

    let summary = indexer.run(CancellationToken::new()).await.unwrap();
    assert_eq!(chain.fetched_heights(), vec![4, 9]);
    assert_eq!(summary.blocks_indexed, 2);
}

#[tokio::test]
async fn dictionary_failure_falls_back_to_full_scan() {
    let chain = MockChain::new(chain(1..=12, a_hash, 50, 50));
    let mut indexer = builder(12)
        .dictionary(Arc::new(FixedDictionary { heights: None }))
        .build(chain.clone(), project(token_transactions()), Recorder::default(), Arc::new(MemoryMetadataStore::new()))
        .unwrap();

    let summary = indexer.run(CancellationToken::new()).await.unwrap();
    assert_eq!(chain.fetched_heights(), (1..=12).collect::<Vec<_>>());
    assert_eq!(summary.blocks_indexed, 12);
}

// ─── Forks ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn fork_rolls_back_and_reindexes_canonical_blocks() {
    let fork_hash = |h: u64| if h <= 7 { format!("a{h}") } else { format!("b{h}") };
    let chain = MockChain::new(chain(1..=10, a_hash, 3, 10));
    let recorder = Recorder {
        chain: Some(chain.clone()),
        fork: Mutex::new(Some(self::chain(1..=12, fork_hash, 11, 12))),
        ..Default::default()
    };
    let store = Arc::new(MemoryMetadataStore::new());
    let mut indexer = builder(12)
        .workers(2)
        .batch_size(3)
        .unfinalized_blocks(true)
        .build(chain, project(every_block()), recorder, store.clone())
        .unwrap();

    let summary = indexer.run(CancellationToken::new()).await.unwrap();

    let mut expected: Vec<String> = (1..=10).map(|h| format!("every@{h}:a{h}")).collect();
    expected.extend((8..=12).map(|h| format!("every@{h}:b{h}")));
    assert_eq!(indexer.executor().calls(), expected);
    assert_eq!(summary.rollbacks, 1);

    let meta = store.snapshot().unwrap();
    assert_eq!(meta.last_processed_height, Some(12));
    assert_eq!(meta.last_finalized_verified_height, Some(11));
    let records: Vec<(u64, String)> = serde_json::from_str(meta.unfinalized_blocks.as_deref().unwrap()).unwrap();
    assert_eq!(records, vec![(12, "b12".to_string())]);
}
