//! The fetch dispatcher: a pool of fetch workers feeding a single
//! coordinator that indexes blocks strictly in height order.
//!
//! ```text
//!            jobs (mpsc)                 results (mpsc, generation-tagged)
//! coordinator ──────────► worker 0..N ─────────────────────────► coordinator
//!     │                  fetch + decode                              │
//!     │                                                    reorder buffer
//!     └── tracker → sequencer → metadata  ◄── release in height order ┘
//! ```
//!
//! Only the coordinator touches the tracker, the project and the metadata
//! store. A rollback bumps the generation, so results fetched for the
//! abandoned branch are dropped on arrival.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use nearindex_core::dictionary::build_query_plan;
use nearindex_core::{
    decode, Block, ChainClient, Dictionary, HandlerExecutor, IndexerConfig, IndexerError,
    IndexerManager, IndexerState, MetadataStore, Project, UnfinalizedBlocks,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Heights covered by one dictionary query.
pub const DICTIONARY_WINDOW: u64 = 10_000;

/// What a run accomplished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub last_indexed: Option<u64>,
    pub blocks_indexed: u64,
    pub rollbacks: u32,
}

#[derive(Debug)]
enum Slot {
    Block(Box<Block>),
    /// The chain has no block at this height.
    Missing,
    /// No handler can match anywhere from this height up to the given one.
    Skip(u64),
}

#[derive(Debug)]
struct FetchJob {
    generation: u64,
    heights: Vec<u64>,
}

#[derive(Debug)]
struct FetchResult {
    generation: u64,
    heights: Vec<u64>,
    outcome: Result<Vec<Option<Block>>, IndexerError>,
}

/// Coordinates fetch workers, fork tracking and the per-block sequencer.
pub struct FetchDispatcher<C, E> {
    config: IndexerConfig,
    client: Arc<C>,
    project: Project,
    manager: IndexerManager<E>,
    store: Arc<dyn MetadataStore>,
    tracker: Option<UnfinalizedBlocks>,
    dictionary: Option<Arc<dyn Dictionary>>,
    state: IndexerState,
    generation: u64,
    buffer: BTreeMap<u64, Slot>,
    next_to_index: u64,
    next_to_fetch: u64,
    finalized_height: u64,
    target_height: u64,
    summary: RunSummary,
}

impl<C, E> FetchDispatcher<C, E>
where
    C: ChainClient + 'static,
    E: HandlerExecutor,
{
    pub fn new(
        config: IndexerConfig,
        client: Arc<C>,
        project: Project,
        executor: E,
        store: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            config,
            client,
            project,
            manager: IndexerManager::new(executor),
            store,
            tracker: None,
            dictionary: None,
            state: IndexerState::Idle,
            generation: 0,
            buffer: BTreeMap::new(),
            next_to_index: 0,
            next_to_fetch: 0,
            finalized_height: 0,
            target_height: 0,
            summary: RunSummary::default(),
        }
    }

    pub fn with_dictionary(mut self, dictionary: Arc<dyn Dictionary>) -> Self {
        self.dictionary = Some(dictionary);
        self
    }

    pub fn state(&self) -> IndexerState {
        self.state
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn executor(&self) -> &E {
        self.manager.executor()
    }

    /// Index until `end_block` (when configured), a fatal error, or
    /// cancellation.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<RunSummary, IndexerError> {
        if let Err(e) = self.startup().await {
            self.state = IndexerState::Error;
            return Err(e);
        }

        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (result_tx, mut result_rx) = mpsc::unbounded_channel();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let workers: Vec<JoinHandle<()>> = (0..self.config.workers)
            .map(|worker| {
                tokio::spawn(fetch_worker(
                    worker,
                    self.client.clone(),
                    job_rx.clone(),
                    result_tx.clone(),
                ))
            })
            .collect();
        drop(result_tx);

        let outcome = self.coordinate(&cancel, &job_tx, &mut result_rx).await;

        drop(job_tx);
        for worker in workers {
            worker.abort();
        }

        match outcome {
            Ok(()) => {
                self.state = IndexerState::Stopped;
                tracing::info!(
                    last = ?self.summary.last_indexed,
                    blocks = self.summary.blocks_indexed,
                    rollbacks = self.summary.rollbacks,
                    "Indexer stopped"
                );
                Ok(self.summary.clone())
            }
            Err(e) => {
                self.state = IndexerState::Error;
                tracing::error!(
                    kind = %e.kind(),
                    error = %e,
                    height = self.next_to_index,
                    "Indexer failed"
                );
                Err(e)
            }
        }
    }

    // ─── Startup ─────────────────────────────────────────────────────────────

    async fn startup(&mut self) -> Result<(), IndexerError> {
        self.config.validate()?;

        let chain_id = self.client.get_chain_id().await?;
        if let Some(expected) = self.config.chain_id.as_deref() {
            if expected != chain_id {
                return Err(IndexerError::Configuration(format!(
                    "chain id mismatch: configured '{expected}', node reports '{chain_id}'"
                )));
            }
        }

        let metadata = self.store.load().await?.unwrap_or_default();
        if let Some(stored) = metadata.chain_id.as_deref() {
            if stored != chain_id {
                return Err(IndexerError::Configuration(format!(
                    "chain id mismatch: metadata was written for '{stored}', node reports '{chain_id}'"
                )));
            }
        }
        self.store.save_chain_id(&chain_id).await?;

        if self.project.dynamic_count() == 0 {
            self.project.restore_dynamic(&metadata.dynamic_datasources)?;
        }

        if self.config.unfinalized_blocks {
            self.tracker = Some(UnfinalizedBlocks::load(
                &metadata,
                self.config.ancestry_jump_threshold,
            )?);
        }

        let start = match metadata.last_processed_height {
            Some(h) => h + 1,
            None => self
                .config
                .start_block
                .unwrap_or(0)
                .max(self.project.start_height()),
        };
        self.next_to_index = start;
        self.next_to_fetch = start;

        tracing::info!(
            id = %self.config.id,
            chain_id = %chain_id,
            start,
            end = ?self.config.end_block,
            workers = self.config.workers,
            unfinalized = self.config.unfinalized_blocks,
            dynamic_datasources = self.project.dynamic_count(),
            "Starting indexer"
        );
        Ok(())
    }

    // ─── Coordinator loop ────────────────────────────────────────────────────

    async fn coordinate(
        &mut self,
        cancel: &CancellationToken,
        jobs: &UnboundedSender<FetchJob>,
        results: &mut UnboundedReceiver<FetchResult>,
    ) -> Result<(), IndexerError> {
        self.refresh_heads().await?;
        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.is_done() {
                return Ok(());
            }
            self.schedule(jobs).await?;
            self.release().await?;
            if self.is_done() {
                return Ok(());
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.state = IndexerState::Stopping;
                    tracing::info!(height = self.next_to_index, "Shutdown requested");
                    return Ok(());
                }
                Some(result) = results.recv() => self.accept(result)?,
                _ = poll.tick() => self.refresh_heads().await?,
            }
        }
    }

    fn is_done(&self) -> bool {
        self.config
            .end_block
            .map_or(false, |end| self.next_to_index > end)
    }

    async fn refresh_heads(&mut self) -> Result<(), IndexerError> {
        let finalized = self.client.get_finalized_header().await?;
        self.finalized_height = finalized.block_height;
        self.target_height = match self.tracker.as_mut() {
            Some(tracker) => {
                tracker.register_finalized_header(finalized);
                self.client.get_best_height().await?.max(self.finalized_height)
            }
            None => self.finalized_height,
        };

        if self.state != IndexerState::Rollback {
            let next = if self.next_to_index > self.finalized_height {
                IndexerState::Live
            } else {
                IndexerState::Syncing
            };
            if next != self.state {
                tracing::info!(
                    state = %next,
                    height = self.next_to_index,
                    finalized = self.finalized_height,
                    target = self.target_height,
                    "Indexer state changed"
                );
                self.state = next;
            }
        }
        Ok(())
    }

    /// Highest height that may be queued right now.
    fn fetch_limit(&self) -> u64 {
        let window_end = self.next_to_index + self.config.fetch_ahead - 1;
        let limit = self.target_height.min(window_end);
        match self.config.end_block {
            Some(end) => limit.min(end),
            None => limit,
        }
    }

    async fn schedule(&mut self, jobs: &UnboundedSender<FetchJob>) -> Result<(), IndexerError> {
        while self.next_to_fetch <= self.fetch_limit() {
            let start = self.next_to_fetch;
            if let Some((heights, last)) = self.prune(start).await? {
                let mut cursor = start;
                for &h in &heights {
                    if h > cursor {
                        self.buffer.insert(cursor, Slot::Skip(h - 1));
                    }
                    cursor = h + 1;
                }
                if last >= cursor {
                    self.buffer.insert(cursor, Slot::Skip(last));
                }
                for batch in heights.chunks(self.config.batch_size as usize) {
                    self.send_job(jobs, batch.to_vec())?;
                }
                tracing::debug!(start, last, fetch = heights.len(), "Pruned range");
                self.next_to_fetch = last + 1;
            } else {
                let end = (start + self.config.batch_size - 1).min(self.fetch_limit());
                self.send_job(jobs, (start..=end).collect())?;
                self.next_to_fetch = end + 1;
            }
        }
        Ok(())
    }

    fn send_job(&self, jobs: &UnboundedSender<FetchJob>, heights: Vec<u64>) -> Result<(), IndexerError> {
        tracing::trace!(
            generation = self.generation,
            from = heights.first(),
            to = heights.last(),
            "Queued fetch job"
        );
        jobs.send(FetchJob {
            generation: self.generation,
            heights,
        })
        .map_err(|_| IndexerError::Other("fetch workers stopped".into()))
    }

    /// Heights worth fetching from `start`, plus the last height the answer
    /// covers. `None` means scan every height.
    ///
    /// Only finalized heights are pruned. Dictionary failures degrade to a
    /// full scan.
    async fn prune(&self, start: u64) -> Result<Option<(Vec<u64>, u64)>, IndexerError> {
        if start > self.finalized_height {
            return Ok(None);
        }
        let mut end = self
            .finalized_height
            .min(start.saturating_add(DICTIONARY_WINDOW - 1));
        if let Some(end_block) = self.config.end_block {
            end = end.min(end_block);
        }

        let datasources = self
            .project
            .all()
            .map(|e| &e.datasource)
            .filter(|ds| ds.start_block() <= end && ds.end_block().map_or(true, |e| e >= start));
        let Some(plan) = build_query_plan(datasources, self.project.registry())? else {
            return Ok(None);
        };

        let batch = self.config.batch_size as usize;
        let mut heights = BTreeSet::new();
        let last = if plan.needs_query() {
            let Some(dictionary) = &self.dictionary else {
                return Ok(None);
            };
            match dictionary.query_heights(start, end, batch, &plan).await {
                Ok(Some(result)) if result.last_scanned >= start => {
                    let last = result.last_scanned.min(end);
                    heights.extend(result.heights.into_iter().filter(|h| (start..=last).contains(h)));
                    last
                }
                Ok(_) => {
                    tracing::debug!(start, end, "Dictionary has no data for range, scanning");
                    return Ok(None);
                }
                Err(e) => {
                    tracing::warn!(start, end, error = %e, "Dictionary query failed, scanning");
                    return Ok(None);
                }
            }
        } else {
            end
        };
        heights.extend(plan.modulo_heights(start, last));

        let mut heights: Vec<u64> = heights.into_iter().collect();
        let last = if heights.len() > batch {
            heights.truncate(batch);
            heights[batch - 1]
        } else {
            last
        };
        Ok(Some((heights, last)))
    }

    fn accept(&mut self, result: FetchResult) -> Result<(), IndexerError> {
        if result.generation != self.generation {
            tracing::trace!(
                generation = result.generation,
                current = self.generation,
                "Dropping stale fetch result"
            );
            return Ok(());
        }
        let blocks = result.outcome?;
        for (height, block) in result.heights.into_iter().zip(blocks) {
            if height < self.next_to_index {
                continue;
            }
            let slot = match block {
                Some(block) => Slot::Block(Box::new(block)),
                None => Slot::Missing,
            };
            self.buffer.insert(height, slot);
        }
        Ok(())
    }

    /// Index buffered heights while they are contiguous.
    async fn release(&mut self) -> Result<(), IndexerError> {
        while !self.is_done() {
            let height = self.next_to_index;
            let Some(slot) = self.buffer.remove(&height) else {
                break;
            };
            match slot {
                Slot::Block(block) => self.index(*block).await?,
                Slot::Missing => {
                    if let Some(tracker) = self.tracker.as_mut() {
                        tracker.skip_height(height)?;
                    }
                    self.next_to_index = height + 1;
                }
                Slot::Skip(end) => {
                    if let Some(tracker) = self.tracker.as_mut() {
                        tracker.skip_range(height, end)?;
                    }
                    self.next_to_index = end + 1;
                }
            }
        }
        Ok(())
    }

    // ─── Per-block pipeline ──────────────────────────────────────────────────

    async fn index(&mut self, block: Block) -> Result<(), IndexerError> {
        let height = block.height();
        if let Some(tracker) = self.tracker.as_mut() {
            if let Some(target) = tracker.process_block(self.client.as_ref(), &block.header).await? {
                return self.rollback(target).await;
            }
        }

        if self.is_bypassed(height) {
            tracing::debug!(height, "Bypassing block");
        } else {
            let response = self.manager.index_block(&mut self.project, &block).await?;
            if response.dynamic_ds_created {
                self.store
                    .save_dynamic_datasources(&self.project.dynamic_params())
                    .await?;
                self.invalidate_pruning(height);
            }
        }

        self.store
            .save_progress(height, block.header.timestamp_ms())
            .await?;
        if let Some(tracker) = &self.tracker {
            self.store.save_unfinalized(&tracker.persisted_state()?).await?;
        }

        self.next_to_index = height + 1;
        self.summary.last_indexed = Some(height);
        self.summary.blocks_indexed += 1;
        Ok(())
    }

    fn is_bypassed(&self, height: u64) -> bool {
        self.project.is_bypassed(height) || self.config.bypass_blocks.contains(&height)
    }

    /// Pruned ranges were computed for the old datasource set; refetch
    /// everything above `height`.
    fn invalidate_pruning(&mut self, height: u64) {
        if !self.buffer.values().any(|s| matches!(s, Slot::Skip(_))) {
            return;
        }
        self.generation += 1;
        self.buffer.clear();
        self.next_to_fetch = height + 1;
        tracing::debug!(height, generation = self.generation, "Datasources changed, refetching");
    }

    /// Discard everything above `target` and resume from `target + 1`.
    async fn rollback(&mut self, target: u64) -> Result<(), IndexerError> {
        self.state = IndexerState::Rollback;
        tracing::warn!(target, from = self.next_to_index, "Rolling back");

        self.generation += 1;
        self.buffer.clear();

        self.store.rollback(target).await?;
        let first_removed = self.project.rollback_dynamic(target);
        self.manager.on_rollback(first_removed);
        self.store
            .save_dynamic_datasources(&self.project.dynamic_params())
            .await?;

        if let Some(tracker) = self.tracker.as_mut() {
            tracker.rollback_to(target);
            let persisted = tracker.persisted_state()?;
            self.store.save_unfinalized(&persisted).await?;
        }

        self.next_to_index = target + 1;
        self.next_to_fetch = target + 1;
        self.summary.rollbacks += 1;
        self.state = if self.next_to_index > self.finalized_height {
            IndexerState::Live
        } else {
            IndexerState::Syncing
        };
        tracing::info!(target, generation = self.generation, "Rollback complete");
        Ok(())
    }
}

// ─── Workers ─────────────────────────────────────────────────────────────────

async fn fetch_worker<C: ChainClient + ?Sized>(
    worker: usize,
    client: Arc<C>,
    jobs: Arc<Mutex<UnboundedReceiver<FetchJob>>>,
    results: UnboundedSender<FetchResult>,
) {
    loop {
        let job = jobs.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };
        let outcome = fetch_and_decode(client.as_ref(), &job.heights).await;
        let result = FetchResult {
            generation: job.generation,
            heights: job.heights,
            outcome,
        };
        if results.send(result).is_err() {
            break;
        }
    }
    tracing::debug!(worker, "Fetch worker stopped");
}

async fn fetch_and_decode<C: ChainClient + ?Sized>(
    client: &C,
    heights: &[u64],
) -> Result<Vec<Option<Block>>, IndexerError> {
    let raw = client.fetch_blocks(heights).await?;
    if raw.len() != heights.len() {
        return Err(IndexerError::Other(format!(
            "requested {} blocks, node returned {}",
            heights.len(),
            raw.len()
        )));
    }
    heights
        .iter()
        .zip(&raw)
        .map(|(&height, raw)| {
            let Some(raw) = raw else {
                return Ok(None);
            };
            let block = decode(raw)?;
            if block.height() != height {
                return Err(IndexerError::Other(format!(
                    "requested block {height}, received {}",
                    block.height()
                )));
            }
            Ok(Some(block))
        })
        .collect()
}
