//! Block interleaving - one deterministic event stream from two chains
//!
//! Each tick fetches the safe slice of both chains, merges it by block
//! timestamp with the base chain first on ties, trims it so neither chain
//! runs ahead of the other's known horizon, and feeds the result through
//! the pipeline. A detected fork pauses the stream; once every chain
//! advances again the registry is dropped and the book rolls back to the
//! last in-memory snapshot.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::NodeResult;
use crate::ledger::{BlockHeader, ChainId, LedgerClient};
use crate::metrics;
use crate::pipeline::{BlockContext, Pipeline};
use crate::state::SharedState;

/// Per-chain progress tracking for fork detection
struct WatchState {
    last_seen: HashMap<ChainId, u64>,
    progressing: HashMap<ChainId, bool>,
}

/// Watches per-chain new-block notifications
///
/// A chain is progressing iff each notified height strictly exceeds the
/// last seen one; any chain that stops progressing raises the fork flag,
/// and the flag clears once every chain progresses again.
pub struct ForkWatcher {
    state: StdMutex<WatchState>,
    forked: AtomicBool,
}

impl ForkWatcher {
    pub fn new(chains: impl IntoIterator<Item = ChainId>) -> Self {
        let progressing = chains.into_iter().map(|c| (c, true)).collect();
        Self {
            state: StdMutex::new(WatchState {
                last_seen: HashMap::new(),
                progressing,
            }),
            forked: AtomicBool::new(false),
        }
    }

    pub fn observe(&self, chain: &ChainId, height: u64) {
        let mut state = self.state.lock().expect("fork watcher lock");
        let progressing = match state.last_seen.get(chain) {
            Some(&last) => height > last,
            None => true,
        };
        state.last_seen.insert(chain.clone(), height);
        state.progressing.insert(chain.clone(), progressing);

        if !progressing {
            if !self.forked.swap(true, Ordering::SeqCst) {
                warn!("Chain {} rolled back at height {}; fork flagged", chain, height);
            }
        } else if state.progressing.values().all(|p| *p)
            && self.forked.swap(false, Ordering::SeqCst)
        {
            info!("All chains progressing again; fork flag cleared");
        }
    }

    pub fn is_forked(&self) -> bool {
        self.forked.load(Ordering::SeqCst)
    }
}

/// Feed a chain's new-block notifications into the fork watcher
pub async fn watch_chain(watcher: Arc<ForkWatcher>, ledger: Arc<dyn LedgerClient>) {
    let chain = ledger.chain_id().clone();
    let mut rx = ledger.subscribe_new_blocks();
    loop {
        match rx.recv().await {
            Ok(header) => watcher.observe(&chain, header.height),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                debug!("Fork watcher for {} lagged {} notifications", chain, missed);
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InterleaverChainParams {
    pub required_confirmations: u64,
    pub read_max_blocks: usize,
}

pub struct BlockInterleaver {
    core: SharedState,
    pipeline: Pipeline,
    ledgers: HashMap<ChainId, Arc<dyn LedgerClient>>,
    fork: Arc<ForkWatcher>,
    base: ChainId,
    params: HashMap<ChainId, InterleaverChainParams>,
    read_blocks_interval: Duration,
    last_processed_height: HashMap<ChainId, u64>,
    last_processed_timestamp: u64,
    needs_recovery: bool,
    shutdown: Arc<RwLock<bool>>,
}

impl BlockInterleaver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        core: SharedState,
        pipeline: Pipeline,
        ledgers: HashMap<ChainId, Arc<dyn LedgerClient>>,
        fork: Arc<ForkWatcher>,
        base: ChainId,
        params: HashMap<ChainId, InterleaverChainParams>,
        read_blocks_interval: Duration,
        initial_heights: HashMap<ChainId, u64>,
        initial_timestamp: u64,
    ) -> Self {
        Self {
            core,
            pipeline,
            ledgers,
            fork,
            base,
            params,
            read_blocks_interval,
            last_processed_height: initial_heights,
            last_processed_timestamp: initial_timestamp,
            needs_recovery: false,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Handle main can use to stop the run loop
    pub fn shutdown_handle(&self) -> Arc<RwLock<bool>> {
        self.shutdown.clone()
    }

    /// Main driver loop
    pub async fn run(&mut self) -> NodeResult<()> {
        info!("Block interleaver started");
        loop {
            if *self.shutdown.read().await {
                break;
            }

            if self.fork.is_forked() {
                self.needs_recovery = true;
                sleep(self.read_blocks_interval).await;
                continue;
            }

            if self.needs_recovery {
                match self.recover().await {
                    Ok(()) => self.needs_recovery = false,
                    Err(e) => {
                        warn!("Fork recovery failed, retrying: {}", e);
                        sleep(self.read_blocks_interval).await;
                    }
                }
                continue;
            }

            match self.tick().await {
                Ok(0) => sleep(self.read_blocks_interval).await,
                Ok(_) => {}
                Err(e) if e.is_retryable() => {
                    debug!("Interleaver tick will retry: {}", e);
                    sleep(self.read_blocks_interval).await;
                }
                Err(e) => {
                    warn!("Interleaver tick failed: {}", e);
                    sleep(self.read_blocks_interval).await;
                }
            }
        }
        info!("Block interleaver stopped");
        Ok(())
    }

    /// Fetch, merge, trim, and process one batch; returns blocks processed
    async fn tick(&mut self) -> NodeResult<usize> {
        let mut latest: BTreeMap<ChainId, u64> = BTreeMap::new();
        let mut horizons: HashMap<ChainId, u64> = HashMap::new();
        let mut slices: Vec<(ChainId, Vec<BlockHeader>)> = Vec::new();

        for (chain, params) in &self.params {
            let ledger = &self.ledgers[chain];
            let max = ledger.max_height().await?;
            let safe = max.saturating_sub(params.required_confirmations);
            latest.insert(chain.clone(), safe);

            let from = self.last_processed_height.get(chain).copied().unwrap_or(0);
            let slice = ledger
                .blocks_in_range(from, safe, params.read_max_blocks)
                .await?;

            // The horizon this chain imposes on the other is its last
            // FETCHED block: a read_max_blocks-truncated fetch still has
            // unprocessed backlog past the slice, and the other chain must
            // not advance beyond it. Only an empty slice (nothing new)
            // falls back to the safe tip.
            let horizon = match slice.last() {
                Some(header) => header.timestamp,
                None => match ledger.block_at_height(safe).await? {
                    Some(header) => header.timestamp,
                    None => 0,
                },
            };
            horizons.insert(chain.clone(), horizon);
            slices.push((chain.clone(), slice));
        }

        let merged = merge_slices(slices, &horizons, &self.base);

        let mut processed = 0;
        for (chain, header, is_last_block) in merged {
            if self.fork.is_forked() {
                break;
            }
            let ctx = BlockContext {
                chain: chain.clone(),
                height: header.height,
                timestamp: header.timestamp,
                latest_chain_heights: latest.clone(),
                is_last_block,
            };
            match self.pipeline.process_block(&ctx).await {
                Ok(()) => {
                    self.last_processed_height.insert(chain, header.height);
                    self.last_processed_timestamp = header.timestamp;
                    processed += 1;
                }
                Err(e) => {
                    warn!(
                        "Block {} on {} failed, will retry next tick: {}",
                        header.height, chain, e
                    );
                    break;
                }
            }
        }
        Ok(processed)
    }

    /// Post-fork rollback: drop pending transfers, restore the book from
    /// the last in-memory snapshot, and rewind the stream cursors
    async fn recover(&mut self) -> NodeResult<()> {
        let snapshot = {
            let mut core = self.core.lock().await;
            core.registry.clear();
            let snapshot = core.last_snapshot.clone();
            match &snapshot {
                Some(s) => core.book.set_snapshot(s.order_book.clone()),
                None => core.book.clear(),
            }
            snapshot
        };

        if let Some(snapshot) = snapshot {
            for (chain, height) in &snapshot.chain_heights {
                self.last_processed_height.insert(chain.clone(), *height);
            }
            let base_height = snapshot.base_height(&self.base);
            if let Some(header) = self.ledgers[&self.base].block_at_height(base_height).await? {
                self.last_processed_timestamp = header.timestamp;
            }
        }

        metrics::record_fork_recovery();
        info!(
            "Fork recovery complete; resuming from timestamp {}",
            self.last_processed_timestamp
        );
        Ok(())
    }
}

/// Merge per-chain slices into one timestamp-ordered stream
///
/// Blocks past the other chain's horizon are trimmed so events from one
/// chain never get ahead of the other's known tip; ties order the base
/// chain first. The final kept block of each chain is flagged as that
/// chain's batch end.
fn merge_slices(
    slices: Vec<(ChainId, Vec<BlockHeader>)>,
    horizons: &HashMap<ChainId, u64>,
    base: &ChainId,
) -> Vec<(ChainId, BlockHeader, bool)> {
    let mut merged: Vec<(ChainId, BlockHeader)> = Vec::new();
    for (chain, slice) in slices {
        let other_horizon = horizons
            .iter()
            .filter(|(c, _)| **c != chain)
            .map(|(_, ts)| *ts)
            .min()
            .unwrap_or(0);
        for header in slice {
            if header.timestamp <= other_horizon {
                merged.push((chain.clone(), header));
            }
        }
    }
    merged.sort_by(|a, b| {
        a.1.timestamp
            .cmp(&b.1.timestamp)
            .then_with(|| (a.0 != *base).cmp(&(b.0 != *base)))
    });

    let mut last_index: HashMap<ChainId, usize> = HashMap::new();
    for (index, (chain, _)) in merged.iter().enumerate() {
        last_index.insert(chain.clone(), index);
    }
    merged
        .into_iter()
        .enumerate()
        .map(|(index, (chain, header))| {
            let is_last = last_index[&chain] == index;
            (chain, header, is_last)
        })
        .collect()
}
