use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::indexer::{ChainIndexer, IndexerConfig};
use crate::registry::{resolve_rpc_url, Registry, RegistryChain};
use crate::rpc::{bounded_exponential_backoff_ms, compact_error, ChainRpc, HttpRpc};
use crate::storage::UpgradeStore;

/// How far back the first watermark reaches when no checkpoint exists.
/// Favors cheap startup over completeness; older history needs an explicit
/// historical scan.
const BACKFILL_SECONDS: i64 = 86_400;

const MAX_INDEXER_RESTARTS: u32 = 5;
const RESTART_BACKOFF_BASE_MS: u64 = 5_000;
const RESTART_BACKOFF_CAP_MS: u64 = 120_000;

/// How often the supervisor checks for a pending stop request while the
/// poll loop is running.
const SUPERVISOR_TICK: Duration = Duration::from_millis(250);

struct ActiveIndexer {
    /// Set when the operator asked this chain to stop; the supervisor
    /// forwards it to the running incarnation and suppresses restarts.
    shutdown: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Owns the set of running chain indexers, one per chain id.
///
/// Each indexer task runs under a supervisor: a panicking poll loop is
/// restarted with bounded exponential backoff up to a retry cap, after which
/// the chain drops out of the active set and needs an explicit
/// `start_indexer` to resume. A cooperative stop never triggers a restart.
pub struct IndexerManager {
    store: UpgradeStore,
    registry: Registry,
    active: Arc<DashMap<String, ActiveIndexer>>,
}

impl IndexerManager {
    pub fn new(store: UpgradeStore, registry: Registry) -> Self {
        Self {
            store,
            registry,
            active: Arc::new(DashMap::new()),
        }
    }

    /// Start an indexer for every eligible registry chain, optionally
    /// restricted to `chain_ids`. Ineligible chains (no RPC URL, no watch
    /// addresses) are skipped with a log line, never fatal.
    pub async fn start_all(&self, chain_ids: Option<&[String]>) -> Result<usize> {
        let mut started = 0usize;
        for entry in self.registry.chains.clone() {
            if let Some(filter) = chain_ids {
                if !filter.iter().any(|id| id == &entry.chain.id) {
                    continue;
                }
            }
            let Some(rpc_url) = resolve_rpc_url(&entry) else {
                info!("[INDEX] skipping {}: no RPC URL configured", entry.chain.id);
                continue;
            };
            if self.start_indexer(&entry, &rpc_url).await? {
                started += 1;
            }
        }
        info!("[INDEX] {started} indexer(s) running");
        Ok(started)
    }

    /// Start a single chain's indexer. Returns `false` (with a log line)
    /// when the chain is already running or not eligible.
    pub async fn start_indexer(&self, entry: &RegistryChain, rpc_url: &str) -> Result<bool> {
        let chain_id = entry.chain.id.clone();
        if self.active.contains_key(&chain_id) {
            warn!("[INDEX] {chain_id}: indexer already running");
            return Ok(false);
        }

        let watch_addresses = self.store.watch_addresses(&chain_id)?;
        if watch_addresses.is_empty() {
            info!("[INDEX] skipping {chain_id}: no watch addresses");
            return Ok(false);
        }

        let rpc = match HttpRpc::connect(rpc_url) {
            Ok(rpc) => Arc::new(rpc),
            Err(e) => {
                warn!("[INDEX] skipping {chain_id}: bad RPC URL: {e}");
                return Ok(false);
            }
        };
        // No persisted checkpoint: estimate a watermark ~24h back from head.
        let from_block = match rpc.head_block().await {
            Ok(head) => {
                let blocks_back = (BACKFILL_SECONDS / entry.chain.block_seconds()).max(0) as u64;
                head.saturating_sub(blocks_back)
            }
            Err(e) => {
                warn!(
                    "[INDEX] skipping {chain_id}: cannot fetch head block: {}",
                    compact_error(e)
                );
                return Ok(false);
            }
        };

        let config = IndexerConfig::new(chain_id.clone(), watch_addresses, from_block);
        self.spawn_supervised(config, rpc);
        Ok(true)
    }

    /// Spawn the supervised poll loop for a prepared configuration.
    pub(crate) fn spawn_supervised<R: ChainRpc>(&self, config: IndexerConfig, rpc: Arc<R>) {
        let chain_id = config.chain_id.clone();
        let shutdown = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(supervise(
            config,
            rpc,
            self.store.clone(),
            Arc::clone(&shutdown),
            Arc::clone(&self.active),
        ));
        self.active.insert(chain_id, ActiveIndexer { shutdown, task });
    }

    /// Cooperatively stop one chain's indexer. Returns whether it was active.
    ///
    /// The entry leaves the active set only once the supervisor observes the
    /// request (one supervisor tick), so an immediate `start_indexer` for the
    /// same chain still reports it as running. Callers that need a
    /// back-to-back restart must `wait_for` the chain first.
    pub fn stop_indexer(&self, chain_id: &str) -> bool {
        match self.active.get(chain_id) {
            Some(entry) => {
                info!("[INDEX] {chain_id}: stop requested");
                entry.shutdown.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Stop every indexer and wait for their tasks to drain. Callers must
    /// invoke this before tearing down shared storage.
    pub async fn stop_all(&self) {
        let chain_ids: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        for chain_id in &chain_ids {
            if let Some(entry) = self.active.get(chain_id) {
                info!("[INDEX] stopping indexer for {chain_id}");
                entry.shutdown.store(true, Ordering::SeqCst);
            }
        }
        for chain_id in &chain_ids {
            if let Some((_, entry)) = self.active.remove(chain_id) {
                if let Err(e) = entry.task.await {
                    if !e.is_cancelled() {
                        error!("[INDEX] {chain_id}: indexer task failed during shutdown: {e}");
                    }
                }
            }
        }
    }

    pub fn active_chains(&self) -> Vec<String> {
        let mut chains: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        chains.sort();
        chains
    }

    /// Await the supervisor task of one chain, if any.
    pub async fn wait_for(&self, chain_id: &str) {
        if let Some((_, entry)) = self.active.remove(chain_id) {
            let _ = entry.task.await;
        }
    }
}

/// Restart-on-crash wrapper around one chain's poll loop.
///
/// Transient RPC/storage errors are already retried inside the loop with a
/// fixed backoff, so the supervisor only ever sees a panic (or an explicit
/// stop). Restarts are bounded; when they run out the chain is dropped from
/// the active set and left for the operator. Each replacement resumes from
/// the last committed watermark, so only the in-flight range is re-scanned.
async fn supervise<R: ChainRpc>(
    mut config: IndexerConfig,
    rpc: Arc<R>,
    store: UpgradeStore,
    shutdown: Arc<AtomicBool>,
    active: Arc<DashMap<String, ActiveIndexer>>,
) {
    let chain_id = config.chain_id.clone();
    let mut restarts = 0u32;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let mut indexer = ChainIndexer::new(config.clone(), Arc::clone(&rpc), store.clone());
        let stop_flag = indexer.stop_flag();
        let watermark = indexer.watermark_cell();
        let mut handle = tokio::spawn(async move { indexer.start().await });

        // Await the loop while forwarding stop requests to its flag.
        let outcome = loop {
            tokio::select! {
                res = &mut handle => break res,
                _ = sleep(SUPERVISOR_TICK) => {
                    if shutdown.load(Ordering::SeqCst) {
                        stop_flag.store(false, Ordering::SeqCst);
                    }
                }
            }
        };
        // Resume a replacement from where this incarnation got to.
        config.from_block = watermark.load(Ordering::SeqCst);
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match outcome {
            // The loop only returns cleanly without a shutdown request when
            // someone cleared its stop flag directly; honor that as a stop.
            Ok(Ok(())) => break,
            Ok(Err(e)) => {
                warn!("[INDEX] {chain_id}: indexer exited with error: {}", compact_error(e));
            }
            Err(join_err) => {
                error!("[INDEX] {chain_id}: indexer crashed: {join_err}");
            }
        }

        restarts += 1;
        if restarts > MAX_INDEXER_RESTARTS {
            error!(
                "[INDEX] {chain_id}: giving up after {MAX_INDEXER_RESTARTS} restarts; \
                 start it again explicitly to resume"
            );
            break;
        }
        let backoff_ms =
            bounded_exponential_backoff_ms(RESTART_BACKOFF_BASE_MS, restarts, RESTART_BACKOFF_CAP_MS);
        warn!("[INDEX] {chain_id}: restarting in {backoff_ms}ms (attempt {restarts})");
        sleep(Duration::from_millis(backoff_ms)).await;
    }
    active.remove(&chain_id);
    info!("[INDEX] {chain_id}: removed from active set");
}
