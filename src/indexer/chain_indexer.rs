use alloy::primitives::Address;
use serde_json::Value;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::abi::AbiKind;
use crate::error::Result;
use crate::registry::WatchAddress;
use crate::rpc::{compact_error, ChainRpc};
use crate::storage::{EventRecord, UpgradeStore};

/// Largest block span fetched per iteration. Providers commonly reject log
/// queries wider than this, and it bounds memory per pass.
pub const MAX_BLOCK_RANGE: u64 = 1_000;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(12);
const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub chain_id: String,
    pub watch_addresses: Vec<WatchAddress>,
    /// Watermark to resume from; the first scanned block is `from_block + 1`.
    pub from_block: u64,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
}

impl IndexerConfig {
    pub fn new(chain_id: impl Into<String>, watch_addresses: Vec<WatchAddress>, from_block: u64) -> Self {
        Self {
            chain_id: chain_id.into(),
            watch_addresses,
            from_block,
            poll_interval: DEFAULT_POLL_INTERVAL,
            error_backoff: DEFAULT_ERROR_BACKOFF,
        }
    }
}

/// What a single poll iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Head has not moved past the watermark.
    Idle,
    /// A block range was fully processed and the watermark advanced to `to`.
    Processed { from: u64, to: u64, stored: usize },
}

/// One chain's polling loop.
///
/// The loop is cooperative: `stop flag cleared -> exit at the next loop top`,
/// never mid-range. The watermark only advances after every watch address in
/// a range has been processed, so a crash mid-range re-scans that range on
/// restart; persistence is conflict-ignored, which makes the re-scan safe.
pub struct ChainIndexer<R: ChainRpc> {
    config: IndexerConfig,
    rpc: Arc<R>,
    store: UpgradeStore,
    watches: Vec<(WatchAddress, Address)>,
    watermark: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
}

impl<R: ChainRpc> ChainIndexer<R> {
    pub fn new(config: IndexerConfig, rpc: Arc<R>, store: UpgradeStore) -> Self {
        let watches = config
            .watch_addresses
            .iter()
            .filter_map(|watch| match Address::from_str(&watch.address) {
                Ok(address) => Some((watch.clone(), address)),
                Err(e) => {
                    warn!(
                        "[INDEX] {}: skipping watch address `{}` ({}): {e}",
                        config.chain_id, watch.address, watch.label
                    );
                    None
                }
            })
            .collect();
        let watermark = Arc::new(AtomicU64::new(config.from_block));
        Self {
            config,
            rpc,
            store,
            watches,
            watermark,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.config.chain_id
    }

    pub fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::SeqCst)
    }

    /// Shared watermark cell; survives the instance so a supervisor can
    /// resume a replacement from the last committed block.
    pub fn watermark_cell(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.watermark)
    }

    /// Shared stop flag; clearing it stops the loop at its next top.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Run the poll loop until stopped. Idempotent: a second `start` on an
    /// already-running instance logs and returns immediately.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("[INDEX] {}: already running", self.config.chain_id);
            return Ok(());
        }
        info!(
            "[INDEX] {}: starting from block {} ({} watch addresses)",
            self.config.chain_id,
            self.watermark(),
            self.watches.len()
        );

        while self.running.load(Ordering::SeqCst) {
            match self.poll_once().await {
                Ok(PollOutcome::Idle) => sleep(self.config.poll_interval).await,
                Ok(PollOutcome::Processed { from, to, stored }) => {
                    if stored > 0 {
                        info!(
                            "[INDEX] {}: blocks [{from}..={to}], {stored} new event(s)",
                            self.config.chain_id
                        );
                    } else {
                        debug!("[INDEX] {}: blocks [{from}..={to}], nothing new", self.config.chain_id);
                    }
                    // Catching up: go straight into the next range.
                }
                Err(e) => {
                    warn!(
                        "[INDEX] {}: poll failed at watermark {}: {}; backing off",
                        self.config.chain_id,
                        self.watermark(),
                        compact_error(e)
                    );
                    sleep(self.config.error_backoff).await;
                }
            }
        }

        info!("[INDEX] {}: stopped at watermark {}", self.config.chain_id, self.watermark());
        Ok(())
    }

    /// Signal the loop to exit after its current iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One poll iteration. The watermark advances only when the whole range
    /// succeeds; any error leaves it untouched so no block is ever skipped.
    pub async fn poll_once(&mut self) -> Result<PollOutcome> {
        let head = self.rpc.head_block().await?;
        let watermark = self.watermark.load(Ordering::SeqCst);
        if head <= watermark {
            return Ok(PollOutcome::Idle);
        }

        let from = watermark + 1;
        let to = watermark.saturating_add(MAX_BLOCK_RANGE).min(head);
        let mut stored = 0usize;

        for (watch, address) in &self.watches {
            let logs = self.rpc.logs(*address, from, to).await?;
            for log in logs {
                stored += persist_decoded(
                    &self.store,
                    self.rpc.as_ref(),
                    &self.config.chain_id,
                    watch.abi_kind,
                    *address,
                    &log,
                )
                .await? as usize;
            }
        }

        self.watermark.store(to, Ordering::SeqCst);
        Ok(PollOutcome::Processed { from, to, stored })
    }
}

/// Decode and persist one raw log. Returns whether a new row was stored.
/// Unmatched topics are routine; matched-but-malformed logs are logged at
/// debug and skipped rather than failing the range.
async fn persist_decoded<R: ChainRpc>(
    store: &UpgradeStore,
    rpc: &R,
    chain_id: &str,
    abi_kind: AbiKind,
    address: Address,
    log: &crate::rpc::RawLog,
) -> Result<bool> {
    let decoded = match abi_kind.event_set().decode(&log.topics, &log.data) {
        Ok(Some(decoded)) => decoded,
        Ok(None) => return Ok(false),
        Err(e) => {
            debug!("[INDEX] {chain_id}: undecodable {} log at {address}: {e}", abi_kind.as_str());
            return Ok(false);
        }
    };
    let (Some(block_number), Some(tx_hash)) = (log.block_number, log.tx_hash) else {
        debug!("[INDEX] {chain_id}: skipping pending log for {}", decoded.name);
        return Ok(false);
    };

    // Block time, not wall clock: downstream delay arithmetic needs it.
    let occurred_at = rpc.block_timestamp(block_number).await?;
    let record = EventRecord {
        chain_id: chain_id.to_string(),
        address: address.to_string(),
        tx_hash: tx_hash.to_string(),
        block_number,
        event_name: decoded.name.clone(),
        args: Value::Object(decoded.args),
        occurred_at: occurred_at as i64,
    };
    let inserted = store.insert_event(&record)?;
    if inserted {
        debug!("[INDEX] {chain_id}: saved {} (tx {tx_hash})", decoded.name);
    }
    Ok(inserted)
}
