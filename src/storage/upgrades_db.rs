use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{Result, StorageError};
use crate::registry::{Chain, WatchAddress};

/// Event names the reconciler folds into upgrade plans. Everything else is
/// persisted for audit but ignored by reconciliation.
pub const UPGRADE_RELEVANT_EVENTS: &[&str] = &[
    "CallScheduled",
    "CallExecuted",
    "ExecutionSuccess",
    "ProposalExecuted",
];

/// Lifecycle of an upgrade plan. On-chain transitions only ever advance;
/// `Canceled` is the one corrective transition allowed from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeStatus {
    Proposed,
    Approved,
    ReleasePosted,
    Scheduled,
    Queued,
    Executed,
    Canceled,
}

impl UpgradeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UpgradeStatus::Proposed => "proposed",
            UpgradeStatus::Approved => "approved",
            UpgradeStatus::ReleasePosted => "release_posted",
            UpgradeStatus::Scheduled => "scheduled",
            UpgradeStatus::Queued => "queued",
            UpgradeStatus::Executed => "executed",
            UpgradeStatus::Canceled => "canceled",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "proposed" => Some(Self::Proposed),
            "approved" => Some(Self::Approved),
            "release_posted" => Some(Self::ReleasePosted),
            "scheduled" => Some(Self::Scheduled),
            "queued" => Some(Self::Queued),
            "executed" => Some(Self::Executed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    fn rank(self) -> u8 {
        match self {
            UpgradeStatus::Proposed => 0,
            UpgradeStatus::Approved => 1,
            UpgradeStatus::ReleasePosted => 2,
            UpgradeStatus::Scheduled => 3,
            UpgradeStatus::Queued => 4,
            UpgradeStatus::Executed => 5,
            UpgradeStatus::Canceled => 6,
        }
    }

    /// Whether moving to `next` is monotonic (or explicitly corrective).
    pub fn can_transition_to(self, next: UpgradeStatus) -> bool {
        next == UpgradeStatus::Canceled || next.rank() >= self.rank()
    }
}

/// A decoded log ready for idempotent persistence.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub chain_id: String,
    pub address: String,
    pub tx_hash: String,
    pub block_number: u64,
    pub event_name: String,
    pub args: Value,
    pub occurred_at: i64,
}

/// A persisted event joined with its chain and watch-address labels, as fed
/// to the reconciler.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub chain_id: String,
    pub address: String,
    pub tx_hash: String,
    pub block_number: u64,
    pub event_name: String,
    pub args: Value,
    pub occurred_at: i64,
    pub chain_name: Option<String>,
    pub contract_label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UpgradePlan {
    pub id: i64,
    pub chain_id: String,
    pub fork_name: String,
    pub status: UpgradeStatus,
    pub activation_epoch: Option<i64>,
    pub activation_ts: Option<i64>,
    pub confidence: f64,
    pub source_summary: String,
    pub details: Option<Value>,
    pub last_updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewUpgradePlan {
    pub chain_id: String,
    pub fork_name: String,
    pub status: UpgradeStatus,
    pub activation_epoch: Option<i64>,
    pub activation_ts: Option<i64>,
    pub confidence: f64,
    pub source_summary: String,
    pub details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Countdown {
    pub chain_id: String,
    pub fork_name: String,
    pub target_ts: i64,
    pub window_low_ts: Option<i64>,
    pub window_high_ts: Option<i64>,
    pub confidence: f64,
}

/// An upgrade plan selected for alerting, with its chain display name.
#[derive(Debug, Clone)]
pub struct AlertCandidate {
    pub plan: UpgradePlan,
    pub chain_name: String,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS chains (
    id              TEXT PRIMARY KEY,
    chain_id        INTEGER,
    name            TEXT NOT NULL,
    kind            TEXT NOT NULL,
    family          TEXT NOT NULL,
    genesis_unix    INTEGER,
    slot_seconds    INTEGER,
    slots_per_epoch INTEGER
);
CREATE TABLE IF NOT EXISTS watch_addresses (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    chain_id TEXT NOT NULL,
    label    TEXT NOT NULL,
    address  TEXT NOT NULL,
    abi_kind TEXT NOT NULL,
    UNIQUE (chain_id, address)
);
CREATE TABLE IF NOT EXISTS onchain_events (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    chain_id     TEXT NOT NULL,
    address      TEXT NOT NULL,
    tx_hash      TEXT NOT NULL,
    block_number INTEGER NOT NULL,
    event_name   TEXT NOT NULL,
    args         TEXT NOT NULL,
    occurred_at  INTEGER NOT NULL,
    UNIQUE (chain_id, tx_hash, event_name, address)
);
CREATE INDEX IF NOT EXISTS idx_onchain_events_occurred
    ON onchain_events (occurred_at);
CREATE TABLE IF NOT EXISTS upgrade_plans (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    chain_id         TEXT NOT NULL,
    fork_name        TEXT NOT NULL,
    status           TEXT NOT NULL,
    activation_epoch INTEGER,
    activation_ts    INTEGER,
    confidence       REAL NOT NULL,
    source_summary   TEXT NOT NULL DEFAULT '',
    details          TEXT,
    last_updated_at  INTEGER NOT NULL,
    UNIQUE (chain_id, fork_name)
);
CREATE TABLE IF NOT EXISTS countdowns (
    chain_id       TEXT PRIMARY KEY,
    fork_name      TEXT NOT NULL,
    target_ts      INTEGER NOT NULL,
    window_low_ts  INTEGER,
    window_high_ts INTEGER,
    confidence     REAL NOT NULL
);
";

/// Cloneable handle to the shared SQLite database.
#[derive(Clone)]
pub struct UpgradeStore {
    conn: Arc<Mutex<Connection>>,
}

impl UpgradeStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(StorageError::Sqlite)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(StorageError::Sqlite)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(StorageError::Sqlite)?;
        conn.execute_batch(SCHEMA).map_err(StorageError::Sqlite)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means another thread panicked mid-statement; the
        // connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---- registry imports ----

    pub fn upsert_chain(&self, chain: &Chain) -> Result<()> {
        self.lock()
            .execute(
                "INSERT INTO chains (id, chain_id, name, kind, family, genesis_unix, slot_seconds, slots_per_epoch)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    chain_id = excluded.chain_id,
                    name = excluded.name,
                    kind = excluded.kind,
                    family = excluded.family,
                    genesis_unix = excluded.genesis_unix,
                    slot_seconds = excluded.slot_seconds,
                    slots_per_epoch = excluded.slots_per_epoch",
                params![
                    chain.id,
                    chain.chain_id,
                    chain.name,
                    chain.kind.as_str(),
                    chain.family,
                    chain.genesis_unix,
                    chain.slot_seconds,
                    chain.slots_per_epoch,
                ],
            )
            .map_err(StorageError::Sqlite)?;
        Ok(())
    }

    pub fn chain_name(&self, chain_id: &str) -> Result<Option<String>> {
        let name = self
            .lock()
            .query_row(
                "SELECT name FROM chains WHERE id = ?1",
                params![chain_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StorageError::Sqlite)?;
        Ok(name)
    }

    pub fn upsert_watch_address(&self, watch: &WatchAddress) -> Result<()> {
        self.lock()
            .execute(
                "INSERT INTO watch_addresses (chain_id, label, address, abi_kind)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(chain_id, address) DO UPDATE SET
                    label = excluded.label,
                    abi_kind = excluded.abi_kind",
                params![
                    watch.chain_id,
                    watch.label,
                    watch.address,
                    watch.abi_kind.as_str(),
                ],
            )
            .map_err(StorageError::Sqlite)?;
        Ok(())
    }

    pub fn watch_addresses(&self, chain_id: &str) -> Result<Vec<WatchAddress>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT chain_id, label, address, abi_kind
                 FROM watch_addresses WHERE chain_id = ?1 ORDER BY id",
            )
            .map_err(StorageError::Sqlite)?;
        let rows = stmt
            .query_map(params![chain_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(StorageError::Sqlite)?;

        let mut out = Vec::new();
        for row in rows {
            let (chain_id, label, address, kind_raw) = row.map_err(StorageError::Sqlite)?;
            let abi_kind = crate::abi::AbiKind::from_db(&kind_raw).ok_or_else(|| {
                StorageError::InvalidRow(format!("unknown abi kind `{kind_raw}` for {address}"))
            })?;
            out.push(WatchAddress {
                chain_id,
                label,
                address,
                abi_kind,
            });
        }
        Ok(out)
    }

    // ---- on-chain events ----

    /// Insert a decoded event. Returns `true` when the row is new; replays of
    /// the same (chain, tx, event, address) are conflict-ignored no-ops.
    pub fn insert_event(&self, event: &EventRecord) -> Result<bool> {
        let changed = self
            .lock()
            .execute(
                "INSERT INTO onchain_events
                    (chain_id, address, tx_hash, block_number, event_name, args, occurred_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(chain_id, tx_hash, event_name, address) DO NOTHING",
                params![
                    event.chain_id,
                    event.address,
                    event.tx_hash,
                    event.block_number,
                    event.event_name,
                    event.args.to_string(),
                    event.occurred_at,
                ],
            )
            .map_err(StorageError::Sqlite)?;
        Ok(changed > 0)
    }

    pub fn event_count(&self) -> Result<u64> {
        let count: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM onchain_events", [], |row| row.get(0))
            .map_err(StorageError::Sqlite)?;
        Ok(count.max(0) as u64)
    }

    /// Administrative purge of raw events older than the cutoff. The only
    /// path that ever deletes event rows.
    pub fn purge_events_before(&self, cutoff_ts: i64) -> Result<u64> {
        let deleted = self
            .lock()
            .execute(
                "DELETE FROM onchain_events WHERE occurred_at < ?1",
                params![cutoff_ts],
            )
            .map_err(StorageError::Sqlite)?;
        Ok(deleted as u64)
    }

    /// Upgrade-relevant events newer than `since_ts`, newest first, joined
    /// with chain and watch-address labels.
    pub fn recent_upgrade_events(&self, since_ts: i64) -> Result<Vec<StoredEvent>> {
        let placeholders = UPGRADE_RELEVANT_EVENTS
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT oe.chain_id, oe.address, oe.tx_hash, oe.block_number, oe.event_name,
                    oe.args, oe.occurred_at, c.name, wa.label
             FROM onchain_events oe
             LEFT JOIN chains c ON c.id = oe.chain_id
             LEFT JOIN watch_addresses wa
                ON wa.address = oe.address AND wa.chain_id = oe.chain_id
             WHERE oe.occurred_at > ?1 AND oe.event_name IN ({placeholders})
             ORDER BY oe.occurred_at DESC"
        );

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql).map_err(StorageError::Sqlite)?;
        let mut values: Vec<&dyn rusqlite::ToSql> = vec![&since_ts];
        for name in UPGRADE_RELEVANT_EVENTS {
            values.push(name);
        }
        let rows = stmt
            .query_map(values.as_slice(), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, Option<String>>(8)?,
                ))
            })
            .map_err(StorageError::Sqlite)?;

        let mut out = Vec::new();
        for row in rows {
            let (chain_id, address, tx_hash, block_number, event_name, args_raw, occurred_at, chain_name, contract_label) =
                row.map_err(StorageError::Sqlite)?;
            let args = serde_json::from_str(&args_raw).map_err(|e| {
                StorageError::InvalidRow(format!("bad args JSON for {tx_hash}/{event_name}: {e}"))
            })?;
            out.push(StoredEvent {
                chain_id,
                address,
                tx_hash,
                block_number: block_number.max(0) as u64,
                event_name,
                args,
                occurred_at,
                chain_name,
                contract_label,
            });
        }
        Ok(out)
    }

    // ---- upgrade plans ----

    /// Find a plan by (chain, fork) or, as a fallback for fork-name inference
    /// misses, by a source summary mentioning the transaction hash.
    pub fn find_plan(
        &self,
        chain_id: &str,
        fork_name: &str,
        tx_hash: &str,
    ) -> Result<Option<UpgradePlan>> {
        let pattern = format!("%{tx_hash}%");
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, chain_id, fork_name, status, activation_epoch, activation_ts,
                        confidence, source_summary, details, last_updated_at
                 FROM upgrade_plans
                 WHERE chain_id = ?1 AND (fork_name = ?2 OR source_summary LIKE ?3)
                 LIMIT 1",
            )
            .map_err(StorageError::Sqlite)?;
        let plan = stmt
            .query_row(params![chain_id, fork_name, pattern], plan_from_row)
            .optional()
            .map_err(StorageError::Sqlite)?;
        plan.transpose()
    }

    pub fn plan_by_fork(&self, chain_id: &str, fork_name: &str) -> Result<Option<UpgradePlan>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, chain_id, fork_name, status, activation_epoch, activation_ts,
                        confidence, source_summary, details, last_updated_at
                 FROM upgrade_plans WHERE chain_id = ?1 AND fork_name = ?2 LIMIT 1",
            )
            .map_err(StorageError::Sqlite)?;
        let plan = stmt
            .query_row(params![chain_id, fork_name], plan_from_row)
            .optional()
            .map_err(StorageError::Sqlite)?;
        plan.transpose()
    }

    pub fn insert_plan(&self, plan: &NewUpgradePlan, now: i64) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO upgrade_plans
                (chain_id, fork_name, status, activation_epoch, activation_ts,
                 confidence, source_summary, details, last_updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                plan.chain_id,
                plan.fork_name,
                plan.status.as_str(),
                plan.activation_epoch,
                plan.activation_ts,
                plan.confidence.clamp(0.0, 1.0),
                plan.source_summary,
                plan.details.as_ref().map(Value::to_string),
                now,
            ],
        )
        .map_err(StorageError::Sqlite)?;
        Ok(conn.last_insert_rowid())
    }

    /// On-chain update path: advances status/activation without touching the
    /// off-chain `details` payload.
    pub fn update_plan_onchain(
        &self,
        id: i64,
        status: UpgradeStatus,
        activation_ts: Option<i64>,
        now: i64,
    ) -> Result<()> {
        self.lock()
            .execute(
                "UPDATE upgrade_plans
                 SET status = ?1, activation_ts = ?2, last_updated_at = ?3
                 WHERE id = ?4",
                params![status.as_str(), activation_ts, now, id],
            )
            .map_err(StorageError::Sqlite)?;
        Ok(())
    }

    /// Off-chain update path: richer payload wins, confidence is clamped.
    pub fn update_plan_offchain(
        &self,
        id: i64,
        status: UpgradeStatus,
        confidence: f64,
        source_summary: &str,
        details: Option<&Value>,
        activation_epoch: Option<i64>,
        activation_ts: Option<i64>,
        now: i64,
    ) -> Result<()> {
        self.lock()
            .execute(
                "UPDATE upgrade_plans
                 SET status = ?1, confidence = ?2, source_summary = ?3, details = ?4,
                     activation_epoch = ?5, activation_ts = ?6, last_updated_at = ?7
                 WHERE id = ?8",
                params![
                    status.as_str(),
                    confidence.clamp(0.0, 1.0),
                    source_summary,
                    details.map(Value::to_string),
                    activation_epoch,
                    activation_ts,
                    now,
                    id,
                ],
            )
            .map_err(StorageError::Sqlite)?;
        Ok(())
    }

    /// Plans worth alerting on: scheduled/queued or release_posted rows
    /// touched within the last 24 hours. The future-activation filter is
    /// applied by the dispatcher, which also needs the raw rows for logging.
    pub fn alert_candidates(&self, now: i64) -> Result<Vec<AlertCandidate>> {
        let cutoff = now - 86_400;
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT up.id, up.chain_id, up.fork_name, up.status, up.activation_epoch,
                        up.activation_ts, up.confidence, up.source_summary, up.details,
                        up.last_updated_at, COALESCE(c.name, up.chain_id)
                 FROM upgrade_plans up
                 LEFT JOIN chains c ON c.id = up.chain_id
                 WHERE (up.status IN ('scheduled', 'queued') AND up.last_updated_at > ?1)
                    OR (up.status = 'release_posted' AND up.last_updated_at > ?1)
                 ORDER BY up.last_updated_at DESC",
            )
            .map_err(StorageError::Sqlite)?;
        let rows = stmt
            .query_map(params![cutoff], |row| {
                let plan = plan_from_row(row)?;
                let chain_name: String = row.get(10)?;
                Ok((plan, chain_name))
            })
            .map_err(StorageError::Sqlite)?;

        let mut out = Vec::new();
        for row in rows {
            let (plan, chain_name) = row.map_err(StorageError::Sqlite)?;
            out.push(AlertCandidate {
                plan: plan?,
                chain_name,
            });
        }
        Ok(out)
    }

    // ---- countdowns ----

    /// Upsert the single countdown row for a chain. Later writes supersede
    /// earlier ones regardless of fork (known design limitation).
    pub fn upsert_countdown(&self, countdown: &Countdown) -> Result<()> {
        if let (Some(low), Some(high)) = (countdown.window_low_ts, countdown.window_high_ts) {
            if !(low <= countdown.target_ts && countdown.target_ts <= high) {
                return Err(StorageError::CountdownBounds(format!(
                    "{} {}: low={low} target={} high={high}",
                    countdown.chain_id, countdown.fork_name, countdown.target_ts
                ))
                .into());
            }
        }
        self.lock()
            .execute(
                "INSERT INTO countdowns
                    (chain_id, fork_name, target_ts, window_low_ts, window_high_ts, confidence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(chain_id) DO UPDATE SET
                    fork_name = excluded.fork_name,
                    target_ts = excluded.target_ts,
                    window_low_ts = excluded.window_low_ts,
                    window_high_ts = excluded.window_high_ts,
                    confidence = excluded.confidence",
                params![
                    countdown.chain_id,
                    countdown.fork_name,
                    countdown.target_ts,
                    countdown.window_low_ts,
                    countdown.window_high_ts,
                    countdown.confidence.clamp(0.0, 1.0),
                ],
            )
            .map_err(StorageError::Sqlite)?;
        Ok(())
    }

    pub fn countdown(&self, chain_id: &str) -> Result<Option<Countdown>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT chain_id, fork_name, target_ts, window_low_ts, window_high_ts, confidence
                 FROM countdowns WHERE chain_id = ?1",
            )
            .map_err(StorageError::Sqlite)?;
        let countdown = stmt
            .query_row(params![chain_id], |row| {
                Ok(Countdown {
                    chain_id: row.get(0)?,
                    fork_name: row.get(1)?,
                    target_ts: row.get(2)?,
                    window_low_ts: row.get(3)?,
                    window_high_ts: row.get(4)?,
                    confidence: row.get(5)?,
                })
            })
            .optional()
            .map_err(StorageError::Sqlite)?;
        Ok(countdown)
    }
}

type PlanRowResult = std::result::Result<Result<UpgradePlan>, rusqlite::Error>;

fn plan_from_row(row: &rusqlite::Row<'_>) -> PlanRowResult {
    let status_raw: String = row.get(3)?;
    let details_raw: Option<String> = row.get(8)?;
    let id: i64 = row.get(0)?;
    let chain_id: String = row.get(1)?;
    let fork_name: String = row.get(2)?;
    let activation_epoch: Option<i64> = row.get(4)?;
    let activation_ts: Option<i64> = row.get(5)?;
    let confidence: f64 = row.get(6)?;
    let source_summary: String = row.get(7)?;
    let last_updated_at: i64 = row.get(9)?;

    Ok((|| {
        let status = UpgradeStatus::from_db(&status_raw).ok_or_else(|| {
            StorageError::InvalidRow(format!("unknown status `{status_raw}` for plan {id}"))
        })?;
        let details = match details_raw {
            Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
                StorageError::InvalidRow(format!("bad details JSON for plan {id}: {e}"))
            })?),
            None => None,
        };
        Ok(UpgradePlan {
            id,
            chain_id,
            fork_name,
            status,
            activation_epoch,
            activation_ts,
            confidence,
            source_summary,
            details,
            last_updated_at,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::AbiKind;
    use serde_json::json;

    fn sample_event(tx: &str) -> EventRecord {
        EventRecord {
            chain_id: "op-mainnet".into(),
            address: "0x0000000000000000000000000000000000000001".into(),
            tx_hash: tx.into(),
            block_number: 1_000,
            event_name: "CallScheduled".into(),
            args: json!({ "delay": "3600" }),
            occurred_at: 1_700_000_000,
        }
    }

    #[test]
    fn test_duplicate_event_insert_is_a_noop() {
        let store = UpgradeStore::open_in_memory().unwrap();
        let event = sample_event("0xabc");
        assert!(store.insert_event(&event).unwrap());
        assert!(!store.insert_event(&event).unwrap());
        assert_eq!(store.event_count().unwrap(), 1);
    }

    #[test]
    fn test_same_tx_different_event_names_are_distinct_rows() {
        let store = UpgradeStore::open_in_memory().unwrap();
        let scheduled = sample_event("0xabc");
        let mut executed = sample_event("0xabc");
        executed.event_name = "CallExecuted".into();
        assert!(store.insert_event(&scheduled).unwrap());
        assert!(store.insert_event(&executed).unwrap());
        assert_eq!(store.event_count().unwrap(), 2);
    }

    #[test]
    fn test_recent_events_filters_allowlist_and_window() {
        let store = UpgradeStore::open_in_memory().unwrap();
        let mut relevant = sample_event("0x1");
        relevant.occurred_at = 1_000_000;
        let mut irrelevant = sample_event("0x2");
        irrelevant.event_name = "ApproveHash".into();
        irrelevant.occurred_at = 1_000_000;
        let mut stale = sample_event("0x3");
        stale.occurred_at = 10;
        for e in [&relevant, &irrelevant, &stale] {
            store.insert_event(e).unwrap();
        }

        let events = store.recent_upgrade_events(500_000).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tx_hash, "0x1");
    }

    #[test]
    fn test_find_plan_matches_by_fork_or_tx_hash_in_summary() {
        let store = UpgradeStore::open_in_memory().unwrap();
        store
            .insert_plan(
                &NewUpgradePlan {
                    chain_id: "op-mainnet".into(),
                    fork_name: "Pectra".into(),
                    status: UpgradeStatus::Queued,
                    activation_epoch: None,
                    activation_ts: None,
                    confidence: 0.99,
                    source_summary: "Timelock CallScheduled - tx: 0xfeedbeef...".into(),
                    details: None,
                },
                1_700_000_000,
            )
            .unwrap();

        let by_fork = store.find_plan("op-mainnet", "Pectra", "0xnope").unwrap();
        assert!(by_fork.is_some());
        let by_tx = store
            .find_plan("op-mainnet", "Protocol Upgrade", "0xfeedbeef")
            .unwrap();
        assert!(by_tx.is_some());
        assert_eq!(by_fork.unwrap().id, by_tx.unwrap().id);
        assert!(store
            .find_plan("op-mainnet", "Protocol Upgrade", "0xother")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_confidence_is_clamped_on_write() {
        let store = UpgradeStore::open_in_memory().unwrap();
        let id = store
            .insert_plan(
                &NewUpgradePlan {
                    chain_id: "eth-mainnet".into(),
                    fork_name: "Fusaka".into(),
                    status: UpgradeStatus::Scheduled,
                    activation_epoch: None,
                    activation_ts: None,
                    confidence: 7.5,
                    source_summary: String::new(),
                    details: None,
                },
                1,
            )
            .unwrap();
        assert!(id > 0);
        let plan = store.plan_by_fork("eth-mainnet", "Fusaka").unwrap().unwrap();
        assert!((plan.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_countdown_upsert_overwrites_per_chain() {
        let store = UpgradeStore::open_in_memory().unwrap();
        let first = Countdown {
            chain_id: "op-mainnet".into(),
            fork_name: "Isthmus".into(),
            target_ts: 100,
            window_low_ts: None,
            window_high_ts: None,
            confidence: 0.9,
        };
        store.upsert_countdown(&first).unwrap();
        let second = Countdown {
            fork_name: "Jovian".into(),
            target_ts: 200,
            ..first.clone()
        };
        store.upsert_countdown(&second).unwrap();

        let stored = store.countdown("op-mainnet").unwrap().unwrap();
        assert_eq!(stored.fork_name, "Jovian");
        assert_eq!(stored.target_ts, 200);
    }

    #[test]
    fn test_countdown_rejects_inverted_window() {
        let store = UpgradeStore::open_in_memory().unwrap();
        let bad = Countdown {
            chain_id: "op-mainnet".into(),
            fork_name: "Isthmus".into(),
            target_ts: 100,
            window_low_ts: Some(150),
            window_high_ts: Some(50),
            confidence: 0.9,
        };
        assert!(store.upsert_countdown(&bad).is_err());
        assert!(store.countdown("op-mainnet").unwrap().is_none());
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        assert!(UpgradeStatus::Queued.can_transition_to(UpgradeStatus::Executed));
        assert!(UpgradeStatus::Queued.can_transition_to(UpgradeStatus::Queued));
        assert!(!UpgradeStatus::Executed.can_transition_to(UpgradeStatus::Queued));
        // Cancellation is corrective from anywhere.
        assert!(UpgradeStatus::Executed.can_transition_to(UpgradeStatus::Canceled));
    }

    #[test]
    fn test_watch_address_upsert_updates_in_place() {
        let store = UpgradeStore::open_in_memory().unwrap();
        let mut watch = WatchAddress {
            chain_id: "op-mainnet".into(),
            label: "L1 Timelock".into(),
            address: "0x0000000000000000000000000000000000000009".into(),
            abi_kind: AbiKind::Timelock,
        };
        store.upsert_watch_address(&watch).unwrap();
        watch.label = "Upgrade Timelock".into();
        store.upsert_watch_address(&watch).unwrap();

        let loaded = store.watch_addresses("op-mainnet").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].label, "Upgrade Timelock");
    }

    #[test]
    fn test_alert_candidates_selects_recent_actionable_rows() {
        let store = UpgradeStore::open_in_memory().unwrap();
        let now = 1_700_000_000;
        store
            .insert_plan(
                &NewUpgradePlan {
                    chain_id: "op-mainnet".into(),
                    fork_name: "Fresh".into(),
                    status: UpgradeStatus::Queued,
                    activation_epoch: None,
                    activation_ts: Some(now + 3_600),
                    confidence: 0.99,
                    source_summary: String::new(),
                    details: None,
                },
                now - 100,
            )
            .unwrap();
        store
            .insert_plan(
                &NewUpgradePlan {
                    chain_id: "op-mainnet".into(),
                    fork_name: "Stale".into(),
                    status: UpgradeStatus::Queued,
                    activation_epoch: None,
                    activation_ts: None,
                    confidence: 0.99,
                    source_summary: String::new(),
                    details: None,
                },
                now - 200_000,
            )
            .unwrap();
        store
            .insert_plan(
                &NewUpgradePlan {
                    chain_id: "eth-mainnet".into(),
                    fork_name: "Done".into(),
                    status: UpgradeStatus::Executed,
                    activation_epoch: None,
                    activation_ts: None,
                    confidence: 0.99,
                    source_summary: String::new(),
                    details: None,
                },
                now - 100,
            )
            .unwrap();

        let candidates = store.alert_candidates(now).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].plan.fork_name, "Fresh");
        // No chains imported, so the display name falls back to the id.
        assert_eq!(candidates[0].chain_name, "op-mainnet");
    }
}
