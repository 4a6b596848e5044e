//! Shared persistence layer.
//!
//! One SQLite database holds registry imports (chains, watch addresses),
//! raw decoded events, upgrade plans and countdowns. The handle is cheap to
//! clone and internally locked; concurrent writers rely on the conflict
//! policies baked into the schema rather than application-level locking.

mod upgrades_db;

pub use upgrades_db::{
    AlertCandidate, Countdown, EventRecord, NewUpgradePlan, StoredEvent, UpgradePlan,
    UpgradeStatus, UpgradeStore, UPGRADE_RELEVANT_EVENTS,
};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in seconds. Clamped to zero rather than panicking if
/// the system clock reads before the epoch.
pub fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
