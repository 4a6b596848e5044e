//! Folds persisted timelock/safe/governor events into upgrade plans.
//!
//! Reconciliation is a pure function of the event table: it re-reads the
//! recent window every pass, so replays and restarts converge on the same
//! plan rows. Status moves only ever advance (cancellation aside), which
//! keeps a late-arriving `CallScheduled` from demoting an executed plan.

use serde_json::Value;
use tracing::{debug, info};

use crate::error::Result;
use crate::storage::{Countdown, NewUpgradePlan, StoredEvent, UpgradeStatus, UpgradeStore};

/// How far back reconciliation looks at persisted events.
pub const RECONCILE_WINDOW_SECONDS: i64 = 7 * 86_400;

/// Confidence assigned to plans derived from on-chain evidence.
pub const ONCHAIN_CONFIDENCE: f64 = 0.99;

pub const DEFAULT_FORK_NAME: &str = "Protocol Upgrade";

/// Infers a fork name from free text around an event. Injectable so a
/// curated name table can replace the heuristic.
pub trait ForkNamer: Send + Sync {
    fn infer(&self, text: &str) -> Option<String>;
}

/// Heuristic namer: picks the first capitalized word carrying a known fork
/// suffix (Fusaka, Pectra, Cancun, London, Dublin, ...).
#[derive(Default)]
pub struct SuffixForkNamer;

const FORK_SUFFIXES: &[&str] = &["ka", "tra", "cun", "don", "lin"];

impl ForkNamer for SuffixForkNamer {
    fn infer(&self, text: &str) -> Option<String> {
        text.split(|c: char| !c.is_ascii_alphabetic())
            .find(|word| {
                word.len() >= 4
                    && word.chars().next().is_some_and(|c| c.is_ascii_uppercase())
                    && word.chars().skip(1).all(|c| c.is_ascii_lowercase())
                    && FORK_SUFFIXES.iter().any(|s| word.ends_with(s))
            })
            .map(str::to_string)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
}

fn status_for_event(event_name: &str) -> Option<UpgradeStatus> {
    match event_name {
        "CallScheduled" => Some(UpgradeStatus::Queued),
        "CallExecuted" | "ExecutionSuccess" | "ProposalExecuted" => Some(UpgradeStatus::Executed),
        _ => None,
    }
}

/// The timelock delay argument, as persisted: a decimal string for wide
/// integers, a plain number for narrow ones.
fn delay_seconds(args: &Value) -> Option<i64> {
    let delay = args.get("delay")?;
    let parsed = match delay {
        Value::String(s) => s.parse::<i64>().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    };
    parsed.filter(|d| *d >= 0)
}

fn short_tx(tx_hash: &str) -> String {
    let prefix: String = tx_hash.chars().take(10).collect();
    format!("{prefix}...")
}

fn event_summary(event: &StoredEvent) -> String {
    let label = event.contract_label.as_deref().unwrap_or("contract");
    format!("{label} {} - tx: {}", event.event_name, short_tx(&event.tx_hash))
}

/// Reconcile the recent event window into upgrade plans, updating the
/// per-chain countdown whenever an activation time becomes known.
pub fn reconcile(store: &UpgradeStore, namer: &dyn ForkNamer, now: i64) -> Result<ReconcileStats> {
    let events = store.recent_upgrade_events(now - RECONCILE_WINDOW_SECONDS)?;
    info!("[MONITOR] reconciling {} recent event(s)", events.len());

    let mut stats = ReconcileStats::default();
    for event in &events {
        let Some(status) = status_for_event(&event.event_name) else {
            stats.skipped += 1;
            continue;
        };

        let name_text = format!(
            "{} {} {}",
            event.contract_label.as_deref().unwrap_or_default(),
            event.event_name,
            event.args
        );
        let fork_name = namer
            .infer(&name_text)
            .unwrap_or_else(|| DEFAULT_FORK_NAME.to_string());

        // CallScheduled carries the timelock delay; execution events have no
        // forward-looking activation of their own.
        let event_activation_ts = match event.event_name.as_str() {
            "CallScheduled" => delay_seconds(&event.args).map(|d| event.occurred_at + d),
            _ => None,
        };

        let summary = event_summary(event);
        // Summaries carry a truncated hash, so the fallback match does too.
        let tx_prefix: String = event.tx_hash.chars().take(10).collect();
        let plan = match store.find_plan(&event.chain_id, &fork_name, &tx_prefix)? {
            Some(existing) => {
                if !existing.status.can_transition_to(status) {
                    debug!(
                        "[MONITOR] {}/{}: ignoring {} regression ({} -> {})",
                        event.chain_id,
                        existing.fork_name,
                        event.event_name,
                        existing.status.as_str(),
                        status.as_str()
                    );
                    stats.skipped += 1;
                    continue;
                }
                let activation_ts = event_activation_ts.or(existing.activation_ts);
                if existing.status != status || existing.activation_ts != activation_ts {
                    store.update_plan_onchain(existing.id, status, activation_ts, now)?;
                    info!(
                        "[MONITOR] {}/{}: {} -> {}",
                        event.chain_id,
                        existing.fork_name,
                        existing.status.as_str(),
                        status.as_str()
                    );
                    stats.updated += 1;
                } else {
                    stats.skipped += 1;
                }
                store.plan_by_fork(&event.chain_id, &existing.fork_name)?
            }
            None => {
                store.insert_plan(
                    &NewUpgradePlan {
                        chain_id: event.chain_id.clone(),
                        fork_name: fork_name.clone(),
                        status,
                        activation_epoch: None,
                        activation_ts: event_activation_ts,
                        confidence: ONCHAIN_CONFIDENCE,
                        source_summary: summary.clone(),
                        details: None,
                    },
                    now,
                )?;
                info!(
                    "[MONITOR] {}: new plan {} ({}) from {}",
                    event.chain_id,
                    fork_name,
                    status.as_str(),
                    summary
                );
                stats.created += 1;
                store.plan_by_fork(&event.chain_id, &fork_name)?
            }
        };

        // Pending plans with a known activation drive the chain countdown.
        if let Some(plan) = plan {
            if plan.status != UpgradeStatus::Executed && plan.status != UpgradeStatus::Canceled {
                if let Some(target_ts) = plan.activation_ts {
                    store.upsert_countdown(&Countdown {
                        chain_id: plan.chain_id.clone(),
                        fork_name: plan.fork_name.clone(),
                        target_ts,
                        window_low_ts: None,
                        window_high_ts: None,
                        confidence: plan.confidence,
                    })?;
                }
            }
        }
    }

    info!(
        "[MONITOR] reconcile done: {} created, {} updated, {} skipped",
        stats.created, stats.updated, stats.skipped
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::EventRecord;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000;

    fn store_with_chain() -> UpgradeStore {
        let store = UpgradeStore::open_in_memory().unwrap();
        store
            .upsert_chain(&crate::registry::Chain {
                id: "op-mainnet".into(),
                chain_id: Some(10),
                name: "OP Mainnet".into(),
                kind: crate::registry::ChainKind::L2,
                family: "op-stack".into(),
                genesis_unix: None,
                slot_seconds: Some(2),
                slots_per_epoch: None,
            })
            .unwrap();
        store
    }

    fn scheduled_event(tx: &str, delay: &str) -> EventRecord {
        EventRecord {
            chain_id: "op-mainnet".into(),
            address: "0x0000000000000000000000000000000000000001".into(),
            tx_hash: tx.into(),
            block_number: 1_000,
            event_name: "CallScheduled".into(),
            args: json!({ "id": "0xaa", "index": 0, "delay": delay }),
            occurred_at: NOW - 600,
        }
    }

    #[test]
    fn test_suffix_namer_finds_fork_words() {
        let namer = SuffixForkNamer;
        assert_eq!(namer.infer("Scheduling the Fusaka rollout"), Some("Fusaka".into()));
        assert_eq!(namer.infer("prep for Pectra next week"), Some("Pectra".into()));
        assert_eq!(namer.infer("post-Cancun cleanup"), Some("Cancun".into()));
        // Lowercase or unsuffixed words never match.
        assert_eq!(namer.infer("fusaka is close"), None);
        assert_eq!(namer.infer("routine maintenance call"), None);
    }

    #[test]
    fn test_call_scheduled_creates_queued_plan_with_countdown() {
        let store = store_with_chain();
        store.insert_event(&scheduled_event("0xabc1234567", "3600")).unwrap();

        let stats = reconcile(&store, &SuffixForkNamer, NOW).unwrap();
        assert_eq!(stats.created, 1);

        let plan = store
            .plan_by_fork("op-mainnet", DEFAULT_FORK_NAME)
            .unwrap()
            .unwrap();
        assert_eq!(plan.status, UpgradeStatus::Queued);
        assert_eq!(plan.activation_ts, Some(NOW - 600 + 3_600));
        assert!((plan.confidence - ONCHAIN_CONFIDENCE).abs() < f64::EPSILON);
        assert!(plan.source_summary.contains("CallScheduled"));
        assert!(plan.source_summary.contains("0xabc123456..."));

        let countdown = store.countdown("op-mainnet").unwrap().unwrap();
        assert_eq!(countdown.target_ts, NOW - 600 + 3_600);
    }

    #[test]
    fn test_execution_event_advances_the_same_plan() {
        let store = store_with_chain();
        store.insert_event(&scheduled_event("0xabc1234567", "3600")).unwrap();
        reconcile(&store, &SuffixForkNamer, NOW).unwrap();

        let mut executed = scheduled_event("0xabc1234567", "0");
        executed.event_name = "CallExecuted".into();
        executed.args = json!({ "id": "0xaa", "index": 0 });
        executed.occurred_at = NOW - 100;
        store.insert_event(&executed).unwrap();

        let stats = reconcile(&store, &SuffixForkNamer, NOW).unwrap();
        assert_eq!(stats.created, 0);
        assert!(stats.updated >= 1);

        let plan = store
            .plan_by_fork("op-mainnet", DEFAULT_FORK_NAME)
            .unwrap()
            .unwrap();
        assert_eq!(plan.status, UpgradeStatus::Executed);
        // The scheduled activation survives execution.
        assert_eq!(plan.activation_ts, Some(NOW - 600 + 3_600));
    }

    #[test]
    fn test_executed_plans_never_regress_to_queued() {
        let store = store_with_chain();
        let mut executed = scheduled_event("0xdef1234567", "0");
        executed.event_name = "ProposalExecuted".into();
        executed.args = json!({ "proposalId": "42" });
        executed.occurred_at = NOW - 50;
        store.insert_event(&executed).unwrap();
        reconcile(&store, &SuffixForkNamer, NOW).unwrap();

        // A stale scheduling event for the same tx arrives afterwards.
        let mut late = scheduled_event("0xdef1234567", "3600");
        late.occurred_at = NOW - 40;
        store.insert_event(&late).unwrap();
        reconcile(&store, &SuffixForkNamer, NOW).unwrap();

        let plan = store
            .plan_by_fork("op-mainnet", DEFAULT_FORK_NAME)
            .unwrap()
            .unwrap();
        assert_eq!(plan.status, UpgradeStatus::Executed);
    }

    #[test]
    fn test_reconcile_is_idempotent_across_passes() {
        let store = store_with_chain();
        store.insert_event(&scheduled_event("0xabc1234567", "3600")).unwrap();

        let first = reconcile(&store, &SuffixForkNamer, NOW).unwrap();
        assert_eq!(first.created, 1);
        let second = reconcile(&store, &SuffixForkNamer, NOW).unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 0);
    }

    #[test]
    fn test_delay_parses_from_string_or_number() {
        assert_eq!(delay_seconds(&json!({ "delay": "3600" })), Some(3_600));
        assert_eq!(delay_seconds(&json!({ "delay": 120 })), Some(120));
        assert_eq!(delay_seconds(&json!({ "delay": "-5" })), None);
        assert_eq!(delay_seconds(&json!({ "other": 1 })), None);
        assert_eq!(delay_seconds(&json!({ "delay": "notanumber" })), None);
    }
}
