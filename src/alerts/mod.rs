//! Alert candidate selection, deduplication and channel fan-out.
//!
//! Each reconciliation pass selects recently-touched upgrade plans, filters
//! out ones that already happened, and sends a channel-agnostic payload to
//! every configured sink at most once per (chain, fork, status) key. Dedup
//! state is injectable so a persistent store can replace the in-process set
//! without touching dispatch logic.

mod channels;

pub use channels::{channels_from_env, DiscordWebhook, GenericWebhook, SlackWebhook, TelegramChannel};

use async_trait::async_trait;
use dashmap::DashSet;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::Result;
use crate::storage::{AlertCandidate, UpgradeStatus, UpgradeStore};

/// Channel-agnostic alert body sent to every sink.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AlertPayload {
    pub chain_id: String,
    pub chain_name: String,
    pub fork_name: String,
    pub stage: String,
    /// When this alert was assembled (unix seconds).
    pub ts: i64,
    pub activation_epoch: Option<i64>,
    pub activation_ts: Option<i64>,
    pub target_ts: Option<i64>,
    pub window_low_ts: Option<i64>,
    pub window_high_ts: Option<i64>,
    pub confidence: f64,
    pub links: Vec<String>,
    pub details: Value,
}

impl AlertPayload {
    /// In-process dedup key: one send per unique (chain, fork, status).
    pub fn dedup_key(&self) -> String {
        format!("{}-{}-{}", self.chain_id, self.fork_name, self.stage)
    }
}

/// Injectable dedup state. Keys that were marked sent never re-fire within
/// the lifetime of the backing store.
pub trait SentAlerts: Send + Sync {
    fn already_sent(&self, key: &str) -> bool;
    fn mark_sent(&self, key: &str);
}

/// Default process-lifetime dedup set.
#[derive(Default)]
pub struct InMemorySentAlerts {
    keys: DashSet<String>,
}

impl InMemorySentAlerts {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SentAlerts for InMemorySentAlerts {
    fn already_sent(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    fn mark_sent(&self, key: &str) {
        self.keys.insert(key.to_string());
    }
}

/// One notification channel. Implementations must not panic on delivery
/// failure; errors are collected by the dispatcher.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, alert: &AlertPayload) -> anyhow::Result<()>;
}

/// Outcome of one channel's delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchResult {
    pub channel: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Fan an alert out to every sink. Failures are isolated per channel and
/// reported in the result set, never propagated.
pub async fn dispatch(alert: &AlertPayload, sinks: &[Arc<dyn AlertSink>]) -> Vec<DispatchResult> {
    let mut results = Vec::with_capacity(sinks.len());
    for sink in sinks {
        match sink.send(alert).await {
            Ok(()) => {
                info!("[ALERT]   ok {}", sink.name());
                results.push(DispatchResult {
                    channel: sink.name().to_string(),
                    success: true,
                    error: None,
                });
            }
            Err(e) => {
                let message = crate::rpc::compact_error(e);
                warn!("[ALERT]   failed {}: {message}", sink.name());
                results.push(DispatchResult {
                    channel: sink.name().to_string(),
                    success: false,
                    error: Some(message),
                });
            }
        }
    }
    results
}

/// Reference links surfaced with alerts, keyed by chain id.
pub fn reference_links(chain_id: &str) -> Vec<String> {
    let links: &[&str] = match chain_id {
        "eth-mainnet" => &[
            "https://blog.ethereum.org",
            "https://ethereum.org/en/roadmap/",
        ],
        "eth-sepolia" => &["https://blog.ethereum.org"],
        "op-mainnet" => &["https://community.optimism.io/docs/chain/upgrades/"],
        "base-mainnet" => &["https://www.base.org/"],
        "arbitrum-one" => &["https://forum.arbitrum.foundation/"],
        "avalanche-c" => &["https://github.com/ava-labs/avalanchego/releases"],
        _ => &[],
    };
    links.iter().map(|s| (*s).to_string()).collect()
}

/// A scheduled/queued plan whose activation already passed is history, not
/// an alert. Plans without a known activation time stay actionable (the date
/// may simply not be announced yet).
fn is_actionable(candidate: &AlertCandidate, now: i64) -> bool {
    if candidate.plan.status == UpgradeStatus::ReleasePosted {
        return true;
    }
    match candidate.plan.activation_ts {
        Some(ts) => ts >= now,
        None => true,
    }
}

fn build_payload(candidate: &AlertCandidate, store: &UpgradeStore, now: i64) -> Result<AlertPayload> {
    let plan = &candidate.plan;
    let countdown = store.countdown(&plan.chain_id)?;

    let mut details = serde_json::Map::new();
    details.insert("source".to_string(), Value::String(plan.source_summary.clone()));
    if let Some(Value::Object(extra)) = &plan.details {
        for (key, value) in extra {
            details.insert(key.clone(), value.clone());
        }
    }

    Ok(AlertPayload {
        chain_id: plan.chain_id.clone(),
        chain_name: candidate.chain_name.clone(),
        fork_name: plan.fork_name.clone(),
        stage: plan.status.as_str().to_string(),
        ts: now,
        activation_epoch: plan.activation_epoch,
        activation_ts: plan.activation_ts,
        target_ts: countdown.as_ref().map(|c| c.target_ts),
        window_low_ts: countdown.as_ref().and_then(|c| c.window_low_ts),
        window_high_ts: countdown.as_ref().and_then(|c| c.window_high_ts),
        confidence: plan.confidence,
        links: reference_links(&plan.chain_id),
        details: Value::Object(details),
    })
}

/// One alert pass: select candidates, drop non-actionable and already-sent
/// ones, dispatch the rest. Every processed key is marked sent whether or
/// not delivery succeeded (at-most-once; transient channel outages are not
/// retried).
pub async fn run_alert_pass(
    store: &UpgradeStore,
    sinks: &[Arc<dyn AlertSink>],
    sent: &dyn SentAlerts,
    now: i64,
) -> Result<Vec<DispatchResult>> {
    let candidates = store.alert_candidates(now)?;
    if candidates.is_empty() {
        info!("[ALERT] no recent upgrades to notify");
        return Ok(Vec::new());
    }
    info!("[ALERT] checking {} candidate(s)", candidates.len());

    let mut all_results = Vec::new();
    for candidate in &candidates {
        let plan = &candidate.plan;
        if !is_actionable(candidate, now) {
            info!(
                "[ALERT] skipping {} {} ({}): activation already passed",
                candidate.chain_name, plan.fork_name, plan.status.as_str()
            );
            continue;
        }

        let payload = build_payload(candidate, store, now)?;
        let key = payload.dedup_key();
        if sent.already_sent(&key) {
            info!("[ALERT] already sent: {key}");
            continue;
        }

        if sinks.is_empty() {
            info!(
                "[ALERT] {} {}: no channels configured",
                candidate.chain_name, plan.fork_name
            );
        } else {
            info!(
                "[ALERT] -> {} {} ({}) to {} channel(s)",
                candidate.chain_name,
                plan.fork_name,
                plan.status.as_str(),
                sinks.len()
            );
            all_results.extend(dispatch(&payload, sinks).await);
        }
        sent.mark_sent(&key);
    }
    Ok(all_results)
}

/// Human-readable one-liner shared by the chat-style sinks.
pub(crate) fn summary_text(alert: &AlertPayload) -> String {
    let mut text = format!(
        "{} upgrade `{}` is {} (confidence {:.0}%)",
        alert.chain_name,
        alert.fork_name,
        alert.stage,
        alert.confidence * 100.0
    );
    if let Some(ts) = alert.activation_ts.or(alert.target_ts) {
        text.push_str(&format!(", activation at unix {ts}"));
    }
    if let Some(link) = alert.links.first() {
        text.push_str(&format!("\n{link}"));
    }
    text
}
