//! Upgrade monitoring: off-chain signal collection, event reconciliation and
//! the alert pass, composed into one periodic cycle.

mod reconciler;

pub use reconciler::{
    reconcile, ForkNamer, ReconcileStats, SuffixForkNamer, DEFAULT_FORK_NAME, ONCHAIN_CONFIDENCE,
    RECONCILE_WINDOW_SECONDS,
};

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::alerts::{run_alert_pass, AlertSink, DispatchResult, SentAlerts};
use crate::error::Result;
use crate::registry::Registry;
use crate::rpc::compact_error;
use crate::storage::{now_ts, Countdown, NewUpgradePlan, UpgradeStatus, UpgradeStore};

/// An upgrade observation from an off-chain source (release feeds, governance
/// forums, curated schedules).
#[derive(Debug, Clone)]
pub struct UpgradeSignal {
    pub chain_id: String,
    pub fork_name: String,
    pub status: UpgradeStatus,
    pub activation_epoch: Option<i64>,
    pub activation_ts: Option<i64>,
    pub confidence: f64,
    pub source_summary: String,
    pub details: Option<Value>,
}

/// One off-chain signal collector. Collectors must not panic; a failing
/// collector is logged and skipped for the cycle.
#[async_trait]
pub trait SignalSource: Send + Sync {
    fn name(&self) -> &str;
    async fn collect(&self) -> anyhow::Result<Vec<UpgradeSignal>>;
}

/// Merge off-chain detail payloads: incoming keys win, everything else is
/// kept. Non-object payloads are replaced wholesale.
fn merge_details(existing: Option<&Value>, incoming: Option<&Value>) -> Option<Value> {
    match (existing, incoming) {
        (Some(Value::Object(old)), Some(Value::Object(new))) => {
            let mut merged = old.clone();
            for (key, value) in new {
                merged.insert(key.clone(), value.clone());
            }
            Some(Value::Object(merged))
        }
        (_, Some(new)) => Some(new.clone()),
        (old, None) => old.cloned(),
    }
}

/// Periodic upgrade monitor. One `monitor_all` call is one full cycle:
/// collect signals, reconcile persisted events, dispatch alerts.
pub struct UpgradeMonitor {
    store: UpgradeStore,
    registry: Registry,
    sources: Vec<Arc<dyn SignalSource>>,
    namer: Arc<dyn ForkNamer>,
    sinks: Vec<Arc<dyn AlertSink>>,
    sent: Arc<dyn SentAlerts>,
}

impl UpgradeMonitor {
    pub fn new(
        store: UpgradeStore,
        registry: Registry,
        sources: Vec<Arc<dyn SignalSource>>,
        namer: Arc<dyn ForkNamer>,
        sinks: Vec<Arc<dyn AlertSink>>,
        sent: Arc<dyn SentAlerts>,
    ) -> Self {
        Self {
            store,
            registry,
            sources,
            namer,
            sinks,
            sent,
        }
    }

    /// Run one monitoring cycle at the current wall-clock time.
    pub async fn monitor_all(&self) -> Result<Vec<DispatchResult>> {
        self.monitor_at(now_ts()).await
    }

    /// Clock-injected cycle, used directly by tests.
    pub async fn monitor_at(&self, now: i64) -> Result<Vec<DispatchResult>> {
        for source in &self.sources {
            match source.collect().await {
                Ok(signals) => {
                    info!("[MONITOR] {}: {} signal(s)", source.name(), signals.len());
                    for signal in &signals {
                        if let Err(e) = self.apply_signal(signal, now) {
                            warn!(
                                "[MONITOR] {}: failed to apply {}/{}: {}",
                                source.name(),
                                signal.chain_id,
                                signal.fork_name,
                                compact_error(e)
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!("[MONITOR] {} failed: {}", source.name(), compact_error(e));
                }
            }
        }

        reconcile(&self.store, self.namer.as_ref(), now)?;
        run_alert_pass(&self.store, &self.sinks, self.sent.as_ref(), now).await
    }

    /// Upsert one off-chain signal into the plan table. Status only ever
    /// advances; details merge instead of overwriting.
    fn apply_signal(&self, signal: &UpgradeSignal, now: i64) -> Result<()> {
        let activation_ts = signal.activation_ts.or_else(|| {
            let epoch = signal.activation_epoch?;
            self.registry
                .chains
                .iter()
                .find(|entry| entry.chain.id == signal.chain_id)
                .and_then(|entry| entry.chain.epoch_to_ts(epoch))
        });

        match self.store.plan_by_fork(&signal.chain_id, &signal.fork_name)? {
            Some(existing) => {
                let status = if existing.status.can_transition_to(signal.status) {
                    signal.status
                } else {
                    existing.status
                };
                let details = merge_details(existing.details.as_ref(), signal.details.as_ref());
                self.store.update_plan_offchain(
                    existing.id,
                    status,
                    signal.confidence.max(existing.confidence),
                    &signal.source_summary,
                    details.as_ref(),
                    signal.activation_epoch.or(existing.activation_epoch),
                    activation_ts.or(existing.activation_ts),
                    now,
                )?;
            }
            None => {
                self.store.insert_plan(
                    &NewUpgradePlan {
                        chain_id: signal.chain_id.clone(),
                        fork_name: signal.fork_name.clone(),
                        status: signal.status,
                        activation_epoch: signal.activation_epoch,
                        activation_ts,
                        confidence: signal.confidence,
                        source_summary: signal.source_summary.clone(),
                        details: signal.details.clone(),
                    },
                    now,
                )?;
                info!(
                    "[MONITOR] {}: new plan {} ({}) from off-chain signal",
                    signal.chain_id,
                    signal.fork_name,
                    signal.status.as_str()
                );
            }
        }

        // Dated pending plans keep the chain countdown current too.
        if let Some(target_ts) = activation_ts {
            if matches!(
                signal.status,
                UpgradeStatus::Scheduled | UpgradeStatus::Queued | UpgradeStatus::ReleasePosted
            ) {
                self.store.upsert_countdown(&Countdown {
                    chain_id: signal.chain_id.clone(),
                    fork_name: signal.fork_name.clone(),
                    target_ts,
                    window_low_ts: None,
                    window_high_ts: None,
                    confidence: signal.confidence,
                })?;
            }
        }
        Ok(())
    }
}
