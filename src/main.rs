//! Fork Sentry runtime entrypoint.
//!
//! Subcommands:
//!   `index [chain-id ...]`     run per-chain log indexers until interrupted
//!   `monitor`                  run reconcile + alert cycles until interrupted
//!   `import-registry <path>`   mirror a registry file into the database
//!   `purge-events <days>`      delete raw events older than the cutoff

use std::sync::Arc;
use std::time::Duration;

use fork_sentry::alerts::{channels_from_env, InMemorySentAlerts};
use fork_sentry::indexer::IndexerManager;
use fork_sentry::monitor::{SuffixForkNamer, UpgradeMonitor};
use fork_sentry::registry::Registry;
use fork_sentry::storage::{now_ts, UpgradeStore};

const DEFAULT_DB_PATH: &str = "fork_sentry.db";
const DEFAULT_REGISTRY_PATH: &str = "registry.json";
const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 300;

fn load_db_path() -> String {
    std::env::var("SENTRY_DB_PATH")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_DB_PATH.to_string())
}

fn load_registry_path() -> String {
    std::env::var("REGISTRY_PATH")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_REGISTRY_PATH.to_string())
}

fn load_monitor_interval_secs() -> u64 {
    std::env::var("MONITOR_INTERVAL_SECS")
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|v| (30..=86_400).contains(v))
        .unwrap_or(DEFAULT_MONITOR_INTERVAL_SECS)
}

fn print_usage() {
    eprintln!("usage: fork-sentry <command>");
    eprintln!("  index [chain-id ...]     run chain indexers (all eligible chains by default)");
    eprintln!("  monitor                  run periodic reconcile + alert cycles");
    eprintln!("  import-registry <path>   import chains and watch addresses");
    eprintln!("  purge-events <days>      delete raw events older than <days>");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to `info` when `RUST_LOG` is unset or invalid to avoid silent startup.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        print_usage();
        anyhow::bail!("missing command");
    };

    let db_path = load_db_path();
    let store = UpgradeStore::open(&db_path)?;
    tracing::info!("[STARTUP] database ready at {db_path}");

    match command {
        "index" => {
            let registry = Registry::from_json_path(load_registry_path())?;
            registry.import_into(&store)?;
            let manager = IndexerManager::new(store, registry);

            let filter: Vec<String> = args[1..].to_vec();
            let started = manager
                .start_all(if filter.is_empty() { None } else { Some(&filter) })
                .await?;
            if started == 0 {
                anyhow::bail!("no eligible chains to index");
            }

            tokio::signal::ctrl_c().await?;
            tracing::info!("[STARTUP] interrupt received, stopping indexers");
            manager.stop_all().await;
            Ok(())
        }
        "monitor" => {
            let registry = Registry::from_json_path(load_registry_path())?;
            registry.import_into(&store)?;
            let monitor = UpgradeMonitor::new(
                store,
                registry,
                Vec::new(),
                Arc::new(SuffixForkNamer),
                channels_from_env(),
                Arc::new(InMemorySentAlerts::new()),
            );

            let interval = Duration::from_secs(load_monitor_interval_secs());
            tracing::info!("[STARTUP] monitor cycle every {}s", interval.as_secs());
            loop {
                if let Err(e) = monitor.monitor_all().await {
                    tracing::error!("[MONITOR] cycle failed: {e}");
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("[STARTUP] interrupt received, exiting");
                        return Ok(());
                    }
                }
            }
        }
        "import-registry" => {
            let path = args
                .get(1)
                .cloned()
                .unwrap_or_else(load_registry_path);
            let registry = Registry::from_json_path(&path)?;
            let imported = registry.import_into(&store)?;
            tracing::info!(
                "[STARTUP] imported {} chain(s), {} watch address(es) from {path}",
                registry.chains.len(),
                imported
            );
            Ok(())
        }
        "purge-events" => {
            let days: i64 = args
                .get(1)
                .and_then(|raw| raw.trim().parse().ok())
                .filter(|d| *d > 0)
                .ok_or_else(|| anyhow::anyhow!("purge-events requires a positive day count"))?;
            let deleted = store.purge_events_before(now_ts() - days * 86_400)?;
            tracing::info!("[STARTUP] purged {deleted} event(s) older than {days}d");
            Ok(())
        }
        other => {
            print_usage();
            anyhow::bail!("unknown command `{other}`");
        }
    }
}
