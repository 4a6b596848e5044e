//! Chain registry: which chains we track, their RPC endpoints, and the
//! contract addresses watched on each.
//!
//! The registry is owned by an external import pipeline; this module only
//! loads the JSON it produces, resolves RPC URLs (environment override takes
//! precedence over the registry list), and mirrors chains + watch addresses
//! into storage for the indexer and reconciler to read.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

use crate::abi::AbiKind;
use crate::error::{ConfigError, Result};
use crate::storage::UpgradeStore;

pub const DEFAULT_SLOT_SECONDS: i64 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainKind {
    L1,
    L2,
    Testnet,
}

impl ChainKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChainKind::L1 => "L1",
            ChainKind::L2 => "L2",
            ChainKind::Testnet => "testnet",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "L1" => Some(Self::L1),
            "L2" => Some(Self::L2),
            "testnet" => Some(Self::Testnet),
            _ => None,
        }
    }
}

impl Serialize for ChainKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ChainKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ChainKind::from_db(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown chain kind `{raw}`")))
    }
}

/// Stable chain metadata. Immutable once imported except for administrative
/// re-imports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    /// Stable slug, e.g. `op-mainnet`.
    pub id: String,
    /// Numeric EVM chain id, where one exists.
    #[serde(default)]
    pub chain_id: Option<u64>,
    pub name: String,
    pub kind: ChainKind,
    pub family: String,
    #[serde(default)]
    pub genesis_unix: Option<i64>,
    #[serde(default)]
    pub slot_seconds: Option<i64>,
    #[serde(default)]
    pub slots_per_epoch: Option<i64>,
}

impl Chain {
    /// Convert a beacon-style epoch number to a unix timestamp, where the
    /// chain's genesis and slot parameters are known.
    pub fn epoch_to_ts(&self, epoch: i64) -> Option<i64> {
        let genesis = self.genesis_unix?;
        let slot_seconds = self.slot_seconds?;
        let slots_per_epoch = self.slots_per_epoch?;
        Some(genesis + epoch * slots_per_epoch * slot_seconds)
    }

    /// Approximate seconds per block, used for backfill-depth estimates.
    pub fn block_seconds(&self) -> i64 {
        self.slot_seconds
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_SLOT_SECONDS)
    }
}

/// One watched contract on a chain. (chain_id, address) is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchAddress {
    pub chain_id: String,
    pub label: String,
    pub address: String,
    pub abi_kind: AbiKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryWatch {
    pub label: String,
    pub address: String,
    pub abi_kind: AbiKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryChain {
    #[serde(flatten)]
    pub chain: Chain,
    #[serde(default)]
    pub rpc_urls: Vec<String>,
    #[serde(default)]
    pub watch: Vec<RegistryWatch>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Registry {
    pub version: u32,
    pub chains: Vec<RegistryChain>,
}

impl Registry {
    pub fn from_json_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::InvalidConfig(format!("cannot read registry {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let registry: Registry = serde_json::from_str(raw)
            .map_err(|e| ConfigError::InvalidConfig(format!("bad registry JSON: {e}")))?;
        Ok(registry)
    }

    /// Mirror chains and watch addresses into storage.
    pub fn import_into(&self, store: &UpgradeStore) -> Result<usize> {
        let mut imported = 0usize;
        for entry in &self.chains {
            store.upsert_chain(&entry.chain)?;
            for watch in &entry.watch {
                store.upsert_watch_address(&WatchAddress {
                    chain_id: entry.chain.id.clone(),
                    label: watch.label.clone(),
                    address: watch.address.clone(),
                    abi_kind: watch.abi_kind,
                })?;
                imported += 1;
            }
        }
        Ok(imported)
    }
}

/// Environment variable consulted for a chain's RPC override,
/// e.g. `op-mainnet` -> `OP_MAINNET_RPC_URL`.
pub fn rpc_env_var(chain_id: &str) -> String {
    let mut name = chain_id.to_ascii_uppercase().replace('-', "_");
    name.push_str("_RPC_URL");
    name
}

/// Resolve the RPC URL for a chain: env override first, then the first
/// registry-provided URL. `None` means the chain is not eligible to index.
pub fn resolve_rpc_url(entry: &RegistryChain) -> Option<String> {
    let var = rpc_env_var(&entry.chain.id);
    if let Ok(url) = env::var(&var) {
        let trimmed = url.trim();
        if !trimmed.is_empty() {
            tracing::info!("[INDEX] {}: using RPC override from {var}", entry.chain.id);
            return Some(trimmed.to_string());
        }
    }
    entry.rpc_urls.first().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY_JSON: &str = r#"{
        "version": 1,
        "chains": [
            {
                "id": "op-mainnet",
                "chain_id": 10,
                "name": "OP Mainnet",
                "kind": "L2",
                "family": "op-stack",
                "slot_seconds": 2,
                "rpc_urls": ["https://mainnet.optimism.io"],
                "watch": [
                    {
                        "label": "L1 Upgrade Timelock",
                        "address": "0x0000000000000000000000000000000000000042",
                        "abi_kind": "timelock"
                    }
                ]
            },
            {
                "id": "eth-mainnet",
                "chain_id": 1,
                "name": "Ethereum Mainnet",
                "kind": "L1",
                "family": "ethereum",
                "genesis_unix": 1606824023,
                "slot_seconds": 12,
                "slots_per_epoch": 32
            }
        ]
    }"#;

    #[test]
    fn test_parses_registry_and_imports_watch_addresses() {
        let registry = Registry::from_json_str(REGISTRY_JSON).unwrap();
        assert_eq!(registry.version, 1);
        assert_eq!(registry.chains.len(), 2);

        let store = UpgradeStore::open_in_memory().unwrap();
        let imported = registry.import_into(&store).unwrap();
        assert_eq!(imported, 1);

        let watches = store.watch_addresses("op-mainnet").unwrap();
        assert_eq!(watches.len(), 1);
        assert_eq!(watches[0].abi_kind, AbiKind::Timelock);
        assert_eq!(store.chain_name("eth-mainnet").unwrap().unwrap(), "Ethereum Mainnet");
    }

    #[test]
    fn test_epoch_conversion_uses_genesis_and_slot_parameters() {
        let registry = Registry::from_json_str(REGISTRY_JSON).unwrap();
        let eth = &registry.chains[1].chain;
        // One epoch is 32 slots of 12 seconds.
        assert_eq!(eth.epoch_to_ts(0), Some(1_606_824_023));
        assert_eq!(eth.epoch_to_ts(1), Some(1_606_824_023 + 384));

        let op = &registry.chains[0].chain;
        assert_eq!(op.epoch_to_ts(1), None);
        assert_eq!(op.block_seconds(), 2);
    }

    #[test]
    fn test_rpc_resolution_prefers_env_override() {
        let registry = Registry::from_json_str(REGISTRY_JSON).unwrap();
        let op = &registry.chains[0];
        assert_eq!(rpc_env_var("op-mainnet"), "OP_MAINNET_RPC_URL");

        // No override set: registry URL wins.
        std::env::remove_var("OP_MAINNET_RPC_URL");
        assert_eq!(
            resolve_rpc_url(op).as_deref(),
            Some("https://mainnet.optimism.io")
        );

        std::env::set_var("OP_MAINNET_RPC_URL", "http://localhost:8545");
        assert_eq!(resolve_rpc_url(op).as_deref(), Some("http://localhost:8545"));
        std::env::remove_var("OP_MAINNET_RPC_URL");

        // Neither override nor registry URLs: not eligible.
        let eth = &registry.chains[1];
        std::env::remove_var("ETH_MAINNET_RPC_URL");
        assert_eq!(resolve_rpc_url(eth), None);
    }
}
