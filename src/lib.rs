//! Fork Sentry library surface.
//!
//! Per-chain polling indexers watch timelock, safe and governor contracts,
//! persist decoded events idempotently, and fold them into per-fork upgrade
//! records with deduplicated webhook alerting. The binary (`src/main.rs`)
//! wires the pieces together; everything here is usable as a library.

pub mod abi;
pub mod alerts;
pub mod error;
pub mod indexer;
pub mod monitor;
pub mod registry;
pub mod rpc;
pub mod storage;

pub use error::{Result, SentryError};
