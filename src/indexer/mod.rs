//! Per-chain log indexing: one cooperative polling loop per chain plus the
//! manager that owns, supervises and stops them.

mod chain_indexer;
mod manager;

pub use chain_indexer::{ChainIndexer, IndexerConfig, PollOutcome, MAX_BLOCK_RANGE};
pub use manager::IndexerManager;
