//! Thin RPC layer over alloy providers.
//!
//! The indexer only ever needs three calls (head block, logs for an address
//! range, block timestamp), so they are bundled behind [`ChainRpc`] and every
//! call is wrapped in a bounded timeout. A hung provider surfaces as a
//! retryable error instead of wedging the chain's poll loop.

use alloy::primitives::{Address, Bytes, B256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{BlockTransactionsKind, Filter};
use alloy::transports::http::Http;
use async_trait::async_trait;
use reqwest::Client;
use std::future::Future;
use tokio::time::{timeout, Duration};

use crate::error::{Result, RpcError};

pub type HttpProvider = RootProvider<Http<Client>>;

const DEFAULT_RPC_TIMEOUT_MS: u64 = 10_000;
const RPC_ERR_MAX_LEN: usize = 260;

fn rpc_call_timeout_ms() -> u64 {
    std::env::var("RPC_CALL_TIMEOUT_MS")
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|v| (250..=60_000).contains(v))
        .unwrap_or(DEFAULT_RPC_TIMEOUT_MS)
}

/// Exponential backoff with a shift cap so the multiplier cannot overflow,
/// clamped to `cap_ms`.
pub fn bounded_exponential_backoff_ms(base_ms: u64, streak: u32, cap_ms: u64) -> u64 {
    if base_ms == 0 {
        return 0;
    }
    let clamped = streak.min(8);
    base_ms.saturating_mul(1u64 << clamped).min(cap_ms)
}

/// Collapse provider error text: drop response payloads and backtraces, and
/// squeeze whitespace so one log line stays one line.
pub fn compact_error(message: impl ToString) -> String {
    let mut raw = message.to_string();
    if let Some((prefix, _)) = raw.split_once(" text: ") {
        raw = format!("{prefix} text=<omitted>");
    }
    if let Some((prefix, _)) = raw.split_once("Stack backtrace:") {
        raw = prefix.to_string();
    }
    let mut compact = String::with_capacity(raw.len().min(RPC_ERR_MAX_LEN + 16));
    let mut prev_ws = false;
    for ch in raw.chars() {
        if ch.is_whitespace() {
            if !prev_ws && !compact.is_empty() {
                compact.push(' ');
            }
            prev_ws = true;
            continue;
        }
        compact.push(ch);
        prev_ws = false;
        if compact.len() > RPC_ERR_MAX_LEN {
            compact.push_str("...(truncated)");
            break;
        }
    }
    compact
}

/// A raw log as the decoder consumes it. Pending logs (no block number or
/// transaction hash yet) are skipped by the indexer.
#[derive(Debug, Clone)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: Option<u64>,
    pub tx_hash: Option<B256>,
}

/// Per-chain RPC surface the indexer depends on.
#[async_trait]
pub trait ChainRpc: Send + Sync + 'static {
    async fn head_block(&self) -> Result<u64>;
    /// Logs for one address in the inclusive range `[from, to]`.
    async fn logs(&self, address: Address, from: u64, to: u64) -> Result<Vec<RawLog>>;
    async fn block_timestamp(&self, number: u64) -> Result<u64>;
}

/// HTTP-backed [`ChainRpc`] with bounded per-call timeouts.
pub struct HttpRpc {
    provider: HttpProvider,
    timeout_ms: u64,
}

impl HttpRpc {
    pub fn connect(url: &str) -> Result<Self> {
        let parsed = url.parse().map_err(|e| RpcError::InvalidUrl {
            url: url.to_string(),
            reason: format!("{e}"),
        })?;
        Ok(Self {
            provider: ProviderBuilder::new().on_http(parsed),
            timeout_ms: rpc_call_timeout_ms(),
        })
    }

    async fn bounded<T, E, F>(&self, context: &str, fut: F) -> Result<T>
    where
        E: std::fmt::Display,
        F: Future<Output = std::result::Result<T, E>> + Send,
    {
        match timeout(Duration::from_millis(self.timeout_ms), fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(RpcError::Transport(compact_error(e)).into()),
            Err(_) => Err(RpcError::Timeout {
                waited_ms: self.timeout_ms,
                context: context.to_string(),
            }
            .into()),
        }
    }
}

#[async_trait]
impl ChainRpc for HttpRpc {
    async fn head_block(&self) -> Result<u64> {
        self.bounded("get_block_number", self.provider.get_block_number())
            .await
    }

    async fn logs(&self, address: Address, from: u64, to: u64) -> Result<Vec<RawLog>> {
        let filter = Filter::new().address(address).from_block(from).to_block(to);
        let logs = self
            .bounded(
                &format!("get_logs [{from}..={to}]"),
                self.provider.get_logs(&filter),
            )
            .await?;
        Ok(logs
            .into_iter()
            .map(|log| RawLog {
                address: log.address(),
                topics: log.topics().to_vec(),
                data: log.data().data.clone(),
                block_number: log.block_number,
                tx_hash: log.transaction_hash,
            })
            .collect())
    }

    async fn block_timestamp(&self, number: u64) -> Result<u64> {
        let block = self
            .bounded(
                &format!("get_block_by_number({number})"),
                self.provider
                    .get_block_by_number(number.into(), BlockTransactionsKind::Hashes),
            )
            .await?;
        let block = block.ok_or(RpcError::MissingBlock(number))?;
        Ok(block.header.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_then_saturates_at_cap() {
        assert_eq!(bounded_exponential_backoff_ms(1_000, 0, 120_000), 1_000);
        assert_eq!(bounded_exponential_backoff_ms(1_000, 3, 120_000), 8_000);
        assert_eq!(bounded_exponential_backoff_ms(1_000, 8, 120_000), 120_000);
        // Streaks past the shift cap stay clamped instead of overflowing.
        assert_eq!(bounded_exponential_backoff_ms(1_000, 200, 120_000), 120_000);
        assert_eq!(bounded_exponential_backoff_ms(0, 5, 120_000), 0);
    }

    #[test]
    fn test_compact_error_elides_payload_and_backtrace() {
        let raw = "DeserError { err: unknown variant, text: \"{...huge body...}\" }\nStack backtrace:\n 0: frame";
        let compact = compact_error(raw);
        assert!(compact.contains("text=<omitted>"));
        assert!(!compact.contains("Stack backtrace"));
        assert!(!compact.contains('\n'));
    }

    #[test]
    fn test_invalid_url_is_a_config_time_error() {
        assert!(HttpRpc::connect("not a url").is_err());
        assert!(HttpRpc::connect("http://localhost:8545").is_ok());
    }
}
