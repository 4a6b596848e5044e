use thiserror::Error;

pub type Result<T> = std::result::Result<T, SentryError>;

#[derive(Debug, Error)]
pub enum SentryError {
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("decode error: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("invalid URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("call timed out after {waited_ms}ms: {context}")]
    Timeout { waited_ms: u64, context: String },
    #[error("block {0} not found")]
    MissingBlock(u64),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite failure: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid row: {0}")]
    InvalidRow(String),
    #[error("countdown window violates low <= target <= high: {0}")]
    CountdownBounds(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    MissingConfig(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
