use thiserror::Error;

use crate::types::Protocol;

pub type Result<T> = std::result::Result<T, YieldError>;

#[derive(Debug, Clone, Error)]
pub enum YieldError {
    /// Adapter-level failure: unsupported market, on-chain read or indexer failure
    #[error("[{protocol}] {message}")]
    Protocol { protocol: Protocol, message: String },

    /// Transport-level failure: unknown chain, dead endpoint, exhausted retries
    #[error("[Chain {chain_id}] {message}")]
    Rpc { chain_id: u64, message: String },

    /// A factory failed while populating a cache miss
    #[error("[Cache: {key}] {message}")]
    Cache { key: String, message: String },

    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("{0}")]
    InvalidAllocation(String),

    #[error("{0}")]
    NoOpportunities(String),

    #[error("{0}")]
    Api(String),

    #[error("Numeric conversion failed: {0}")]
    Conversion(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl YieldError {
    pub fn protocol(protocol: Protocol, message: impl Into<String>) -> Self {
        Self::Protocol { protocol, message: message.into() }
    }

    pub fn rpc(chain_id: u64, message: impl Into<String>) -> Self {
        Self::Rpc { chain_id, message: message.into() }
    }

    /// Re-scope any error under a protocol, keeping the inner message as the cause
    pub fn in_protocol(self, protocol: Protocol, context: &str) -> Self {
        match self {
            Self::Protocol { .. } => self,
            other => Self::protocol(protocol, format!("{context}: {other}")),
        }
    }
}
