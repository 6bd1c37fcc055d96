//! Error handling - Hierarchical errors with retry classification

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// aleph-ledger error hierarchy
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Timeouts, dropped connections, 5xx-equivalent responses
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Exchange throttled us; `retry_after` is the exchange hint when present
    #[error("Rate limit exceeded (retry after {retry_after:?})")]
    RateLimitExceeded { retry_after: Option<Duration> },

    /// Fatal to the order, never retried
    #[error("Invalid order parameters: {0}")]
    InvalidOrderParameters(String),

    /// Fatal to the order, never retried
    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    /// Exchange does not know the referenced order
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// A feed gap could not be filled in time
    #[error("Sequence gap on stream {stream}: cursor {cursor}, received {received}")]
    SequenceGapUnresolved {
        stream: String,
        cursor: u64,
        received: u64,
    },

    /// Local state disagrees with the exchange
    #[error("State divergence detected: {0}")]
    StateDivergence(String),

    /// Trading halted pending external intervention
    #[error("Trading halted: {0}")]
    TradingHalted(String),

    /// Waiting on the transport took too long
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Checkpoint store errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Whether the dispatcher may retry the command that produced this error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::TransientNetwork(_) | Error::RateLimitExceeded { .. } | Error::Timeout(_)
        )
    }

    /// Errors that end an order's life without a retry
    pub fn is_fatal_to_order(&self) -> bool {
        matches!(
            self,
            Error::InvalidOrderParameters(_)
                | Error::InsufficientBalance(_)
                | Error::OrderNotFound(_)
        )
    }

    /// Exchange-provided back-off hint
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimitExceeded { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}
