//! Error taxonomy for the broker.
//!
//! Per-backend failures (`ServerError`) are absorbed by the aggregation layer
//! and reported as degraded servers. Only `BrokerError` reaches the caller.

use std::time::Duration;

use thiserror::Error;

/// Request-time validation failures. Never retried, never counted against a
/// backend's circuit breaker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("invalid parameter '{param}': {reason}")]
    InvalidParameter { param: String, reason: String },

    #[error("chain depth {depth} exceeds maximum {max}")]
    ChainDepthExceeded { depth: usize, max: usize },

    #[error("page size {requested} exceeds maximum {max}")]
    PageSizeTooLarge { requested: usize, max: usize },

    #[error("invalid continuation token: {0}")]
    InvalidToken(String),

    #[error("continuation token does not match this query: {0}")]
    TokenMismatch(String),

    #[error("unsupported resolution: {0}")]
    UnsupportedResolution(String),
}

/// Failure of one orchestrated call against one backend server.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServerError {
    #[error("circuit open for server '{server}'")]
    CircuitOpen { server: String, retry_after: Duration },

    #[error("server '{server}' timed out after {after:?}")]
    Timeout { server: String, after: Duration },

    #[error("server '{server}' unreachable: {reason}")]
    Unreachable { server: String, reason: String },

    #[error("unexpected response from server '{server}': {reason}")]
    UnexpectedResponse { server: String, reason: String },

    #[error("call to server '{server}' cancelled")]
    Cancelled { server: String },
}

impl ServerError {
    pub fn server(&self) -> &str {
        match self {
            ServerError::CircuitOpen { server, .. }
            | ServerError::Timeout { server, .. }
            | ServerError::Unreachable { server, .. }
            | ServerError::UnexpectedResponse { server, .. }
            | ServerError::Cancelled { server } => server,
        }
    }

    /// Short label for metrics and response metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerError::CircuitOpen { .. } => "circuit_open",
            ServerError::Timeout { .. } => "timeout",
            ServerError::Unreachable { .. } => "unreachable",
            ServerError::UnexpectedResponse { .. } => "unexpected_response",
            ServerError::Cancelled { .. } => "cancelled",
        }
    }
}

/// Errors surfaced to the caller of a federated search.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("rate limit exceeded for client '{client}'")]
    RateLimited { client: String, retry_after: Duration },

    #[error("too many concurrent searches (limit {limit})")]
    TooManyConcurrentSearches { limit: usize },

    #[error("memory budget exhausted ({requested} bytes requested, {available} available)")]
    MemoryPressure { requested: usize, available: usize },

    #[error(transparent)]
    Invalid(#[from] QueryError),

    #[error("query too costly: {0}")]
    TooCostly(String),

    #[error("no backend server can serve this query")]
    NoServersAvailable { excluded: Vec<(String, String)> },

    #[error("all {} selected servers failed", .failures.len())]
    AllServersFailed { failures: Vec<ServerError> },

    #[error("search cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

impl BrokerError {
    /// Admission rejections and total outages may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::RateLimited { .. }
                | BrokerError::TooManyConcurrentSearches { .. }
                | BrokerError::MemoryPressure { .. }
                | BrokerError::NoServersAvailable { .. }
                | BrokerError::AllServersFailed { .. }
        )
    }

    /// Suggested delay before retrying, when one is known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            BrokerError::RateLimited { retry_after, .. } => Some(*retry_after),
            BrokerError::TooManyConcurrentSearches { .. } | BrokerError::MemoryPressure { .. } => {
                Some(Duration::from_secs(1))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BrokerError::AllServersFailed {
            failures: vec![
                ServerError::Timeout { server: "a".into(), after: Duration::from_secs(1) },
                ServerError::Cancelled { server: "b".into() },
            ],
        };
        assert_eq!(err.to_string(), "all 2 selected servers failed");

        let err: BrokerError = QueryError::ChainDepthExceeded { depth: 4, max: 3 }.into();
        assert_eq!(err.to_string(), "chain depth 4 exceeds maximum 3");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retry_signal() {
        let err = BrokerError::RateLimited {
            client: "c".into(),
            retry_after: Duration::from_secs(7),
        };
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }
}
