//! Execution layer error types.

use thiserror::Error;

/// Errors that can occur during broker and execution operations.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Broker answered 429
    #[error("Rate limited by broker: {0}")]
    RateLimited(String),

    /// Broker answered 5xx
    #[error("Broker server error ({status}): {message}")]
    Server {
        /// HTTP status
        status: u16,
        /// Response body or summary
        message: String,
    },

    /// Connection-level failure before a response arrived
    #[error("Network error: {0}")]
    Network(String),

    /// Broker call did not answer in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Broker refused the request (4xx other than 429)
    #[error("Order rejected ({status:?}): {message}")]
    Rejected {
        /// HTTP status, when there was one
        status: Option<u16>,
        /// Rejection reason
        message: String,
    },

    /// Broker fill report does not fit the order we hold
    #[error("Fill mismatch: {0}")]
    FillMismatch(String),

    /// No latest price available for a symbol
    #[error("No market data for {0}")]
    NoMarketData(String),

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] warden_store::StoreError),

    /// Audit ledger error
    #[error("Audit error: {0}")]
    Audit(#[from] warden_eventlog::AuditError),

    /// Domain error
    #[error("Domain error: {0}")]
    Domain(#[from] warden_domain::DomainError),

    /// Request/response (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl ExecError {
    /// Transient failures worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Server { .. } | Self::Network(_) | Self::Timeout(_)
        )
    }

    /// Failures that originate at the broker (as opposed to our own store or ledger)
    pub fn is_broker(&self) -> bool {
        self.is_retryable() || matches!(self, Self::Rejected { .. } | Self::FillMismatch(_))
    }
}

/// Result type for execution operations.
pub type ExecResult<T> = Result<T, ExecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ExecError::RateLimited("slow down".into()).is_retryable());
        assert!(ExecError::Server { status: 503, message: "unavailable".into() }.is_retryable());
        assert!(ExecError::Timeout("place_order".into()).is_retryable());
        assert!(!ExecError::Rejected { status: Some(422), message: "qty".into() }.is_retryable());
        assert!(!ExecError::FillMismatch("overfill".into()).is_retryable());
    }

    #[test]
    fn test_broker_classification() {
        assert!(ExecError::Rejected { status: Some(403), message: "forbidden".into() }.is_broker());
        assert!(!ExecError::InvalidState("closed".into()).is_broker());
    }
}
