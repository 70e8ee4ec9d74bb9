//! Daemon error types.
//!
//! `DaemonError` is the public error taxonomy of the service layer; every
//! lower-layer error is folded into one of its variants.

use rust_decimal::Decimal;
use thiserror::Error;
use warden_domain::DomainError;
use warden_engine::EngineError;
use warden_eventlog::AuditError;
use warden_exec::ExecError;
use warden_store::StoreError;

/// Daemon-level errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Bad input or an operation not allowed in the current state
    #[error("Validation error: {0}")]
    Validation(String),

    /// Entity does not exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Requested quantity exceeds what a risk cap allows
    #[error("Risk limit exceeded ({cap}): requested {requested}, allowed {allowed}")]
    RiskLimitExceeded { cap: String, requested: Decimal, allowed: Decimal },

    /// Lost a conditional write against a concurrent writer
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Broker call failed (including rate limiting)
    #[error("Broker error: {0}")]
    Broker(String),

    /// No price available for a symbol
    #[error("No market data for {0}")]
    NoMarketData(String),

    /// Store or audit ledger failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DaemonError {
    /// Create a not found error
    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound { entity: entity.into(), id: id.to_string() }
    }
}

impl From<StoreError> for DaemonError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { entity_type, id } => Self::NotFound { entity: entity_type, id },
            StoreError::ConcurrencyConflict { .. }
            | StoreError::Duplicate { .. }
            | StoreError::Immutable { .. } => Self::ConcurrencyConflict(e.to_string()),
            StoreError::Domain(e) => Self::Validation(e.to_string()),
            StoreError::Database(message) => Self::Persistence(message),
        }
    }
}

impl From<ExecError> for DaemonError {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::NoMarketData(symbol) => Self::NoMarketData(symbol),
            ExecError::Store(e) => e.into(),
            ExecError::Audit(e) => e.into(),
            ExecError::Domain(e) => e.into(),
            ExecError::Serialization(e) => Self::Persistence(e.to_string()),
            ExecError::InvalidState(message) => Self::ConcurrencyConflict(message),
            other => Self::Broker(other.to_string()),
        }
    }
}

impl From<AuditError> for DaemonError {
    fn from(e: AuditError) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<DomainError> for DaemonError {
    fn from(e: DomainError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<EngineError> for DaemonError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::PositionNotOpen(id) => {
                Self::ConcurrencyConflict(format!("position {} is no longer open", id))
            }
            other => Self::Validation(other.to_string()),
        }
    }
}

/// Result type for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_taxonomy() {
        assert!(matches!(
            DaemonError::from(StoreError::not_found("position", "p-1")),
            DaemonError::NotFound { .. }
        ));
        assert!(matches!(
            DaemonError::from(StoreError::conflict("position", "p-1", "version 2 != 3")),
            DaemonError::ConcurrencyConflict(_)
        ));
        assert!(matches!(
            DaemonError::from(StoreError::Database("connection reset".into())),
            DaemonError::Persistence(_)
        ));
    }

    #[test]
    fn test_exec_errors_map_to_taxonomy() {
        assert!(matches!(
            DaemonError::from(ExecError::RateLimited("429".into())),
            DaemonError::Broker(_)
        ));
        assert!(matches!(
            DaemonError::from(ExecError::NoMarketData("AAPL".into())),
            DaemonError::NoMarketData(_)
        ));
        assert!(matches!(
            DaemonError::from(ExecError::Store(StoreError::not_found("order", "o-1"))),
            DaemonError::NotFound { .. }
        ));
    }
}
