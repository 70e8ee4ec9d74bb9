//! Engine errors

use thiserror::Error;
use warden_domain::{DomainError, PositionId};

/// Errors raised while evaluating a position
#[derive(Debug, Error)]
pub enum EngineError {
    /// Only OPEN positions are reconciled
    #[error("Position {0} is not open")]
    PositionNotOpen(PositionId),

    /// Pending request belongs to another position
    #[error("Profit-take request does not belong to position {0}")]
    ForeignRequest(PositionId),

    /// Domain rule violated while simulating a transition
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
