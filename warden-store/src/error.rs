//! Storage layer errors

use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Debug, Error)]
pub enum StoreError {
    /// Entity not found
    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound {
        /// Type of entity (position, order, opportunity, ...)
        entity_type: String,
        /// Entity ID
        id: String,
    },

    /// Duplicate entity (idempotency violation)
    #[error("Duplicate entity: {entity_type} with id {id}")]
    Duplicate {
        /// Type of entity
        entity_type: String,
        /// Entity ID
        id: String,
    },

    /// Conditional write lost against a concurrent writer
    #[error("Concurrency conflict on {entity_type} {id}: {message}")]
    ConcurrencyConflict {
        /// Type of entity
        entity_type: String,
        /// Entity ID
        id: String,
        /// What did not match
        message: String,
    },

    /// Write attempted on a terminal (immutable) entity
    #[error("{entity_type} {id} is immutable")]
    Immutable {
        /// Type of entity
        entity_type: String,
        /// Entity ID
        id: String,
    },

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Domain error passthrough
    #[error("Domain error: {0}")]
    Domain(#[from] warden_domain::DomainError),
}

impl StoreError {
    /// Create a not found error
    pub fn not_found(entity_type: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound { entity_type: entity_type.into(), id: id.to_string() }
    }

    /// Create a duplicate error
    pub fn duplicate(entity_type: impl Into<String>, id: impl ToString) -> Self {
        Self::Duplicate { entity_type: entity_type.into(), id: id.to_string() }
    }

    /// Create a concurrency conflict error
    pub fn conflict(entity_type: impl Into<String>, id: impl ToString, message: impl Into<String>) -> Self {
        Self::ConcurrencyConflict {
            entity_type: entity_type.into(),
            id: id.to_string(),
            message: message.into(),
        }
    }

    /// Create an immutable-entity error
    pub fn immutable(entity_type: impl Into<String>, id: impl ToString) -> Self {
        Self::Immutable { entity_type: entity_type.into(), id: id.to_string() }
    }

    /// Whether retrying later (after re-reading) may succeed
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}
