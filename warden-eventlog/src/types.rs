//! Audit Ledger Types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Actor type that caused the audited transition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActorType {
    /// Operator action through the API
    User,
    /// Daemon autonomous action (reconciler, order tracker)
    Daemon,
    /// System-level action (kill switch, scheduled job)
    System,
    /// Broker-originated event
    Broker,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::User => "User",
            ActorType::Daemon => "Daemon",
            ActorType::System => "System",
            ActorType::Broker => "Broker",
        }
    }
}

impl fmt::Display for ActorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActorType {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "User" => Ok(ActorType::User),
            "Daemon" => Ok(ActorType::Daemon),
            "System" => Ok(ActorType::System),
            "Broker" => Ok(ActorType::Broker),
            other => Err(AuditError::InvalidRecord(format!("unknown actor type '{}'", other))),
        }
    }
}

/// Audit record builder (what callers hand to the ledger)
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: serde_json::Value,
}

impl AuditRecord {
    /// Create a new record attributed to the daemon
    pub fn new(
        action: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl ToString,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            actor_type: ActorType::Daemon,
            actor_id: None,
            action: action.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.to_string(),
            payload,
        }
    }

    /// Set actor
    pub fn with_actor(mut self, actor_type: ActorType, actor_id: Option<String>) -> Self {
        self.actor_type = actor_type;
        self.actor_id = actor_id;
        self
    }
}

/// A persisted, chained audit entry
///
/// `hash = SHA256(prev_hash ‖ canonical(entry))`; the first entry has
/// `prev_hash = ""`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub seq: i64,
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub prev_hash: String,
    pub hash: String,
}

/// Audit ledger errors
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Chain head moved: expected prev hash {expected}, found {actual}")]
    ChainConflict { expected: String, actual: String },

    #[error("Chain broken at seq {seq}")]
    ChainBroken { seq: i64 },

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

pub type Result<T> = std::result::Result<T, AuditError>;
