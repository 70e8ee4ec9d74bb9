//! Audit Ledger Module
//!
//! Provides the append-only audit ledger every state transition writes
//! through:
//! - Hash chaining (`hash_i = SHA256(hash_{i-1} ‖ entry_i)`) for tamper evidence
//! - Serialized append per chain (mutex in memory, advisory lock in PostgreSQL)
//! - Full-chain verification
//!
//! # Usage
//!
//! ```rust
//! use warden_eventlog::{AuditLedger, AuditRecord};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = AuditLedger::in_memory();
//!
//! ledger
//!     .record(AuditRecord::new(
//!         "POSITION_CLOSED",
//!         "position",
//!         "0190a1f2-...",
//!         serde_json::json!({ "reason": "STOP", "price": "89.50" }),
//!     ))
//!     .await?;
//!
//! assert!(ledger.verify().await?.valid);
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod ledger;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod sink;
pub mod types;

pub use chain::{compute_entry_hash, invalid_entries, verify_chain};
pub use ledger::{AuditLedger, ChainReport};
#[cfg(feature = "postgres")]
pub use postgres::PgAuditSink;
pub use sink::{AuditSink, MemoryAuditSink};
pub use types::{ActorType, AuditEntry, AuditError, AuditRecord, Result};
