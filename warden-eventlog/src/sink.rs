//! Audit Sinks
//!
//! A sink owns the serialized append primitive: reading the chain head and
//! inserting the next entry happen atomically with respect to other writers
//! of the same chain.

use crate::chain::chain_entry;
use crate::types::{AuditEntry, AuditError, AuditRecord, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

/// Storage backend for the audit chain
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Atomically chain `record` after the current head and persist it
    async fn append(&self, record: AuditRecord, at: DateTime<Utc>) -> Result<AuditEntry>;

    /// All entries in sequence order
    async fn entries(&self) -> Result<Vec<AuditEntry>>;

    /// Entries for one entity, in sequence order
    async fn entries_for(&self, entity_type: &str, entity_id: &str) -> Result<Vec<AuditEntry>>;
}

/// In-memory sink. The mutex is held across head read and insert.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pre-built entry, checking it extends the current head
    ///
    /// Used to replay an exported chain.
    pub async fn import(&self, entry: AuditEntry) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let head_hash = entries.last().map(|e| e.hash.clone()).unwrap_or_default();
        if entry.prev_hash != head_hash {
            return Err(AuditError::ChainConflict { expected: head_hash, actual: entry.prev_hash });
        }
        entries.push(entry);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn tamper<F: FnOnce(&mut AuditEntry)>(&self, index: usize, f: F) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(index) {
            f(entry);
        }
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, record: AuditRecord, at: DateTime<Utc>) -> Result<AuditEntry> {
        let mut entries = self.entries.lock().await;
        let entry = chain_entry(entries.last(), record, at)?;
        entries.push(entry.clone());
        Ok(entry)
    }

    async fn entries(&self) -> Result<Vec<AuditEntry>> {
        Ok(self.entries.lock().await.clone())
    }

    async fn entries_for(&self, entity_type: &str, entity_id: &str) -> Result<Vec<AuditEntry>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .filter(|e| e.entity_type == entity_type && e.entity_id == entity_id)
            .cloned()
            .collect())
    }
}
