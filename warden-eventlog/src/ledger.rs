//! Audit Ledger
//!
//! Thin front over an [`AuditSink`]: stamps the time, logs, and exposes chain
//! verification. Cheap to clone.

use crate::chain::invalid_entries;
use crate::sink::{AuditSink, MemoryAuditSink};
use crate::types::{AuditEntry, AuditRecord, Result};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Result of a full chain verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub entries: usize,
    pub valid: bool,
    /// Sequence numbers that failed verification
    pub invalid_seqs: Vec<i64>,
}

/// Append-only, hash-chained audit ledger
#[derive(Clone)]
pub struct AuditLedger {
    sink: Arc<dyn AuditSink>,
}

impl AuditLedger {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Ledger backed by an in-memory sink
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryAuditSink::new()))
    }

    /// Append a record to the chain
    pub async fn record(&self, record: AuditRecord) -> Result<AuditEntry> {
        let entry = self.sink.append(record, Utc::now()).await?;

        debug!(
            seq = entry.seq,
            action = %entry.action,
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            "Audit entry appended"
        );

        Ok(entry)
    }

    /// All entries in sequence order
    pub async fn entries(&self) -> Result<Vec<AuditEntry>> {
        self.sink.entries().await
    }

    /// Entries for one entity
    pub async fn entries_for(&self, entity_type: &str, entity_id: &str) -> Result<Vec<AuditEntry>> {
        self.sink.entries_for(entity_type, entity_id).await
    }

    /// Recompute the whole chain and report broken entries
    pub async fn verify(&self) -> Result<ChainReport> {
        let entries = self.sink.entries().await?;
        let invalid_seqs = invalid_entries(&entries)?;
        Ok(ChainReport { entries: entries.len(), valid: invalid_seqs.is_empty(), invalid_seqs })
    }
}

impl std::fmt::Debug for AuditLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLedger").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActorType;
    use serde_json::json;

    #[tokio::test]
    async fn test_record_and_verify() {
        let ledger = AuditLedger::in_memory();
        ledger
            .record(
                AuditRecord::new("TRADE_APPROVED", "position", "p1", json!({ "qty": "1" }))
                    .with_actor(ActorType::User, Some("ops".into())),
            )
            .await
            .unwrap();
        ledger.record(AuditRecord::new("POSITION_CLOSED", "position", "p1", json!({}))).await.unwrap();

        let report = ledger.verify().await.unwrap();
        assert_eq!(report, ChainReport { entries: 2, valid: true, invalid_seqs: vec![] });

        let entries = ledger.entries_for("position", "p1").await.unwrap();
        assert_eq!(entries[0].actor_type, ActorType::User);
        assert_eq!(entries[0].actor_id.as_deref(), Some("ops"));
    }

    #[tokio::test]
    async fn test_verify_detects_tampering() {
        let sink = Arc::new(MemoryAuditSink::new());
        let ledger = AuditLedger::new(sink.clone());
        for i in 0..4 {
            ledger.record(AuditRecord::new("ORDER_FILL", "order", "o1", json!({ "n": i }))).await.unwrap();
        }

        sink.tamper(1, |entry| entry.action = "ORDER_CANCELED".into()).await;

        let report = ledger.verify().await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.invalid_seqs, vec![2, 3, 4]);
    }
}
