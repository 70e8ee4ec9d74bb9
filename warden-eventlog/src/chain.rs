//! Hash Chain Computation
//!
//! Each entry commits to its predecessor:
//!
//! ```text
//! hash_i = hex(SHA256(hash_{i-1} ‖ canonical(entry_i)))     hash_0's prev = ""
//! ```
//!
//! The canonical form is a JSON object with a fixed field order. Payload keys
//! are sorted (serde_json's default map) and timestamps are rendered with
//! microsecond precision so a round-trip through PostgreSQL hashes the same.

use crate::types::{AuditEntry, AuditError, AuditRecord, Result};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

#[derive(Serialize)]
struct Canonical<'a> {
    seq: i64,
    actor_type: &'a str,
    actor_id: Option<&'a str>,
    action: &'a str,
    entity_type: &'a str,
    entity_id: &'a str,
    payload: &'a serde_json::Value,
    created_at: String,
}

impl<'a> Canonical<'a> {
    fn of(entry: &'a AuditEntry) -> Self {
        Self {
            seq: entry.seq,
            actor_type: entry.actor_type.as_str(),
            actor_id: entry.actor_id.as_deref(),
            action: &entry.action,
            entity_type: &entry.entity_type,
            entity_id: &entry.entity_id,
            payload: &entry.payload,
            created_at: entry.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        }
    }
}

/// Compute the chained hash of `entry` given its predecessor's hash
///
/// The `prev_hash` and `hash` fields of `entry` are ignored.
pub fn compute_entry_hash(prev_hash: &str, entry: &AuditEntry) -> Result<String> {
    let canonical = serde_json::to_string(&Canonical::of(entry))?;

    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(canonical.as_bytes());

    Ok(hex::encode(hasher.finalize()))
}

/// Build the next entry of a chain whose last entry is `head`
pub fn chain_entry(head: Option<&AuditEntry>, record: AuditRecord, at: DateTime<Utc>) -> Result<AuditEntry> {
    let (seq, prev_hash) = match head {
        Some(last) => (last.seq + 1, last.hash.clone()),
        None => (1, String::new()),
    };

    let mut entry = AuditEntry {
        seq,
        actor_type: record.actor_type,
        actor_id: record.actor_id,
        action: record.action,
        entity_type: record.entity_type,
        entity_id: record.entity_id,
        payload: record.payload,
        created_at: at.trunc_subsecs(6),
        prev_hash,
        hash: String::new(),
    };
    entry.hash = compute_entry_hash(&entry.prev_hash, &entry)?;
    Ok(entry)
}

/// Sequence numbers of every entry that fails verification
///
/// Hashes are recomputed from genesis, so tampering with entry k reports k
/// and every entry after it.
pub fn invalid_entries(entries: &[AuditEntry]) -> Result<Vec<i64>> {
    let mut invalid = Vec::new();
    let mut running = String::new();

    for entry in entries {
        let expected = compute_entry_hash(&running, entry)?;
        if entry.prev_hash != running || entry.hash != expected {
            invalid.push(entry.seq);
        }
        running = expected;
    }

    Ok(invalid)
}

/// Verify a full chain, failing on the first broken entry
pub fn verify_chain(entries: &[AuditEntry]) -> Result<()> {
    match invalid_entries(entries)?.first() {
        Some(&seq) => Err(AuditError::ChainBroken { seq }),
        None => Ok(()),
    }
}
