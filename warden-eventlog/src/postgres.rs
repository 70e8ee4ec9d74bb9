//! PostgreSQL Audit Sink
//!
//! Appends run inside a transaction that first takes a transaction-scoped
//! advisory lock, so concurrent writers (threads or processes) are
//! serialized per chain:
//!
//! ```text
//! BEGIN
//!   SELECT pg_advisory_xact_lock(<chain key>)
//!   SELECT ... FROM audit_log ORDER BY seq DESC LIMIT 1
//!   INSERT INTO audit_log (...)
//! COMMIT
//! ```
//!
//! Uses dynamic queries (sqlx::query) so the crate builds without DATABASE_URL.

use crate::chain::chain_entry;
use crate::sink::AuditSink;
use crate::types::{ActorType, AuditEntry, AuditRecord, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

/// Advisory lock key for the audit chain ("WARDAUD1" as bytes)
const AUDIT_CHAIN_LOCK: i64 = 0x5741_5244_4155_4431;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS audit_log (
    seq          BIGINT PRIMARY KEY,
    actor_type   TEXT NOT NULL,
    actor_id     TEXT,
    action       TEXT NOT NULL,
    entity_type  TEXT NOT NULL,
    entity_id    TEXT NOT NULL,
    payload      JSONB NOT NULL,
    created_at   TIMESTAMPTZ NOT NULL,
    prev_hash    TEXT NOT NULL,
    hash         TEXT NOT NULL UNIQUE
);
CREATE INDEX IF NOT EXISTS audit_log_entity_idx ON audit_log (entity_type, entity_id);
"#;

/// Audit sink backed by the `audit_log` table
#[derive(Debug, Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the audit table if it does not exist
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    async fn head(tx: &mut Transaction<'_, Postgres>) -> Result<Option<AuditEntry>> {
        let row = sqlx::query(
            "SELECT seq, actor_type, actor_id, action, entity_type, entity_id, payload, \
             created_at, prev_hash, hash FROM audit_log ORDER BY seq DESC LIMIT 1",
        )
        .fetch_optional(&mut **tx)
        .await?;

        row.as_ref().map(parse_entry_row).transpose()
    }
}

fn parse_entry_row(row: &PgRow) -> Result<AuditEntry> {
    let actor_type: String = row.try_get("actor_type")?;
    Ok(AuditEntry {
        seq: row.try_get("seq")?,
        actor_type: actor_type.parse::<ActorType>()?,
        actor_id: row.try_get("actor_id")?,
        action: row.try_get("action")?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
        prev_hash: row.try_get("prev_hash")?,
        hash: row.try_get("hash")?,
    })
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn append(&self, record: AuditRecord, at: DateTime<Utc>) -> Result<AuditEntry> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(AUDIT_CHAIN_LOCK)
            .execute(&mut *tx)
            .await?;

        let head = Self::head(&mut tx).await?;
        let entry = chain_entry(head.as_ref(), record, at)?;

        sqlx::query(
            r#"
            INSERT INTO audit_log (
                seq, actor_type, actor_id, action, entity_type, entity_id,
                payload, created_at, prev_hash, hash
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.seq)
        .bind(entry.actor_type.as_str())
        .bind(&entry.actor_id)
        .bind(&entry.action)
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(&entry.payload)
        .bind(entry.created_at)
        .bind(&entry.prev_hash)
        .bind(&entry.hash)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(seq = entry.seq, action = %entry.action, "Audit entry persisted");
        Ok(entry)
    }

    async fn entries(&self) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT seq, actor_type, actor_id, action, entity_type, entity_id, payload, \
             created_at, prev_hash, hash FROM audit_log ORDER BY seq ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(parse_entry_row).collect()
    }

    async fn entries_for(&self, entity_type: &str, entity_id: &str) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT seq, actor_type, actor_id, action, entity_type, entity_id, payload, \
             created_at, prev_hash, hash FROM audit_log \
             WHERE entity_type = $1 AND entity_id = $2 ORDER BY seq ASC",
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(parse_entry_row).collect()
    }
}
