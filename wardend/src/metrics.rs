//! Prometheus metrics.
//!
//! One registry per daemon. Audit appends are counted by wrapping the
//! ledger's sink, so every writer is covered without touching call sites.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use warden_domain::CloseReason;
use warden_eventlog::{AuditEntry, AuditRecord, AuditSink};

use crate::error::{DaemonError, DaemonResult};

/// Daemon metrics
pub struct Metrics {
    registry: Registry,
    pub ticks: IntCounter,
    pub tick_failures: IntCounter,
    pub closes: IntCounterVec,
    pub skipped_positions: IntCounterVec,
    pub kill_switch_activations: IntCounter,
    pub audit_appends: IntCounterVec,
    pub open_positions: IntGauge,
}

impl Metrics {
    pub fn new() -> DaemonResult<Self> {
        let registry = Registry::new_custom(Some("warden".to_string()), None).map_err(metrics_error)?;

        let ticks = IntCounter::new("reconcile_ticks_total", "Reconciliation ticks run").map_err(metrics_error)?;
        let tick_failures =
            IntCounter::new("reconcile_tick_failures_total", "Ticks that failed before completing")
                .map_err(metrics_error)?;
        let closes = IntCounterVec::new(
            Opts::new("positions_closed_total", "Positions closed, by reason"),
            &["reason"],
        )
        .map_err(metrics_error)?;
        let skipped_positions = IntCounterVec::new(
            Opts::new("positions_skipped_total", "Positions skipped during a tick, by cause"),
            &["cause"],
        )
        .map_err(metrics_error)?;
        let kill_switch_activations =
            IntCounter::new("kill_switch_activations_total", "Kill switch runs").map_err(metrics_error)?;
        let audit_appends = IntCounterVec::new(
            Opts::new("audit_appends_total", "Audit entries appended, by action"),
            &["action"],
        )
        .map_err(metrics_error)?;
        let open_positions =
            IntGauge::new("open_positions", "Open positions after the last tick").map_err(metrics_error)?;

        registry.register(Box::new(ticks.clone())).map_err(metrics_error)?;
        registry.register(Box::new(tick_failures.clone())).map_err(metrics_error)?;
        registry.register(Box::new(closes.clone())).map_err(metrics_error)?;
        registry.register(Box::new(skipped_positions.clone())).map_err(metrics_error)?;
        registry.register(Box::new(kill_switch_activations.clone())).map_err(metrics_error)?;
        registry.register(Box::new(audit_appends.clone())).map_err(metrics_error)?;
        registry.register(Box::new(open_positions.clone())).map_err(metrics_error)?;

        Ok(Self {
            registry,
            ticks,
            tick_failures,
            closes,
            skipped_positions,
            kill_switch_activations,
            audit_appends,
            open_positions,
        })
    }

    pub fn record_close(&self, reason: CloseReason) {
        self.closes.with_label_values(&[reason.as_str()]).inc();
    }

    pub fn record_skip(&self, cause: &str) {
        self.skipped_positions.with_label_values(&[cause]).inc();
    }

    /// Text exposition format
    pub fn render(&self) -> DaemonResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| DaemonError::Persistence(e.to_string()))
    }
}

fn metrics_error(e: prometheus::Error) -> DaemonError {
    DaemonError::Config(format!("metrics: {}", e))
}

/// Sink decorator counting successful appends
pub struct MeteredSink {
    inner: Arc<dyn AuditSink>,
    metrics: Arc<Metrics>,
}

impl MeteredSink {
    pub fn new(inner: Arc<dyn AuditSink>, metrics: Arc<Metrics>) -> Self {
        Self { inner, metrics }
    }
}

#[async_trait]
impl AuditSink for MeteredSink {
    async fn append(&self, record: AuditRecord, at: DateTime<Utc>) -> warden_eventlog::Result<AuditEntry> {
        let entry = self.inner.append(record, at).await?;
        self.metrics.audit_appends.with_label_values(&[entry.action.as_str()]).inc();
        Ok(entry)
    }

    async fn entries(&self) -> warden_eventlog::Result<Vec<AuditEntry>> {
        self.inner.entries().await
    }

    async fn entries_for(&self, entity_type: &str, entity_id: &str) -> warden_eventlog::Result<Vec<AuditEntry>> {
        self.inner.entries_for(entity_type, entity_id).await
    }
}
