//! Emergency liquidation.
//!
//! ```text
//! cancel all broker orders ──► liquidate all broker positions ──► close every
//! local OPEN position as KILL_SWITCH ──► one KILL_SWITCH audit entry
//! ```
//!
//! Broker failures are logged and swallowed: the local book is always forced
//! flat. Running it again is harmless; the second run closes nothing.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use warden_domain::{CloseReason, PositionId, ProfitTakeStatus};
use warden_eventlog::{AuditLedger, AuditRecord};
use warden_exec::{retry, BrokerPort, RetryPolicy};
use warden_store::Store;

use crate::actor::Actor;
use crate::error::DaemonResult;
use crate::metrics::Metrics;

/// What set the kill switch off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSwitchSource {
    /// Operator request
    Manual,
    /// Portfolio limit breach found by the reconciler
    Breach,
}

/// Outcome of one kill switch run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KillSwitchReport {
    pub orders_canceled: usize,
    pub positions_closed: usize,
    pub closed_position_ids: Vec<PositionId>,
    /// Broker calls that failed and were skipped
    pub broker_errors: Vec<String>,
}

pub struct KillSwitch<B: BrokerPort, S: Store> {
    broker: Arc<B>,
    store: Arc<S>,
    ledger: AuditLedger,
    metrics: Arc<Metrics>,
    retry: RetryPolicy,
    running: Mutex<()>,
}

impl<B: BrokerPort, S: Store> KillSwitch<B, S> {
    pub fn new(broker: Arc<B>, store: Arc<S>, ledger: AuditLedger, metrics: Arc<Metrics>, retry: RetryPolicy) -> Self {
        Self { broker, store, ledger, metrics, retry, running: Mutex::new(()) }
    }

    /// Cancel, liquidate and force-close everything. Concurrent triggers run
    /// one after the other.
    pub async fn trigger(&self, source: KillSwitchSource, actor: &Actor) -> DaemonResult<KillSwitchReport> {
        let _guard = self.running.lock().await;
        warn!(?source, "Kill switch triggered");

        let mut broker_errors = Vec::new();

        let orders_canceled = match retry(&self.retry, "cancel_all_orders", |_| self.broker.cancel_all_orders()).await {
            Ok(count) => count,
            Err(e) => {
                error!(error = %e, "Kill switch: cancel all orders failed");
                broker_errors.push(format!("cancel_all_orders: {}", e));
                0
            }
        };

        let liquidated = match retry(&self.retry, "liquidate_all_positions", |_| {
            self.broker.liquidate_all_positions()
        })
        .await
        {
            Ok(count) => count,
            Err(e) => {
                error!(error = %e, "Kill switch: liquidation failed");
                broker_errors.push(format!("liquidate_all_positions: {}", e));
                0
            }
        };

        let now = Utc::now();
        let closed_position_ids = self.store.positions().close_all_open(CloseReason::KillSwitch, now).await?;

        // Requests on closed positions can no longer be acted on
        for request in self.store.profit_takes().find_pending().await? {
            if closed_position_ids.contains(&request.position_id) {
                if let Err(e) = self.store.profit_takes().transition(request.id, ProfitTakeStatus::Expired, now).await {
                    warn!(request_id = %request.id, error = %e, "Kill switch: failed to expire profit take");
                }
            }
        }

        let report = KillSwitchReport {
            orders_canceled,
            positions_closed: closed_position_ids.len(),
            closed_position_ids,
            broker_errors,
        };

        self.ledger
            .record(actor.stamp(AuditRecord::new(
                "KILL_SWITCH",
                "system",
                "kill-switch",
                json!({
                    "source": source,
                    "orders_canceled": report.orders_canceled,
                    "broker_positions_liquidated": liquidated,
                    "positions_closed": report.positions_closed,
                    "position_ids": report.closed_position_ids,
                    "broker_errors": report.broker_errors,
                }),
            )))
            .await?;

        self.metrics.kill_switch_activations.inc();
        for _ in 0..report.positions_closed {
            self.metrics.record_close(CloseReason::KillSwitch);
        }

        info!(
            orders_canceled = report.orders_canceled,
            positions_closed = report.positions_closed,
            liquidated,
            "Kill switch complete"
        );
        Ok(report)
    }
}
