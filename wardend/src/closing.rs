//! Shared close path.
//!
//! Whatever triggers a close (reconciler rule, approved profit take, operator),
//! the persisted close is followed by exactly one `POSITION_CLOSED` audit
//! entry, expiry of any pending profit-take request, and a best-effort exit
//! order for the filled quantity. Broker failures while flattening are logged
//! and left to the operator; the local close stands.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info, warn};

use warden_domain::{
    CloseReason, Order, OrderPurpose, OrderStatus, Position, PositionId, Price, ProfitTakeId,
    ProfitTakeStatus, Quantity,
};
use warden_eventlog::{AuditLedger, AuditRecord};
use warden_exec::{BrokerPort, OrderTracker, PlaceOrder};
use warden_store::Store;

use crate::actor::Actor;
use crate::error::{DaemonError, DaemonResult};
use crate::metrics::Metrics;

/// Version-conflict retries for operator-initiated closes
const CLOSE_ATTEMPTS: usize = 3;

pub struct PositionCloser<B: BrokerPort, S: Store> {
    broker: Arc<B>,
    store: Arc<S>,
    ledger: AuditLedger,
    tracker: Arc<OrderTracker<B, S>>,
    metrics: Arc<Metrics>,
}

impl<B: BrokerPort, S: Store> PositionCloser<B, S> {
    pub fn new(
        broker: Arc<B>,
        store: Arc<S>,
        ledger: AuditLedger,
        tracker: Arc<OrderTracker<B, S>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { broker, store, ledger, tracker, metrics }
    }

    /// Close the latest version of a position, re-reading on version conflicts.
    pub async fn close(
        &self,
        position_id: PositionId,
        reason: CloseReason,
        exit_price: Option<Price>,
        details: serde_json::Value,
        actor: &Actor,
    ) -> DaemonResult<Position> {
        self.close_keeping(position_id, reason, exit_price, details, actor, None).await
    }

    /// Close with TARGET on behalf of an approved profit take. The request
    /// itself is left for the caller to decide.
    pub async fn close_for_profit_take(
        &self,
        position_id: PositionId,
        request_id: ProfitTakeId,
        exit_price: Price,
        details: serde_json::Value,
        actor: &Actor,
    ) -> DaemonResult<Position> {
        self.close_keeping(position_id, CloseReason::Target, Some(exit_price), details, actor, Some(request_id))
            .await
    }

    async fn close_keeping(
        &self,
        position_id: PositionId,
        reason: CloseReason,
        exit_price: Option<Price>,
        details: serde_json::Value,
        actor: &Actor,
        keep_request: Option<ProfitTakeId>,
    ) -> DaemonResult<Position> {
        for attempt in 1..=CLOSE_ATTEMPTS {
            let mut working = self
                .store
                .positions()
                .find_by_id(position_id)
                .await?
                .ok_or_else(|| DaemonError::not_found("position", position_id))?;
            if !working.is_open() {
                return Err(DaemonError::Validation(format!("position {} is already closed", position_id)));
            }

            let expected = working.version;
            working.close(reason, exit_price, Utc::now())?;

            match self.store.positions().update(&working, expected).await {
                Ok(closed) => {
                    self.finish_close(&closed, details, actor, keep_request).await?;
                    return Ok(closed);
                }
                Err(e) if e.is_conflict() && attempt < CLOSE_ATTEMPTS => {
                    debug!(%position_id, attempt, "Close lost a version race, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(DaemonError::ConcurrencyConflict(format!("position {} kept changing", position_id)))
    }

    /// Operator close at the latest broker price. Without a price the close
    /// still goes through and realized PnL stays unknown.
    pub async fn close_manually(&self, position_id: PositionId, actor: &Actor) -> DaemonResult<Position> {
        let position = self
            .store
            .positions()
            .find_by_id(position_id)
            .await?
            .ok_or_else(|| DaemonError::not_found("position", position_id))?;

        let exit_price = match self.broker.latest_price(&position.symbol).await {
            Ok(price) => price,
            Err(e) => {
                warn!(%position_id, error = %e, "No price for manual close, closing without exit price");
                None
            }
        };

        self.close(position_id, CloseReason::Manual, exit_price, json!({ "source": "operator" }), actor)
            .await
    }

    /// Audit and flatten a close that is already persisted.
    pub async fn after_close(&self, closed: &Position, details: serde_json::Value, actor: &Actor) -> DaemonResult<()> {
        self.finish_close(closed, details, actor, None).await
    }

    async fn finish_close(
        &self,
        closed: &Position,
        details: serde_json::Value,
        actor: &Actor,
        keep_request: Option<ProfitTakeId>,
    ) -> DaemonResult<()> {
        self.ledger
            .record(actor.stamp(AuditRecord::new(
                "POSITION_CLOSED",
                "position",
                closed.id,
                json!({
                    "reason": closed.close_reason,
                    "symbol": closed.symbol,
                    "side": closed.side,
                    "quantity": closed.quantity,
                    "entry_price": closed.entry_price,
                    "exit_price": closed.exit_price,
                    "realized_pnl": closed.realized_pnl,
                    "stop": closed.stop.current,
                    "trail_level": closed.stop.trail_level,
                    "details": details,
                }),
            )))
            .await?;

        if let Some(reason) = closed.close_reason {
            self.metrics.record_close(reason);
        }
        info!(
            position_id = %closed.id,
            symbol = %closed.symbol,
            reason = ?closed.close_reason,
            realized_pnl = ?closed.realized_pnl,
            "Position closed"
        );

        self.expire_pending_request(closed, actor, keep_request).await;
        self.flatten(closed).await;
        Ok(())
    }

    /// Expire the pending profit take of a closed position, unless it is `keep`
    pub(crate) async fn expire_pending_request(&self, closed: &Position, actor: &Actor, keep: Option<ProfitTakeId>) {
        let request = match self.store.profit_takes().find_pending_for_position(closed.id).await {
            Ok(Some(request)) if Some(request.id) != keep => request,
            Ok(_) => return,
            Err(e) => {
                warn!(position_id = %closed.id, error = %e, "Failed to look up pending profit take");
                return;
            }
        };

        match self.store.profit_takes().transition(request.id, ProfitTakeStatus::Expired, Utc::now()).await {
            Ok(_) => {
                let record = AuditRecord::new(
                    "PROFIT_TAKE_EXPIRED",
                    "profit_take",
                    request.id,
                    json!({ "position_id": closed.id, "cause": "position closed" }),
                );
                if let Err(e) = self.ledger.record(actor.stamp(record)).await {
                    warn!(request_id = %request.id, error = %e, "Failed to audit profit take expiry");
                }
            }
            Err(e) => debug!(request_id = %request.id, error = %e, "Profit take decided concurrently"),
        }
    }

    /// Cancel live entry orders and submit a market exit for what filled.
    pub async fn flatten(&self, closed: &Position) -> Option<Order> {
        let orders = match self.store.orders().find_by_position(closed.id).await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(position_id = %closed.id, error = %e, "Cannot flatten: order lookup failed");
                return None;
            }
        };

        for order in orders.iter().filter(|o| o.purpose == OrderPurpose::Entry && !o.status.is_terminal()) {
            if let Some(broker_order_id) = &order.broker_order_id {
                if let Err(e) = self.broker.cancel_order(broker_order_id).await {
                    warn!(client_order_id = %order.client_order_id, error = %e, "Failed to cancel live entry order");
                }
            }
        }

        let already_exiting = orders.iter().any(|o| {
            o.purpose == OrderPurpose::Exit && !(o.status == OrderStatus::Canceled && o.filled_quantity.is_zero())
        });
        if already_exiting {
            return None;
        }

        let filled: Decimal = orders
            .iter()
            .filter(|o| o.purpose == OrderPurpose::Entry)
            .map(|o| o.filled_quantity)
            .sum();
        let Ok(quantity) = Quantity::new(filled) else {
            debug!(position_id = %closed.id, "Nothing filled, no exit order needed");
            return None;
        };

        let request = PlaceOrder {
            position_id: closed.id,
            attempt: orders.len() as u32 + 1,
            purpose: OrderPurpose::Exit,
            symbol: closed.symbol.clone(),
            side: closed.side.exit_action(),
            quantity,
            limit_price: None,
        };

        match self.tracker.place(request).await {
            Ok(order) => Some(order),
            Err(e) => {
                warn!(position_id = %closed.id, error = %e, "Exit order failed, broker position left open");
                None
            }
        }
    }
}
