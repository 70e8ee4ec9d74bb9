//! Order placement and fill tracking.
//!
//! Every broker call is bracketed by audit entries, and the raw request and
//! response are persisted on the order. Placement is idempotent per
//! `(position, attempt)`: the client order id is derived from both, and an
//! order that already exists locally is returned instead of resubmitted.
//!
//! # Tracking
//!
//! ```text
//! poll ──► fill delta? ──► Fill + ORDER_FILL + entry position update
//!   │
//!   └── not terminal ──► sleep(poll_interval) ──► poll ...
//!                              │
//!             attempts / deadline exhausted ──► cancel remainder (ORDER_CANCELED)
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use warden_domain::{
    client_order_id, Order, OrderPurpose, OrderSide, OrderStatus, PositionId, Price, Quantity,
    Symbol,
};
use warden_eventlog::{AuditLedger, AuditRecord};
use warden_store::{Store, StoreError};

use crate::error::{ExecError, ExecResult};
use crate::ports::{BrokerOrderReport, BrokerOrderRequest, BrokerPort};
use crate::retry::{retry, RetryPolicy};

/// Optimistic-lock retries when an entry fill races another position writer
const POSITION_UPDATE_ATTEMPTS: usize = 3;

/// Tracker tuning
#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    /// Retry policy for submission and cancel calls
    pub broker_retry: RetryPolicy,
    /// Delay between status polls
    pub poll_interval: Duration,
    /// Status polls before giving up on the remainder
    pub max_polls: u32,
    /// Overall budget for an order to fill
    pub fill_deadline: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            broker_retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(1),
            max_polls: 30,
            fill_deadline: Duration::from_secs(60),
        }
    }
}

/// What to submit
#[derive(Debug, Clone)]
pub struct PlaceOrder {
    pub position_id: PositionId,
    /// 1-based placement attempt for this position
    pub attempt: u32,
    pub purpose: OrderPurpose,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub quantity: Quantity,
    /// `None` for a market order
    pub limit_price: Option<Price>,
}

/// Places orders and follows them until they fill or are canceled
pub struct OrderTracker<B: BrokerPort, S: Store> {
    broker: Arc<B>,
    store: Arc<S>,
    ledger: AuditLedger,
    config: TrackerConfig,
}

impl<B: BrokerPort, S: Store> OrderTracker<B, S> {
    pub fn new(broker: Arc<B>, store: Arc<S>, ledger: AuditLedger, config: TrackerConfig) -> Self {
        Self { broker, store, ledger, config }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Submit an order, or return the one already recorded for this attempt.
    ///
    /// The order row is written before the broker call so a crash mid-call
    /// still leaves the attempt number consumed.
    pub async fn place(&self, request: PlaceOrder) -> ExecResult<Order> {
        let client_id = client_order_id(request.position_id, request.attempt);
        if let Some(existing) = self.store.orders().find_by_client_id(&client_id).await? {
            info!(client_order_id = %client_id, status = ?existing.status, "Order already placed, skipping");
            return Ok(existing);
        }

        let mut order = Order::new(
            request.position_id,
            request.attempt,
            request.purpose,
            request.symbol,
            request.side,
            request.quantity,
            request.limit_price,
        );
        let broker_request = BrokerOrderRequest::for_order(&order);
        order.raw_request = Some(serde_json::to_value(&broker_request)?);

        match self.store.orders().insert(&order).await {
            Ok(()) => {}
            Err(StoreError::Duplicate { .. }) => {
                // Lost a race with a concurrent placement of the same attempt
                return self
                    .store
                    .orders()
                    .find_by_client_id(&client_id)
                    .await?
                    .ok_or_else(|| StoreError::not_found("order", &client_id).into());
            }
            Err(e) => return Err(e.into()),
        }

        self.ledger
            .record(AuditRecord::new(
                "ORDER_SUBMITTING",
                "order",
                order.id,
                json!({
                    "client_order_id": order.client_order_id,
                    "position_id": order.position_id,
                    "purpose": order.purpose,
                    "symbol": order.symbol,
                    "side": order.side,
                    "type": order.order_type,
                    "quantity": order.quantity,
                    "limit_price": order.limit_price,
                }),
            ))
            .await?;

        let outcome = retry(&self.config.broker_retry, "place_order", |_| {
            self.broker.place_order(&broker_request)
        })
        .await;
        let now = Utc::now();

        match outcome {
            Ok(ack) => {
                order.broker_order_id = Some(ack.broker_order_id.clone());
                order.raw_response = Some(ack.raw);
                order.updated_at = now;
                if ack.status.is_dead() {
                    order.mark_canceled(now);
                }
                self.store.orders().update(&order).await?;

                self.ledger
                    .record(AuditRecord::new(
                        "ORDER_SUBMITTED",
                        "order",
                        order.id,
                        json!({
                            "client_order_id": order.client_order_id,
                            "broker_order_id": ack.broker_order_id,
                            "broker_status": ack.status,
                        }),
                    ))
                    .await?;

                info!(
                    client_order_id = %order.client_order_id,
                    broker_order_id = %ack.broker_order_id,
                    side = %order.side,
                    quantity = %order.quantity,
                    "Order submitted"
                );
                Ok(order)
            }
            Err(e) => {
                order.raw_response = Some(json!({ "error": e.to_string() }));
                order.mark_canceled(now);
                self.store.orders().update(&order).await?;

                self.ledger
                    .record(AuditRecord::new(
                        "ORDER_SUBMIT_FAILED",
                        "order",
                        order.id,
                        json!({
                            "client_order_id": order.client_order_id,
                            "error": e.to_string(),
                        }),
                    ))
                    .await?;

                warn!(client_order_id = %order.client_order_id, error = %e, "Order submission failed");
                Err(e)
            }
        }
    }

    /// Place, then track until terminal
    pub async fn place_and_track(&self, request: PlaceOrder) -> ExecResult<Order> {
        let order = self.place(request).await?;
        if order.status.is_terminal() {
            return Ok(order);
        }
        self.track(order).await
    }

    /// Poll the broker until the order is terminal. When polls or the
    /// deadline run out, the unfilled remainder is canceled.
    pub async fn track(&self, mut order: Order) -> ExecResult<Order> {
        let broker_order_id = order.broker_order_id.clone().ok_or_else(|| {
            ExecError::InvalidState(format!("order {} was never acknowledged", order.client_order_id))
        })?;
        let deadline = Instant::now() + self.config.fill_deadline;

        for poll in 1..=self.config.max_polls {
            if order.status.is_terminal() {
                return Ok(order);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, self.broker.get_order(&broker_order_id)).await {
                Err(_) => break,
                Ok(Ok(report)) => self.apply_report(&mut order, report).await?,
                Ok(Err(e)) if e.is_retryable() => {
                    debug!(client_order_id = %order.client_order_id, poll, error = %e, "Retryable poll error");
                }
                Ok(Err(e)) => return Err(e),
            }

            if order.status.is_terminal() {
                return Ok(order);
            }
            if poll < self.config.max_polls {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::time::sleep(self.config.poll_interval.min(remaining)).await;
            }
        }

        self.cancel_remainder(&mut order, "fill deadline reached").await?;
        Ok(order)
    }

    /// Poll every non-terminal order once. Used on each reconcile tick so
    /// orders left behind by a restart converge. Returns how many changed.
    pub async fn sync_open_orders(&self) -> ExecResult<usize> {
        let mut changed = 0;

        for mut order in self.store.orders().find_open().await? {
            let Some(broker_order_id) = order.broker_order_id.clone() else {
                continue;
            };
            let before = (order.status, order.filled_quantity);

            match self.broker.get_order(&broker_order_id).await {
                Ok(report) => {
                    if let Err(e) = self.apply_report(&mut order, report).await {
                        warn!(client_order_id = %order.client_order_id, error = %e, "Failed to apply order report");
                        continue;
                    }
                }
                Err(e) => {
                    warn!(client_order_id = %order.client_order_id, error = %e, "Order status poll failed");
                    continue;
                }
            }

            if (order.status, order.filled_quantity) != before {
                changed += 1;
            }
        }

        Ok(changed)
    }

    async fn apply_report(&self, order: &mut Order, report: BrokerOrderReport) -> ExecResult<()> {
        let now = Utc::now();
        let fill = match order.apply_fill_report(report.filled_quantity, report.avg_fill_price, now) {
            Ok(fill) => fill,
            Err(e) => {
                let error = ExecError::FillMismatch(format!("{}: {}", order.client_order_id, e));
                order.raw_response = Some(report.raw);
                self.abandon(order, &error).await?;
                return Err(error);
            }
        };

        order.raw_response = Some(report.raw);
        if report.status.is_dead() {
            order.mark_canceled(now);
        }
        self.store.orders().update(order).await?;

        if let Some(fill) = fill {
            self.store.fills().append(&fill).await?;
            self.ledger
                .record(AuditRecord::new(
                    "ORDER_FILL",
                    "order",
                    order.id,
                    json!({
                        "client_order_id": order.client_order_id,
                        "fill_quantity": fill.quantity,
                        "fill_price": fill.price,
                        "filled_quantity": order.filled_quantity,
                        "status": order.status,
                    }),
                ))
                .await?;

            info!(
                client_order_id = %order.client_order_id,
                fill_quantity = %fill.quantity,
                fill_price = %fill.price,
                "Order fill recorded"
            );

            if order.purpose == OrderPurpose::Entry {
                self.apply_entry_fill(order).await?;
            }
        }

        if order.status == OrderStatus::Canceled {
            self.ledger
                .record(AuditRecord::new(
                    "ORDER_CANCELED",
                    "order",
                    order.id,
                    json!({
                        "client_order_id": order.client_order_id,
                        "reason": "broker",
                        "broker_status": report.status,
                        "filled_quantity": order.filled_quantity,
                    }),
                ))
                .await?;
        }

        Ok(())
    }

    /// Stop following an order whose broker report cannot be applied. The
    /// order is canceled at the broker and closed locally with the fills
    /// already recorded, so neither the sync loop nor entry recovery waits
    /// on it again.
    async fn abandon(&self, order: &mut Order, error: &ExecError) -> ExecResult<()> {
        if order.status.is_terminal() {
            return Ok(());
        }

        if let Some(broker_order_id) = order.broker_order_id.clone() {
            let canceled = retry(&self.config.broker_retry, "cancel_order", |_| {
                self.broker.cancel_order(&broker_order_id)
            })
            .await;
            if let Err(e) = canceled {
                warn!(client_order_id = %order.client_order_id, error = %e, "Broker cancel failed");
            }
        }

        order.mark_canceled(Utc::now());
        self.store.orders().update(order).await?;
        self.ledger
            .record(AuditRecord::new(
                "ORDER_CANCELED",
                "order",
                order.id,
                json!({
                    "client_order_id": order.client_order_id,
                    "reason": "fill report rejected",
                    "error": error.to_string(),
                    "filled_quantity": order.filled_quantity,
                }),
            ))
            .await?;

        warn!(client_order_id = %order.client_order_id, error = %error, "Broker fill report rejected, order canceled");
        Ok(())
    }

    /// Carry the entry order's cumulative fill onto its position
    async fn apply_entry_fill(&self, order: &Order) -> ExecResult<()> {
        let Some(avg_price) = order.avg_fill_price else {
            return Ok(());
        };
        let filled = Quantity::new(order.filled_quantity)?;

        for _ in 0..POSITION_UPDATE_ATTEMPTS {
            let mut position = self
                .store
                .positions()
                .find_by_id(order.position_id)
                .await?
                .ok_or_else(|| StoreError::not_found("position", order.position_id))?;

            if !position.is_open() {
                warn!(position_id = %position.id, "Entry fill arrived for a closed position");
                return Ok(());
            }

            let expected = position.version;
            position.apply_entry_fill(filled, avg_price, Utc::now())?;

            match self.store.positions().update(&position, expected).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    debug!(position_id = %position.id, "Entry fill lost a version race, re-reading");
                }
                Err(StoreError::Immutable { .. }) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::conflict("position", order.position_id, "entry fill kept losing version races").into())
    }

    async fn cancel_remainder(&self, order: &mut Order, reason: &str) -> ExecResult<()> {
        if let Some(broker_order_id) = order.broker_order_id.clone() {
            let canceled = retry(&self.config.broker_retry, "cancel_order", |_| {
                self.broker.cancel_order(&broker_order_id)
            })
            .await;

            match canceled {
                // Pick up anything that filled while we were giving up
                Ok(()) => match self.broker.get_order(&broker_order_id).await {
                    Ok(report) => {
                        if let Err(e) = self.apply_report(order, report).await {
                            warn!(client_order_id = %order.client_order_id, error = %e, "Final order report rejected");
                        }
                    }
                    Err(e) => {
                        warn!(client_order_id = %order.client_order_id, error = %e, "Final order poll failed");
                    }
                },
                Err(e) => {
                    warn!(client_order_id = %order.client_order_id, error = %e, "Broker cancel failed");
                }
            }
        }

        if order.status.is_terminal() {
            return Ok(());
        }

        order.mark_canceled(Utc::now());
        self.store.orders().update(order).await?;
        self.ledger
            .record(AuditRecord::new(
                "ORDER_CANCELED",
                "order",
                order.id,
                json!({
                    "client_order_id": order.client_order_id,
                    "reason": reason,
                    "filled_quantity": order.filled_quantity,
                    "remaining": order.remaining(),
                }),
            ))
            .await?;

        warn!(
            client_order_id = %order.client_order_id,
            filled = %order.filled_quantity,
            reason,
            "Unfilled order remainder canceled"
        );
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::BrokerOrderAck;
    use crate::stub::{FillScript, StubBroker, StubFailure};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use warden_domain::{EntryPlan, Position, Side};
    use warden_store::MemoryStore;

    /// Reports a fixed cumulative fill regardless of the order quantity
    struct OverReportingBroker {
        inner: Arc<StubBroker>,
        reported: Decimal,
        cancels: AtomicUsize,
    }

    #[async_trait]
    impl BrokerPort for OverReportingBroker {
        async fn place_order(&self, request: &BrokerOrderRequest) -> ExecResult<BrokerOrderAck> {
            self.inner.place_order(request).await
        }

        async fn get_order(&self, broker_order_id: &str) -> ExecResult<BrokerOrderReport> {
            let mut report = self.inner.get_order(broker_order_id).await?;
            report.filled_quantity = self.reported;
            report.avg_fill_price = Some(Price::new(dec!(101))?);
            Ok(report)
        }

        async fn cancel_order(&self, broker_order_id: &str) -> ExecResult<()> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            self.inner.cancel_order(broker_order_id).await
        }

        async fn cancel_all_orders(&self) -> ExecResult<usize> {
            self.inner.cancel_all_orders().await
        }

        async fn liquidate_all_positions(&self) -> ExecResult<usize> {
            self.inner.liquidate_all_positions().await
        }

        async fn latest_price(&self, symbol: &Symbol) -> ExecResult<Option<Price>> {
            self.inner.latest_price(symbol).await
        }
    }

    fn fast_config() -> TrackerConfig {
        TrackerConfig {
            broker_retry: RetryPolicy::fixed(3, Duration::from_millis(5)),
            poll_interval: Duration::from_millis(10),
            max_polls: 5,
            fill_deadline: Duration::from_secs(5),
        }
    }

    async fn setup(
        script: FillScript,
    ) -> (OrderTracker<StubBroker, MemoryStore>, Arc<StubBroker>, Arc<MemoryStore>, AuditLedger, Position) {
        let broker = Arc::new(StubBroker::with_script(script));
        broker.set_price("AAPL", dec!(101));
        let store = Arc::new(MemoryStore::new());
        let ledger = AuditLedger::in_memory();

        let plan = EntryPlan::new(
            Side::Long,
            Price::new(dec!(100)).unwrap(),
            Price::new(dec!(95)).unwrap(),
            Price::new(dec!(115)).unwrap(),
        )
        .unwrap();
        let position = Position::open(
            Symbol::new("AAPL").unwrap(),
            Side::Long,
            Quantity::new(dec!(10)).unwrap(),
            &plan,
            None,
            Utc::now(),
        );
        store.positions().insert(&position).await.unwrap();

        let tracker = OrderTracker::new(broker.clone(), store.clone(), ledger.clone(), fast_config());
        (tracker, broker, store, ledger, position)
    }

    fn entry(position: &Position, attempt: u32) -> PlaceOrder {
        PlaceOrder {
            position_id: position.id,
            attempt,
            purpose: OrderPurpose::Entry,
            symbol: position.symbol.clone(),
            side: OrderSide::Buy,
            quantity: position.quantity,
            limit_price: None,
        }
    }

    #[tokio::test]
    async fn test_place_and_track_fills_entry() {
        let (tracker, _broker, store, ledger, position) = setup(FillScript::Immediate).await;

        let order = tracker.place_and_track(entry(&position, 1)).await.unwrap();

        assert_eq!(order.status, OrderStatus::Filled);
        assert!(order.raw_request.is_some());
        assert!(order.raw_response.is_some());

        let fills = store.fills().find_by_order(order.id).await.unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].quantity.as_decimal(), dec!(10));

        let stored = store.positions().find_by_id(position.id).await.unwrap().unwrap();
        assert_eq!(stored.entry_price.as_decimal(), dec!(101));

        let actions: Vec<String> = ledger
            .entries_for("order", &order.id.to_string())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["ORDER_SUBMITTING", "ORDER_SUBMITTED", "ORDER_FILL"]);
    }

    #[tokio::test]
    async fn test_same_attempt_is_not_resubmitted() {
        let (tracker, broker, store, _ledger, position) = setup(FillScript::Immediate).await;

        let first = tracker.place(entry(&position, 1)).await.unwrap();
        let second = tracker.place(entry(&position, 1)).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(broker.place_calls(), 1);
        assert_eq!(store.order_count(), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_submission_is_retried() {
        let (tracker, broker, _store, _ledger, position) = setup(FillScript::Immediate).await;
        broker.fail_next(StubFailure::RateLimited);
        broker.fail_next(StubFailure::Server(503));

        let order = tracker.place(entry(&position, 1)).await.unwrap();

        assert!(order.broker_order_id.is_some());
        assert_eq!(broker.place_calls(), 3);
    }

    #[tokio::test]
    async fn test_rejected_submission_is_audited() {
        let (tracker, broker, store, ledger, position) = setup(FillScript::Immediate).await;
        broker.fail_next(StubFailure::Rejected);

        let result = tracker.place(entry(&position, 1)).await;
        assert!(matches!(result, Err(ExecError::Rejected { .. })));

        let client_id = client_order_id(position.id, 1);
        let order = store.orders().find_by_client_id(&client_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Canceled);

        let entries = ledger.entries_for("order", &order.id.to_string()).await.unwrap();
        assert_eq!(entries.last().unwrap().action, "ORDER_SUBMIT_FAILED");
    }

    #[tokio::test]
    async fn test_partial_fills_accumulate() {
        let (tracker, _broker, store, _ledger, position) =
            setup(FillScript::Steps(vec![dec!(3), dec!(7), dec!(10)])).await;

        let order = tracker.place_and_track(entry(&position, 1)).await.unwrap();

        assert_eq!(order.status, OrderStatus::Filled);
        let fills = store.fills().find_by_order(order.id).await.unwrap();
        let quantities: Vec<_> = fills.iter().map(|f| f.quantity.as_decimal()).collect();
        assert_eq!(quantities, vec![dec!(3), dec!(4), dec!(3)]);
    }

    #[tokio::test]
    async fn test_unfilled_remainder_is_canceled() {
        let (tracker, _broker, store, ledger, position) =
            setup(FillScript::Steps(vec![dec!(4)])).await;

        let order = tracker.place_and_track(entry(&position, 1)).await.unwrap();

        assert_eq!(order.status, OrderStatus::Canceled);
        assert_eq!(order.filled_quantity, dec!(4));

        let stored = store.positions().find_by_id(position.id).await.unwrap().unwrap();
        assert_eq!(stored.quantity.as_decimal(), dec!(4));

        let entries = ledger.entries_for("order", &order.id.to_string()).await.unwrap();
        assert_eq!(entries.last().unwrap().action, "ORDER_CANCELED");
    }

    #[tokio::test]
    async fn test_sync_open_orders_catches_up() {
        let (tracker, broker, store, _ledger, position) = setup(FillScript::Never).await;

        let order = tracker.place(entry(&position, 1)).await.unwrap();
        assert_eq!(order.status, OrderStatus::New);

        broker.set_script(FillScript::Steps(vec![dec!(10)]));
        let changed = tracker.sync_open_orders().await.unwrap();

        assert_eq!(changed, 1);
        let stored = store.orders().find_by_id(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_over_reported_fill_cancels_order() {
        let (_tracker, stub, store, ledger, position) = setup(FillScript::Never).await;
        let broker = Arc::new(OverReportingBroker { inner: stub, reported: dec!(12), cancels: AtomicUsize::new(0) });
        let tracker = OrderTracker::new(broker.clone(), store.clone(), ledger.clone(), fast_config());

        let result = tracker.place_and_track(entry(&position, 1)).await;
        assert!(matches!(result, Err(ExecError::FillMismatch(_))));

        let order = store.orders().find_by_client_id(&client_order_id(position.id, 1)).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Canceled);
        assert_eq!(order.filled_quantity, dec!(0));
        assert!(store.fills().find_by_order(order.id).await.unwrap().is_empty());
        assert_eq!(broker.cancels.load(Ordering::SeqCst), 1);

        let entries = ledger.entries_for("order", &order.id.to_string()).await.unwrap();
        assert_eq!(entries.last().unwrap().action, "ORDER_CANCELED");

        // Nothing left for later ticks to poll
        assert!(store.orders().find_open().await.unwrap().is_empty());
        assert_eq!(tracker.sync_open_orders().await.unwrap(), 0);
    }
}
