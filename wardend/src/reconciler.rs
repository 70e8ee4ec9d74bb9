//! Reconciliation tick.
//!
//! One tick:
//!
//! ```text
//! sync open orders with the broker
//!   └── for each OPEN position (failures isolated per position)
//!         ├── entry never filled ──► recovery: wait, re-place, or flag for review
//!         ├── latest price (none ──► skip)
//!         ├── Engine::evaluate ──► persist (conditional on version)
//!         └── audit each transition; closes go through PositionCloser
//!   └── portfolio check over what is still open ──► breach? kill switch
//! ```
//!
//! Ticks are serialized; a scheduled tick and an API-triggered one never
//! overlap.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use warden_domain::{
    Order, OrderPurpose, Position, PositionId, Price, ProfitTakeRequest,
    ProfitTakeStatus, RiskLimit,
};
use warden_engine::{Breach, Decision, Engine, EngineAction, OpenLeg, PositionSnapshot};
use warden_eventlog::{AuditLedger, AuditRecord};
use warden_exec::{BrokerPort, OrderTracker, PlaceOrder};
use warden_store::{Store, StoreError};

use crate::actor::Actor;
use crate::closing::PositionCloser;
use crate::error::{DaemonError, DaemonResult};
use crate::kill_switch::{KillSwitch, KillSwitchReport, KillSwitchSource};
use crate::metrics::Metrics;

/// Reconciler settings
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Equity used to convert percent group limits
    pub equity: Decimal,
    /// Time an unfilled entry may sit before it is re-placed
    pub entry_grace: Duration,
    /// Entry placements before the position is flagged for review
    pub max_entry_attempts: u32,
}

/// Summary of one tick
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub closed_count: usize,
    pub kill_switch_triggered: bool,
    pub evaluated: usize,
    pub skipped: usize,
    pub stops_tightened: usize,
    pub profit_takes_requested: usize,
    pub entries_replaced: usize,
    pub flagged_for_review: usize,
    pub orders_synced: usize,
    /// Open positions with no price this tick; left out of group exposure
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unpriced: Vec<PositionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breach: Option<Breach>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kill_switch: Option<KillSwitchReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Unchanged,
    Adjusted { tightened: bool, requested: bool },
    Closed,
    EntryPending,
    EntryReplaced,
    FlaggedForReview,
    AwaitingReview,
}

pub struct Reconciler<B: BrokerPort + 'static, S: Store + 'static> {
    engine: Engine,
    broker: Arc<B>,
    store: Arc<S>,
    ledger: AuditLedger,
    tracker: Arc<OrderTracker<B, S>>,
    closer: Arc<PositionCloser<B, S>>,
    kill_switch: Arc<KillSwitch<B, S>>,
    metrics: Arc<Metrics>,
    config: ReconcilerConfig,
    tick_lock: Mutex<()>,
}

impl<B: BrokerPort + 'static, S: Store + 'static> Reconciler<B, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Engine,
        broker: Arc<B>,
        store: Arc<S>,
        ledger: AuditLedger,
        tracker: Arc<OrderTracker<B, S>>,
        closer: Arc<PositionCloser<B, S>>,
        kill_switch: Arc<KillSwitch<B, S>>,
        metrics: Arc<Metrics>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            engine,
            broker,
            store,
            ledger,
            tracker,
            closer,
            kill_switch,
            metrics,
            config,
            tick_lock: Mutex::new(()),
        }
    }

    /// Run one reconciliation tick
    pub async fn tick(&self) -> DaemonResult<TickReport> {
        let _guard = self.tick_lock.lock().await;
        self.metrics.ticks.inc();

        let result = self.run_tick(Utc::now()).await;
        match &result {
            Ok(report) => {
                if report.closed_count > 0 || report.kill_switch_triggered || report.skipped > 0 {
                    info!(
                        closed = report.closed_count,
                        skipped = report.skipped,
                        kill_switch = report.kill_switch_triggered,
                        "Reconciliation tick complete"
                    );
                } else {
                    debug!(evaluated = report.evaluated, "Reconciliation tick complete");
                }
            }
            Err(e) => {
                self.metrics.tick_failures.inc();
                error!(error = %e, "Reconciliation tick failed");
            }
        }
        result
    }

    async fn run_tick(&self, now: DateTime<Utc>) -> DaemonResult<TickReport> {
        let mut report = TickReport::default();

        match self.tracker.sync_open_orders().await {
            Ok(changed) => report.orders_synced = changed,
            Err(e) => warn!(error = %e, "Order sync failed, continuing with stored state"),
        }

        let limits = self.store.risk_limits().find_active().await?;
        let positions = self.store.positions().find_open().await?;
        let mut marks: HashMap<PositionId, Price> = HashMap::new();

        for position in &positions {
            match self.reconcile_position(position, &limits, now, &mut marks).await {
                Ok(outcome) => {
                    report.evaluated += 1;
                    match outcome {
                        Outcome::Closed => report.closed_count += 1,
                        Outcome::Adjusted { tightened, requested } => {
                            report.stops_tightened += usize::from(tightened);
                            report.profit_takes_requested += usize::from(requested);
                        }
                        Outcome::EntryReplaced => report.entries_replaced += 1,
                        Outcome::FlaggedForReview => report.flagged_for_review += 1,
                        Outcome::Unchanged | Outcome::EntryPending | Outcome::AwaitingReview => {}
                    }
                }
                Err(e) => {
                    report.skipped += 1;
                    if matches!(e, DaemonError::NoMarketData(_)) {
                        report.unpriced.push(position.id);
                    }
                    self.metrics.record_skip(skip_cause(&e));
                    warn!(position_id = %position.id, symbol = %position.symbol, error = %e, "Position skipped this tick");
                }
            }
        }

        let open = self.store.positions().find_open().await?;
        self.metrics.open_positions.set(open.len() as i64);

        // Only positions marked this tick carry exposure
        let legs: Vec<OpenLeg> = open
            .iter()
            .filter_map(|p| marks.get(&p.id).map(|mark| OpenLeg::from_position(p, mark.as_decimal())))
            .collect();

        if let Some(breach) = self.engine.check_portfolio(open.len(), &legs, &limits, self.config.equity) {
            warn!(?breach, "Portfolio limit breached, triggering kill switch");
            self.ledger
                .record(AuditRecord::new(
                    "PORTFOLIO_BREACH",
                    "portfolio",
                    "portfolio",
                    json!({ "breach": breach, "open_positions": open.len() }),
                ))
                .await?;

            let kill = self.kill_switch.trigger(KillSwitchSource::Breach, &Actor::system()).await?;
            report.kill_switch_triggered = true;
            report.breach = Some(breach);
            report.kill_switch = Some(kill);
        }

        Ok(report)
    }

    async fn reconcile_position(
        &self,
        position: &Position,
        limits: &[RiskLimit],
        now: DateTime<Utc>,
        marks: &mut HashMap<PositionId, Price>,
    ) -> DaemonResult<Outcome> {
        let orders = self.store.orders().find_by_position(position.id).await?;
        let entry_filled = orders
            .iter()
            .any(|o| o.purpose == OrderPurpose::Entry && o.filled_quantity > Decimal::ZERO);
        if !entry_filled {
            return self.recover_entry(position, &orders, now).await;
        }

        let price = self
            .broker
            .latest_price(&position.symbol)
            .await?
            .ok_or_else(|| DaemonError::NoMarketData(position.symbol.to_string()))?;
        marks.insert(position.id, price);

        let pending = self.store.profit_takes().find_pending_for_position(position.id).await?;
        let snapshot = PositionSnapshot { position, price, now, pending_request: pending.as_ref() };
        let decision = self.engine.evaluate(&snapshot, limits)?;

        if decision.is_noop() {
            return Ok(Outcome::Unchanged);
        }
        self.apply(position, decision, now).await
    }

    /// Persist a decision, then audit it. Nothing is audited when the
    /// conditional write loses.
    async fn apply(&self, position: &Position, decision: Decision, now: DateTime<Utc>) -> DaemonResult<Outcome> {
        let mut working = position.clone();
        let mut expired = None;
        let mut tightened = Vec::new();
        let mut request = None;
        let mut close = None;

        for action in decision.actions {
            match action {
                EngineAction::ExpireProfitTake { request_id, tighten } => {
                    let previous = working.stop.current;
                    let applied = match tighten {
                        Some(update) => working.tighten_stop(update.level, update.stop, now)?,
                        None => false,
                    };
                    expired = Some((request_id, applied.then_some((previous, working.stop))));
                }
                EngineAction::Tighten(update) => {
                    let previous = working.stop.current;
                    if working.tighten_stop(update.level, update.stop, now)? {
                        tightened.push((previous, working.stop));
                    }
                }
                EngineAction::RequestProfitTake { price, expires_at } => request = Some((price, expires_at)),
                EngineAction::Close { reason, exit_price, metrics } => {
                    working.close(reason, Some(exit_price), now)?;
                    close = Some(metrics);
                }
            }
        }

        let saved = self.store.positions().update(&working, position.version).await?;
        let expiry_tightened = matches!(expired, Some((_, Some(_))));

        if let Some((request_id, step)) = expired {
            match self.store.profit_takes().transition(request_id, ProfitTakeStatus::Expired, now).await {
                Ok(_) => {
                    self.ledger
                        .record(AuditRecord::new(
                            "PROFIT_TAKE_EXPIRED",
                            "profit_take",
                            request_id,
                            json!({
                                "position_id": saved.id,
                                "cause": "grace elapsed",
                                "previous_stop": step.map(|(previous, _)| previous),
                                "stop": step.map(|(_, stop)| stop.current),
                                "trail_level": step.map(|(_, stop)| stop.trail_level),
                            }),
                        ))
                        .await?;
                }
                Err(e) => warn!(%request_id, error = %e, "Profit take decided while expiring it"),
            }
        }

        for (previous, stop) in &tightened {
            self.ledger
                .record(AuditRecord::new(
                    "STOP_TIGHTENED",
                    "position",
                    saved.id,
                    json!({
                        "previous_stop": previous,
                        "stop": stop.current,
                        "trail_level": stop.trail_level,
                    }),
                ))
                .await?;
            info!(position_id = %saved.id, stop = %stop.current, level = %stop.trail_level, "Stop tightened");
        }

        let mut requested = false;
        if let Some((price, expires_at)) = request {
            let mut profit_take =
                ProfitTakeRequest::new(saved.id, price, now, self.engine.config().profit_take_grace);
            profit_take.expires_at = expires_at;

            match self.store.profit_takes().insert(&profit_take).await {
                Ok(()) => {
                    self.ledger
                        .record(AuditRecord::new(
                            "PROFIT_TAKE_REQUESTED",
                            "profit_take",
                            profit_take.id,
                            json!({
                                "position_id": saved.id,
                                "price": price,
                                "target": saved.target,
                                "expires_at": expires_at,
                            }),
                        ))
                        .await?;
                    info!(position_id = %saved.id, %price, "Target reached, profit take requested");
                    requested = true;
                }
                Err(StoreError::Duplicate { .. }) => {
                    debug!(position_id = %saved.id, "Profit take already pending");
                }
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(metrics) = close {
            self.closer.after_close(&saved, json!(metrics), &Actor::daemon()).await?;
            return Ok(Outcome::Closed);
        }

        Ok(Outcome::Adjusted { tightened: !tightened.is_empty() || expiry_tightened, requested })
    }

    /// Handle a position whose entry has not filled
    async fn recover_entry(&self, position: &Position, orders: &[Order], now: DateTime<Utc>) -> DaemonResult<Outcome> {
        let entries: Vec<&Order> = orders.iter().filter(|o| o.purpose == OrderPurpose::Entry).collect();

        if entries.iter().any(|o| !o.status.is_terminal()) {
            return Ok(Outcome::EntryPending);
        }
        if position.needs_review {
            return Ok(Outcome::AwaitingReview);
        }

        let last_activity = orders.iter().map(|o| o.updated_at).max().unwrap_or(position.opened_at);
        if now - last_activity < self.config.entry_grace {
            return Ok(Outcome::EntryPending);
        }

        let attempts = entries.len() as u32;
        if attempts >= self.config.max_entry_attempts {
            let mut flagged = position.clone();
            flagged.flag_for_review(now)?;
            self.store.positions().update(&flagged, position.version).await?;

            self.ledger
                .record(AuditRecord::new(
                    "POSITION_FLAGGED_FOR_REVIEW",
                    "position",
                    position.id,
                    json!({ "entry_attempts": attempts, "symbol": position.symbol }),
                ))
                .await?;
            warn!(position_id = %position.id, attempts, "Entry never filled, position flagged for review");
            return Ok(Outcome::FlaggedForReview);
        }

        let request = PlaceOrder {
            position_id: position.id,
            attempt: orders.len() as u32 + 1,
            purpose: OrderPurpose::Entry,
            symbol: position.symbol.clone(),
            side: position.side.entry_action(),
            quantity: position.quantity,
            limit_price: Some(position.entry_price),
        };
        info!(position_id = %position.id, attempt = request.attempt, "Re-placing unfilled entry");

        let order = self.tracker.place(request).await?;
        if !order.status.is_terminal() {
            let tracker = self.tracker.clone();
            tokio::spawn(async move {
                if let Err(e) = tracker.track(order).await {
                    warn!(error = %e, "Tracking re-placed entry failed");
                }
            });
        }
        Ok(Outcome::EntryReplaced)
    }
}

fn skip_cause(error: &DaemonError) -> &'static str {
    match error {
        DaemonError::NoMarketData(_) => "no_market_data",
        DaemonError::ConcurrencyConflict(_) => "conflict",
        DaemonError::Broker(_) => "broker",
        DaemonError::Persistence(_) => "persistence",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{harness, harness_with, open_trade, proposal, Harness};
    use crate::services::Services;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use warden_domain::{CapType, CloseReason, EntryPlan, PositionStatus, Quantity, RiskScope, Side, Symbol};
    use warden_eventlog::MemoryAuditSink;
    use warden_exec::{
        BrokerOrderAck, BrokerOrderReport, BrokerOrderRequest, ExecError, FillScript, StubBroker, StubFailure,
    };
    use warden_store::MemoryStore;

    /// Broker that rewrites one position while its price is being read,
    /// so the tick's conditional write loses
    struct RacingBroker {
        inner: StubBroker,
        store: Arc<MemoryStore>,
        race: std::sync::Mutex<Option<PositionId>>,
    }

    #[async_trait]
    impl BrokerPort for RacingBroker {
        async fn place_order(&self, request: &BrokerOrderRequest) -> Result<BrokerOrderAck, ExecError> {
            self.inner.place_order(request).await
        }

        async fn get_order(&self, broker_order_id: &str) -> Result<BrokerOrderReport, ExecError> {
            self.inner.get_order(broker_order_id).await
        }

        async fn cancel_order(&self, broker_order_id: &str) -> Result<(), ExecError> {
            self.inner.cancel_order(broker_order_id).await
        }

        async fn cancel_all_orders(&self) -> Result<usize, ExecError> {
            self.inner.cancel_all_orders().await
        }

        async fn liquidate_all_positions(&self) -> Result<usize, ExecError> {
            self.inner.liquidate_all_positions().await
        }

        async fn latest_price(&self, symbol: &Symbol) -> Result<Option<Price>, ExecError> {
            let target = self.race.lock().unwrap().take();
            if let Some(id) = target {
                let current = self.store.positions().find_by_id(id).await.unwrap().unwrap();
                self.store.positions().update(&current, current.version).await.unwrap();
            }
            self.inner.latest_price(symbol).await
        }
    }

    async fn actions_for(h: &Harness, entity_type: &str, id: impl ToString) -> Vec<String> {
        h.ledger
            .entries_for(entity_type, &id.to_string())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect()
    }

    #[tokio::test]
    async fn test_quiet_tick_changes_nothing() {
        let h = harness();
        let trade = open_trade(&h, "AAPL", Side::Long, dec!(100), dec!(95), dec!(110), dec!(10)).await;

        let report = h.services.reconciler.tick().await.unwrap();

        assert_eq!(report.closed_count, 0);
        assert!(!report.kill_switch_triggered);
        let position = h.store.positions().find_by_id(trade).await.unwrap().unwrap();
        assert!(position.is_open());
    }

    #[tokio::test]
    async fn test_stop_hit_closes_with_single_audit_entry() {
        let h = harness();
        let trade = open_trade(&h, "AAPL", Side::Long, dec!(100), dec!(95), dec!(110), dec!(10)).await;
        h.broker.set_price("AAPL", dec!(94));

        let report = h.services.reconciler.tick().await.unwrap();

        assert_eq!(report.closed_count, 1);
        let position = h.store.positions().find_by_id(trade).await.unwrap().unwrap();
        assert_eq!(position.status, PositionStatus::Closed);
        assert_eq!(position.close_reason, Some(CloseReason::Stop));
        assert_eq!(position.realized_pnl, Some(dec!(-60)));

        let closes: Vec<String> = actions_for(&h, "position", trade)
            .await
            .into_iter()
            .filter(|a| a == "POSITION_CLOSED")
            .collect();
        assert_eq!(closes.len(), 1);

        // Exit order flattens the filled entry
        let submitted = h.broker.submitted_orders();
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[1].side, warden_domain::OrderSide::Sell);
        assert_eq!(submitted[1].quantity.as_decimal(), dec!(10));

        // Closed positions are not evaluated again
        let again = h.services.reconciler.tick().await.unwrap();
        assert_eq!(again.closed_count, 0);
    }

    #[tokio::test]
    async fn test_missing_price_skips_only_that_position() {
        let h = harness();
        let aapl = open_trade(&h, "AAPL", Side::Long, dec!(100), dec!(95), dec!(110), dec!(10)).await;
        let msft = open_trade(&h, "MSFT", Side::Long, dec!(100), dec!(95), dec!(110), dec!(10)).await;
        h.broker.clear_price("AAPL");
        h.broker.set_price("MSFT", dec!(90));

        let report = h.services.reconciler.tick().await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.closed_count, 1);
        assert!(h.store.positions().find_by_id(aapl).await.unwrap().unwrap().is_open());
        assert!(!h.store.positions().find_by_id(msft).await.unwrap().unwrap().is_open());
        assert_eq!(h.services.metrics.skipped_positions.with_label_values(&["no_market_data"]).get(), 1);
    }

    #[tokio::test]
    async fn test_trailing_stop_ratchets_once_per_level() {
        let h = harness();
        let trade = open_trade(&h, "AAPL", Side::Long, dec!(100), dec!(90), dec!(130), dec!(10)).await;

        h.broker.set_price("AAPL", dec!(112));
        let report = h.services.reconciler.tick().await.unwrap();
        assert_eq!(report.stops_tightened, 1);

        let position = h.store.positions().find_by_id(trade).await.unwrap().unwrap();
        assert_eq!(position.stop.trail_level, dec!(1.0));
        assert_eq!(position.stop.current.as_decimal(), dec!(105));

        // Pulling back does not loosen the stop
        h.broker.set_price("AAPL", dec!(106));
        let report = h.services.reconciler.tick().await.unwrap();
        assert_eq!(report.stops_tightened, 0);
        let position = h.store.positions().find_by_id(trade).await.unwrap().unwrap();
        assert_eq!(position.stop.current.as_decimal(), dec!(105));

        let tightened: Vec<String> = actions_for(&h, "position", trade)
            .await
            .into_iter()
            .filter(|a| a == "STOP_TIGHTENED")
            .collect();
        assert_eq!(tightened.len(), 1);
    }

    #[tokio::test]
    async fn test_target_requests_profit_take_once() {
        let h = harness();
        let trade = open_trade(&h, "AAPL", Side::Long, dec!(100), dec!(95), dec!(110), dec!(10)).await;
        h.broker.set_price("AAPL", dec!(111));

        let first = h.services.reconciler.tick().await.unwrap();
        let second = h.services.reconciler.tick().await.unwrap();

        assert_eq!(first.profit_takes_requested, 1);
        assert_eq!(second.profit_takes_requested, 0);
        let pending = h.store.profit_takes().find_pending_for_position(trade).await.unwrap().unwrap();
        assert_eq!(pending.price.as_decimal(), dec!(111));
        assert!(h.store.positions().find_by_id(trade).await.unwrap().unwrap().is_open());
    }

    #[tokio::test]
    async fn test_lapsed_profit_take_expires_and_tightens() {
        let mut config = crate::Config::test();
        config.reconcile.profit_take_grace = std::time::Duration::ZERO;
        let h = harness_with(config, FillScript::Immediate);
        let trade = open_trade(&h, "AAPL", Side::Long, dec!(100), dec!(95), dec!(110), dec!(10)).await;
        h.broker.set_price("AAPL", dec!(111));

        h.services.reconciler.tick().await.unwrap();
        let request = h.store.profit_takes().find_pending_for_position(trade).await.unwrap().unwrap();

        // Still above target: the expired request is replaced after the step
        h.services.reconciler.tick().await.unwrap();

        let expired = h.store.profit_takes().find_by_id(request.id).await.unwrap().unwrap();
        assert_eq!(expired.status, ProfitTakeStatus::Expired);
        let position = h.store.positions().find_by_id(trade).await.unwrap().unwrap();
        assert_eq!(position.stop.trail_level, dec!(0.5));
        assert_eq!(position.stop.current.as_decimal(), dec!(100));
        assert_eq!(actions_for(&h, "profit_take", request.id).await, vec!["PROFIT_TAKE_REQUESTED", "PROFIT_TAKE_EXPIRED"]);
    }

    #[tokio::test]
    async fn test_percent_risk_limit_closes_with_risk() {
        let h = harness();
        let trade = open_trade(&h, "AAPL", Side::Long, dec!(100), dec!(95), dec!(110), dec!(10)).await;
        h.store
            .risk_limits()
            .insert(&RiskLimit::new(RiskScope::Trade, CapType::Pct, dec!(2)).unwrap())
            .await
            .unwrap();

        h.services.reconciler.tick().await.unwrap();

        let position = h.store.positions().find_by_id(trade).await.unwrap().unwrap();
        assert_eq!(position.close_reason, Some(CloseReason::Risk));
    }

    #[tokio::test]
    async fn test_group_breach_triggers_kill_switch() {
        let h = harness();
        open_trade(&h, "AAPL", Side::Long, dec!(100), dec!(95), dec!(110), dec!(10)).await;
        open_trade(&h, "MSFT", Side::Long, dec!(100), dec!(95), dec!(110), dec!(10)).await;
        h.store
            .risk_limits()
            .insert(&RiskLimit::new(RiskScope::Group, CapType::Usd, dec!(500)).unwrap().for_group("AAPL"))
            .await
            .unwrap();

        let report = h.services.reconciler.tick().await.unwrap();

        assert!(report.kill_switch_triggered);
        assert_eq!(report.kill_switch.as_ref().map(|k| k.positions_closed), Some(2));
        assert!(h.store.positions().find_open().await.unwrap().is_empty());

        let actions: Vec<String> = h.ledger.entries().await.unwrap().into_iter().map(|e| e.action).collect();
        let breach = actions.iter().position(|a| a == "PORTFOLIO_BREACH").unwrap();
        let kill = actions.iter().position(|a| a == "KILL_SWITCH").unwrap();
        assert!(breach < kill);
    }

    #[tokio::test]
    async fn test_unpriced_position_is_left_out_of_group_exposure() {
        let h = harness();
        let trade = open_trade(&h, "AAPL", Side::Long, dec!(100), dec!(95), dec!(110), dec!(10)).await;
        h.store
            .risk_limits()
            .insert(&RiskLimit::new(RiskScope::Group, CapType::Usd, dec!(900)).unwrap().for_group("AAPL"))
            .await
            .unwrap();
        h.broker.clear_price("AAPL");

        let report = h.services.reconciler.tick().await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.unpriced, vec![trade]);
        assert!(report.breach.is_none());
        assert!(!report.kill_switch_triggered);
        assert_eq!(h.store.positions().find_open().await.unwrap().len(), 1);
        assert_eq!(h.broker.liquidate_calls(), 0);

        // Once priced, the same book is over the limit
        h.broker.set_price("AAPL", dec!(100));
        let report = h.services.reconciler.tick().await.unwrap();
        assert!(report.unpriced.is_empty());
        assert!(report.kill_switch_triggered);
    }

    #[tokio::test]
    async fn test_unpriced_positions_still_count_toward_open_ceiling() {
        let mut config = crate::Config::test();
        config.reconcile.max_open_positions = 1;
        let h = harness_with(config, FillScript::Immediate);
        open_trade(&h, "AAPL", Side::Long, dec!(100), dec!(95), dec!(110), dec!(1)).await;

        // Second position inserted directly; approval would refuse it
        let plan = EntryPlan::new(
            Side::Long,
            Price::new(dec!(100)).unwrap(),
            Price::new(dec!(95)).unwrap(),
            Price::new(dec!(110)).unwrap(),
        )
        .unwrap();
        let extra = Position::open(
            Symbol::new("MSFT").unwrap(),
            Side::Long,
            Quantity::new(dec!(1)).unwrap(),
            &plan,
            None,
            Utc::now(),
        );
        h.store.positions().insert(&extra).await.unwrap();
        h.broker.clear_price("AAPL");

        let report = h.services.reconciler.tick().await.unwrap();

        assert!(matches!(report.breach, Some(Breach::OpenCount { count: 2, ceiling: 1 })));
        assert!(report.kill_switch_triggered);
    }

    #[tokio::test]
    async fn test_version_race_skips_position_without_audit() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(RacingBroker {
            inner: StubBroker::new(),
            store: store.clone(),
            race: std::sync::Mutex::new(None),
        });
        let services = Services::build(
            &crate::Config::test(),
            broker.clone(),
            store.clone(),
            Arc::new(MemoryAuditSink::new()),
            None,
        )
        .unwrap();

        broker.inner.set_price("AAPL", dec!(100));
        let opportunity = services.approvals.propose(proposal("AAPL"), &Actor::user(None)).await.unwrap();
        let trade = services
            .approvals
            .approve(opportunity.id, dec!(10), None, &Actor::user(None))
            .await
            .unwrap()
            .trade_id;

        broker.inner.set_price("AAPL", dec!(94));
        *broker.race.lock().unwrap() = Some(trade);
        let report = services.reconciler.tick().await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.closed_count, 0);
        assert!(store.positions().find_by_id(trade).await.unwrap().unwrap().is_open());
        assert_eq!(services.metrics.skipped_positions.with_label_values(&["conflict"]).get(), 1);

        let actions: Vec<String> = services
            .ledger
            .entries_for("position", &trade.to_string())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert!(!actions.iter().any(|a| a == "POSITION_CLOSED" || a == "STOP_TIGHTENED"));

        // Re-read on the next tick, the stop still applies
        let next = services.reconciler.tick().await.unwrap();
        assert_eq!(next.closed_count, 1);
    }

    #[tokio::test]
    async fn test_orphan_entry_is_replaced_then_flagged() {
        let mut config = crate::Config::test();
        config.reconcile.entry_grace = std::time::Duration::ZERO;
        config.reconcile.max_entry_attempts = 2;
        let h = harness_with(config, FillScript::Immediate);

        let plan = EntryPlan::new(
            Side::Long,
            Price::new(dec!(100)).unwrap(),
            Price::new(dec!(95)).unwrap(),
            Price::new(dec!(110)).unwrap(),
        )
        .unwrap();
        let position = Position::open(
            Symbol::new("AAPL").unwrap(),
            Side::Long,
            Quantity::new(dec!(3)).unwrap(),
            &plan,
            None,
            Utc::now(),
        );
        h.store.positions().insert(&position).await.unwrap();

        // Two rejected placements consume both attempts
        h.broker.fail_next(StubFailure::Rejected);
        let first = h.services.reconciler.tick().await.unwrap();
        assert_eq!(first.skipped, 1);

        h.broker.fail_next(StubFailure::Rejected);
        h.services.reconciler.tick().await.unwrap();
        assert_eq!(h.store.orders().find_by_position(position.id).await.unwrap().len(), 2);

        let third = h.services.reconciler.tick().await.unwrap();
        assert_eq!(third.flagged_for_review, 1);

        let flagged = h.store.positions().find_by_id(position.id).await.unwrap().unwrap();
        assert!(flagged.needs_review);
        assert!(flagged.is_open());
        assert!(actions_for(&h, "position", position.id).await.contains(&"POSITION_FLAGGED_FOR_REVIEW".to_string()));

        // Flagged positions are left alone
        let fourth = h.services.reconciler.tick().await.unwrap();
        assert_eq!(fourth.flagged_for_review, 0);
        assert_eq!(h.broker.place_calls(), 2);
    }

    #[tokio::test]
    async fn test_orphan_entry_replacement_fills_on_next_sync() {
        let mut config = crate::Config::test();
        config.reconcile.entry_grace = std::time::Duration::ZERO;
        let h = harness_with(config, FillScript::Immediate);
        h.broker.set_price("AAPL", dec!(100));

        let plan = EntryPlan::new(
            Side::Long,
            Price::new(dec!(100)).unwrap(),
            Price::new(dec!(95)).unwrap(),
            Price::new(dec!(110)).unwrap(),
        )
        .unwrap();
        let position = Position::open(
            Symbol::new("AAPL").unwrap(),
            Side::Long,
            Quantity::new(dec!(3)).unwrap(),
            &plan,
            None,
            Utc::now(),
        );
        h.store.positions().insert(&position).await.unwrap();

        let first = h.services.reconciler.tick().await.unwrap();
        assert_eq!(first.entries_replaced, 1);

        // Let the background tracker observe the fill
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        h.services.reconciler.tick().await.unwrap();

        let orders = h.store.orders().find_by_position(position.id).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert!(orders[0].is_filled());
        assert_eq!(h.broker.net_position("AAPL"), dec!(3));
    }
}
