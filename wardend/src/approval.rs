//! Opportunity approval.
//!
//! ```text
//! approve(id, qty, key)
//!   ├── key seen before? ──► return the trade it created (no side effects)
//!   ├── opportunity PENDING_APPROVAL? quantity within every risk cap?
//!   ├── PENDING_APPROVAL → APPROVED (conditional)
//!   ├── reserve idempotency key → insert OPEN position
//!   ├── audit OPPORTUNITY_APPROVED + POSITION_OPENED (with narrative)
//!   └── place entry order and track it until filled or canceled
//! ```
//!
//! Validation and risk failures happen before the first write. Approvals
//! are serialized from the cap check through the position insert, so two
//! concurrent approvals cannot both spend the same daily or weekly budget.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use warden_domain::risk::{day_bounds, risk_opened_between, size_by_volatility, size_with_caps, week_bounds};
use warden_domain::{
    EntryPlan, IdempotencyRecord, Opportunity, OpportunityId, OpportunityStatus, OrderPurpose,
    OrderStatus, Position, PositionId, Price, Quantity, RiskCaps, RiskLimit, Side, Symbol,
};
use warden_engine::{trade_pct_limit, trade_usd_limit};
use warden_eventlog::{AuditLedger, AuditRecord};
use warden_exec::{
    fallback_narrative, narrate_or_fallback, BrokerPort, NarrativeContext, NarrativePort,
    OrderTracker, PlaceOrder, RetryPolicy,
};
use warden_store::Store;

use crate::actor::Actor;
use crate::error::{DaemonError, DaemonResult};

/// Sizing and narrative settings
#[derive(Debug, Clone)]
pub struct ApprovalConfig {
    pub equity: Decimal,
    pub caps: RiskCaps,
    pub max_open_positions: usize,
    pub narrative_retry: RetryPolicy,
}

/// A proposed trade
#[derive(Debug, Clone, Deserialize)]
pub struct ProposeOpportunity {
    pub symbol: String,
    pub side: Side,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    pub entry: Decimal,
    pub stop: Decimal,
    pub target: Decimal,
    #[serde(default)]
    pub correlation_group: Option<String>,
}

fn default_timeframe() -> String {
    "1D".to_string()
}

/// Result of an approval
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalOutcome {
    pub trade_id: PositionId,
    /// True when the idempotency key had already been used
    pub replayed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_order_status: Option<OrderStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narrative: Option<String>,
}

/// Largest quantity the caps allow, and the cap that binds
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SizingLimit {
    pub allowed: Decimal,
    pub binding_cap: &'static str,
}

pub struct ApprovalService<B: BrokerPort, S: Store> {
    store: Arc<S>,
    ledger: AuditLedger,
    tracker: Arc<OrderTracker<B, S>>,
    narrator: Option<Arc<dyn NarrativePort>>,
    config: ApprovalConfig,
    sizing_lock: Mutex<()>,
}

impl<B: BrokerPort, S: Store> ApprovalService<B, S> {
    pub fn new(
        store: Arc<S>,
        ledger: AuditLedger,
        tracker: Arc<OrderTracker<B, S>>,
        narrator: Option<Arc<dyn NarrativePort>>,
        config: ApprovalConfig,
    ) -> Self {
        Self { store, ledger, tracker, narrator, config, sizing_lock: Mutex::new(()) }
    }

    /// Record a new opportunity awaiting approval
    pub async fn propose(&self, proposal: ProposeOpportunity, actor: &Actor) -> DaemonResult<Opportunity> {
        let symbol = Symbol::new(&proposal.symbol)?;
        let plan = EntryPlan::new(
            proposal.side,
            Price::new(proposal.entry)?,
            Price::new(proposal.stop)?,
            Price::new(proposal.target)?,
        )?;
        if proposal.timeframe.trim().is_empty() {
            return Err(DaemonError::Validation("timeframe must not be empty".into()));
        }

        let mut opportunity = Opportunity::new(symbol, proposal.side, proposal.timeframe, plan);
        if let Some(group) = proposal.correlation_group.filter(|g| !g.trim().is_empty()) {
            opportunity = opportunity.with_correlation_group(group);
        }
        self.store.opportunities().insert(&opportunity).await?;

        self.ledger
            .record(actor.stamp(AuditRecord::new(
                "OPPORTUNITY_CREATED",
                "opportunity",
                opportunity.id,
                json!({
                    "symbol": opportunity.symbol,
                    "side": opportunity.side,
                    "timeframe": opportunity.timeframe,
                    "plan": opportunity.plan,
                    "correlation_group": opportunity.correlation_group,
                }),
            )))
            .await?;

        info!(opportunity_id = %opportunity.id, symbol = %opportunity.symbol, "Opportunity proposed");
        Ok(opportunity)
    }

    /// Approve an opportunity and open a trade of `quantity`
    pub async fn approve(
        &self,
        opportunity_id: OpportunityId,
        quantity: Decimal,
        idempotency_key: Option<&str>,
        actor: &Actor,
    ) -> DaemonResult<ApprovalOutcome> {
        if let Some(key) = idempotency_key {
            if key.trim().is_empty() {
                return Err(DaemonError::Validation("idempotency key must not be empty".into()));
            }
            if let Some(record) = self.store.idempotency().find(key).await? {
                info!(idempotency_key = key, trade_id = %record.entity_id, "Approval replayed");
                return Ok(ApprovalOutcome {
                    trade_id: record.entity_id,
                    replayed: true,
                    entry_order_status: None,
                    narrative: None,
                });
            }
        }

        let sizing_guard = self.sizing_lock.lock().await;

        let opportunity = self
            .store
            .opportunities()
            .find_by_id(opportunity_id)
            .await?
            .ok_or_else(|| DaemonError::not_found("opportunity", opportunity_id))?;
        if !opportunity.is_pending() {
            return Err(DaemonError::Validation(format!(
                "opportunity {} is {:?}, not pending approval",
                opportunity_id, opportunity.status
            )));
        }
        let quantity = Quantity::new(quantity)?;

        let now = Utc::now();
        let limits = self.store.risk_limits().find_active().await?;
        let positions = self.store.positions().find_all().await?;
        self.check_risk(&opportunity, quantity, &limits, &positions, now)?;

        let mut position = Position::open(
            opportunity.symbol.clone(),
            opportunity.side,
            quantity,
            &opportunity.plan,
            opportunity.correlation_group.clone(),
            now,
        );
        position.opportunity_id = Some(opportunity.id);

        self.store
            .opportunities()
            .transition(opportunity.id, OpportunityStatus::PendingApproval, OpportunityStatus::Approved, None, now)
            .await?;

        if let Some(key) = idempotency_key {
            let record = IdempotencyRecord { key: key.to_string(), entity_id: position.id, created_at: now };
            if let Some(existing) = self.store.idempotency().put_if_absent(&record).await? {
                return Err(DaemonError::ConcurrencyConflict(format!(
                    "idempotency key {} already used for {}",
                    key, existing.entity_id
                )));
            }
        }
        self.store.positions().insert(&position).await?;
        drop(sizing_guard);

        let narrative = self.narrative(&opportunity, quantity).await;

        self.ledger
            .record(actor.stamp(AuditRecord::new(
                "OPPORTUNITY_APPROVED",
                "opportunity",
                opportunity.id,
                json!({ "trade_id": position.id, "quantity": quantity }),
            )))
            .await?;
        self.ledger
            .record(actor.stamp(AuditRecord::new(
                "POSITION_OPENED",
                "position",
                position.id,
                json!({
                    "opportunity_id": opportunity.id,
                    "symbol": position.symbol,
                    "side": position.side,
                    "quantity": position.quantity,
                    "entry": position.entry_price,
                    "stop": position.stop.current,
                    "target": position.target,
                    "correlation_group": position.correlation_group,
                    "narrative": narrative,
                }),
            )))
            .await?;

        info!(
            trade_id = %position.id,
            opportunity_id = %opportunity.id,
            symbol = %position.symbol,
            quantity = %quantity,
            "Opportunity approved, position opened"
        );

        let entry = PlaceOrder {
            position_id: position.id,
            attempt: 1,
            purpose: OrderPurpose::Entry,
            symbol: position.symbol.clone(),
            side: position.side.entry_action(),
            quantity,
            limit_price: Some(opportunity.plan.entry),
        };
        let order = self.tracker.place_and_track(entry).await.map_err(|e| {
            warn!(trade_id = %position.id, error = %e, "Entry order failed; position left for recovery");
            DaemonError::from(e)
        })?;

        Ok(ApprovalOutcome {
            trade_id: position.id,
            replayed: false,
            entry_order_status: Some(order.status),
            narrative: Some(narrative),
        })
    }

    /// Reject a pending opportunity
    pub async fn reject(&self, opportunity_id: OpportunityId, reason: &str, actor: &Actor) -> DaemonResult<Opportunity> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(DaemonError::Validation("rejection reason must not be empty".into()));
        }

        let opportunity = self
            .store
            .opportunities()
            .find_by_id(opportunity_id)
            .await?
            .ok_or_else(|| DaemonError::not_found("opportunity", opportunity_id))?;
        if !opportunity.is_pending() {
            return Err(DaemonError::Validation(format!(
                "opportunity {} is {:?}, not pending approval",
                opportunity_id, opportunity.status
            )));
        }

        let rejected = self
            .store
            .opportunities()
            .transition(
                opportunity_id,
                OpportunityStatus::PendingApproval,
                OpportunityStatus::Rejected,
                Some(reason.to_string()),
                Utc::now(),
            )
            .await?;

        self.ledger
            .record(actor.stamp(AuditRecord::new(
                "OPPORTUNITY_REJECTED",
                "opportunity",
                opportunity_id,
                json!({ "reason": reason }),
            )))
            .await?;

        info!(%opportunity_id, reason, "Opportunity rejected");
        Ok(rejected)
    }

    /// Quantity the caps allow for an opportunity right now
    pub fn sizing_limit(
        &self,
        plan: &EntryPlan,
        limits: &[RiskLimit],
        positions: &[Position],
        now: DateTime<Utc>,
    ) -> SizingLimit {
        let equity = self.config.equity;
        let caps = &self.config.caps;
        let per_unit_risk = plan.per_unit_risk();

        let (day_start, day_end) = day_bounds(now);
        let (week_start, week_end) = week_bounds(now);
        let day_used = risk_opened_between(positions, day_start, day_end);
        let week_used = risk_opened_between(positions, week_start, week_end);

        let mut candidates = vec![
            ("per_trade", size_by_volatility(equity, per_unit_risk, caps.per_trade_pct)),
            ("daily", size_by_volatility(equity * caps.daily_pct - day_used, per_unit_risk, Decimal::ONE)),
            ("weekly", size_by_volatility(equity * caps.weekly_pct - week_used, per_unit_risk, Decimal::ONE)),
        ];
        if let Some(usd) = trade_usd_limit(limits) {
            candidates.push(("trade_usd", size_by_volatility(usd, per_unit_risk, Decimal::ONE)));
        }

        let combined = size_with_caps(equity, per_unit_risk, day_used, week_used, caps);
        let (binding_cap, allowed) = candidates
            .into_iter()
            .min_by_key(|(_, units)| *units)
            .unwrap_or(("per_trade", combined));

        SizingLimit { allowed: allowed.min(combined).max(Decimal::ZERO), binding_cap }
    }

    fn check_risk(
        &self,
        opportunity: &Opportunity,
        quantity: Quantity,
        limits: &[RiskLimit],
        positions: &[Position],
        now: DateTime<Utc>,
    ) -> DaemonResult<()> {
        let requested = quantity.as_decimal();

        let open = positions.iter().filter(|p| p.is_open()).count();
        if open >= self.config.max_open_positions {
            return Err(DaemonError::RiskLimitExceeded {
                cap: "max_open_positions".into(),
                requested,
                allowed: Decimal::ZERO,
            });
        }

        if let Some(limit) = trade_pct_limit(limits) {
            let entry = opportunity.plan.entry.as_decimal();
            let distance_pct = opportunity
                .plan
                .per_unit_risk()
                .checked_div(entry)
                .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
                .unwrap_or(Decimal::MAX);
            if distance_pct > limit {
                return Err(DaemonError::RiskLimitExceeded {
                    cap: "trade_pct".into(),
                    requested,
                    allowed: Decimal::ZERO,
                });
            }
        }

        let sizing = self.sizing_limit(&opportunity.plan, limits, positions, now);
        if requested > sizing.allowed {
            return Err(DaemonError::RiskLimitExceeded {
                cap: sizing.binding_cap.to_string(),
                requested,
                allowed: sizing.allowed,
            });
        }
        Ok(())
    }

    async fn narrative(&self, opportunity: &Opportunity, quantity: Quantity) -> String {
        let context = NarrativeContext {
            symbol: opportunity.symbol.clone(),
            side: opportunity.side,
            timeframe: opportunity.timeframe.clone(),
            entry: opportunity.plan.entry,
            stop: opportunity.plan.stop,
            target: opportunity.plan.target,
            quantity,
        };
        match &self.narrator {
            Some(narrator) => narrate_or_fallback(narrator.as_ref(), &context, &self.config.narrative_retry).await,
            None => fallback_narrative(&context),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{harness, proposal};
    use rust_decimal_macros::dec;
    use warden_domain::{CapType, PositionStatus, RiskScope};
    use warden_exec::StubFailure;

    #[tokio::test]
    async fn test_approve_opens_position_and_fills_entry() {
        let h = harness();
        h.broker.set_price("AAPL", dec!(100));
        let opportunity = h.services.approvals.propose(proposal("AAPL"), &Actor::user(None)).await.unwrap();

        let outcome = h
            .services
            .approvals
            .approve(opportunity.id, dec!(10), Some("key-1"), &Actor::user(Some("alice".into())))
            .await
            .unwrap();

        assert!(!outcome.replayed);
        assert_eq!(outcome.entry_order_status, Some(OrderStatus::Filled));

        let position = h.store.positions().find_by_id(outcome.trade_id).await.unwrap().unwrap();
        assert_eq!(position.status, PositionStatus::Open);
        assert_eq!(position.opportunity_id, Some(opportunity.id));
        assert_eq!(position.quantity.as_decimal(), dec!(10));

        let opportunity = h.store.opportunities().find_by_id(opportunity.id).await.unwrap().unwrap();
        assert_eq!(opportunity.status, OpportunityStatus::Approved);

        let actions: Vec<String> = h.ledger.entries().await.unwrap().into_iter().map(|e| e.action).collect();
        assert!(actions.contains(&"OPPORTUNITY_APPROVED".to_string()));
        assert!(actions.contains(&"POSITION_OPENED".to_string()));
        assert!(actions.contains(&"ORDER_FILL".to_string()));
    }

    #[tokio::test]
    async fn test_same_key_returns_same_trade_without_new_order() {
        let h = harness();
        h.broker.set_price("AAPL", dec!(100));
        let opportunity = h.services.approvals.propose(proposal("AAPL"), &Actor::user(None)).await.unwrap();

        let first = h.services.approvals.approve(opportunity.id, dec!(5), Some("k"), &Actor::user(None)).await.unwrap();
        let second = h.services.approvals.approve(opportunity.id, dec!(5), Some("k"), &Actor::user(None)).await.unwrap();

        assert_eq!(first.trade_id, second.trade_id);
        assert!(second.replayed);
        assert_eq!(h.broker.place_calls(), 1);
        assert_eq!(h.store.position_count(), 1);
    }

    #[tokio::test]
    async fn test_quantity_over_cap_has_no_side_effects() {
        let h = harness();
        let opportunity = h.services.approvals.propose(proposal("AAPL"), &Actor::user(None)).await.unwrap();
        let audit_before = h.ledger.entries().await.unwrap().len();

        // 100_000 × 1% / 5 per unit = 200
        let err = h
            .services
            .approvals
            .approve(opportunity.id, dec!(201), Some("k"), &Actor::user(None))
            .await
            .unwrap_err();

        match err {
            DaemonError::RiskLimitExceeded { cap, allowed, .. } => {
                assert_eq!(cap, "per_trade");
                assert_eq!(allowed, dec!(200));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(h.store.position_count(), 0);
        assert_eq!(h.store.order_count(), 0);
        assert!(h.store.idempotency().find("k").await.unwrap().is_none());
        assert_eq!(h.ledger.entries().await.unwrap().len(), audit_before);
        let opportunity = h.store.opportunities().find_by_id(opportunity.id).await.unwrap().unwrap();
        assert!(opportunity.is_pending());
    }

    #[tokio::test]
    async fn test_trade_usd_limit_caps_quantity() {
        let h = harness();
        h.store
            .risk_limits()
            .insert(&RiskLimit::new(RiskScope::Trade, CapType::Usd, dec!(250)).unwrap())
            .await
            .unwrap();
        let opportunity = h.services.approvals.propose(proposal("AAPL"), &Actor::user(None)).await.unwrap();

        let err = h.services.approvals.approve(opportunity.id, dec!(51), None, &Actor::user(None)).await.unwrap_err();

        assert!(matches!(
            err,
            DaemonError::RiskLimitExceeded { ref cap, allowed, .. } if cap == "trade_usd" && allowed == dec!(50)
        ));
    }

    #[tokio::test]
    async fn test_daily_budget_counts_earlier_trades() {
        let h = harness();
        h.broker.set_price("AAPL", dec!(100));
        h.broker.set_price("MSFT", dec!(100));

        let first = h.services.approvals.propose(proposal("AAPL"), &Actor::user(None)).await.unwrap();
        h.services.approvals.approve(first.id, dec!(200), None, &Actor::user(None)).await.unwrap();

        // 2% daily budget = 2000, 1000 already used → 200 units left at 5 per unit
        let second = h.services.approvals.propose(proposal("MSFT"), &Actor::user(None)).await.unwrap();
        let positions = h.store.positions().find_all().await.unwrap();
        let sizing = h.services.approvals.sizing_limit(&second.plan, &[], &positions, Utc::now());
        assert_eq!(sizing.allowed, dec!(200));

        h.services.approvals.approve(second.id, dec!(200), None, &Actor::user(None)).await.unwrap();

        let third = h.services.approvals.propose(proposal("NVDA"), &Actor::user(None)).await.unwrap();
        let err = h.services.approvals.approve(third.id, dec!(1), None, &Actor::user(None)).await.unwrap_err();
        assert!(matches!(err, DaemonError::RiskLimitExceeded { ref cap, .. } if cap == "daily"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_approvals_share_one_daily_budget() {
        let h = harness();
        for symbol in ["AAPL", "MSFT", "NVDA"] {
            h.broker.set_price(symbol, dec!(100));
        }
        let actor = Actor::user(None);

        // 1000 of the 2000 daily budget spent
        let first = h.services.approvals.propose(proposal("AAPL"), &actor).await.unwrap();
        h.services.approvals.approve(first.id, dec!(200), None, &actor).await.unwrap();

        let a = h.services.approvals.propose(proposal("MSFT"), &actor).await.unwrap();
        let b = h.services.approvals.propose(proposal("NVDA"), &actor).await.unwrap();
        let (ra, rb) = tokio::join!(
            h.services.approvals.approve(a.id, dec!(200), None, &actor),
            h.services.approvals.approve(b.id, dec!(200), None, &actor),
        );

        let results = [ra, rb];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(DaemonError::RiskLimitExceeded { cap, .. }) if cap == "daily")));

        let positions = h.store.positions().find_all().await.unwrap();
        assert_eq!(positions.len(), 2);
        let risk: Decimal = positions.iter().map(|p| p.initial_risk()).sum();
        assert_eq!(risk, dec!(2000));
    }

    #[tokio::test]
    async fn test_out_of_range_prices_are_validation_errors() {
        let h = harness();
        let mut huge = proposal("AAPL");
        huge.entry = dec!(50000000000000000000000000000);
        huge.stop = dec!(49999999999999999999999999999);
        huge.target = dec!(60000000000000000000000000000);

        let err = h.services.approvals.propose(huge, &Actor::user(None)).await.unwrap_err();
        assert!(matches!(err, DaemonError::Validation(_)));
        assert!(h.ledger.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_largest_prices_approve_and_reconcile() {
        let h = harness();
        h.broker.set_price("BRK.A", dec!(999999999999));
        let short = ProposeOpportunity {
            side: Side::Short,
            entry: dec!(999999999999),
            stop: Price::MAX,
            target: dec!(999999999998),
            ..proposal("BRK.A")
        };
        let opportunity = h.services.approvals.propose(short, &Actor::user(None)).await.unwrap();

        let outcome = h.services.approvals.approve(opportunity.id, dec!(2), None, &Actor::user(None)).await.unwrap();
        assert_eq!(outcome.entry_order_status, Some(OrderStatus::Filled));

        let report = h.services.reconciler.tick().await.unwrap();
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.skipped, 0);
    }

    #[tokio::test]
    async fn test_reject_requires_pending() {
        let h = harness();
        let opportunity = h.services.approvals.propose(proposal("AAPL"), &Actor::user(None)).await.unwrap();

        let rejected = h
            .services
            .approvals
            .reject(opportunity.id, "spread too wide", &Actor::user(None))
            .await
            .unwrap();
        assert_eq!(rejected.status, OpportunityStatus::Rejected);
        assert_eq!(rejected.rejection_reason.as_deref(), Some("spread too wide"));

        let again = h.services.approvals.reject(opportunity.id, "again", &Actor::user(None)).await;
        assert!(matches!(again, Err(DaemonError::Validation(_))));

        let approve = h.services.approvals.approve(opportunity.id, dec!(1), None, &Actor::user(None)).await;
        assert!(matches!(approve, Err(DaemonError::Validation(_))));
    }

    #[tokio::test]
    async fn test_unknown_opportunity_is_not_found() {
        let h = harness();
        let err = h
            .services
            .approvals
            .approve(uuid::Uuid::now_v7(), dec!(1), None, &Actor::user(None))
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_broker_failure_surfaces_and_position_stays_open() {
        let h = harness();
        let opportunity = h.services.approvals.propose(proposal("AAPL"), &Actor::user(None)).await.unwrap();
        h.broker.fail_next(StubFailure::Rejected);

        let err = h
            .services
            .approvals
            .approve(opportunity.id, dec!(1), Some("k-fail"), &Actor::user(None))
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::Broker(_)));

        let open = h.store.positions().find_open().await.unwrap();
        assert_eq!(open.len(), 1);

        // A retry with the same key finds the trade instead of opening another
        let replay = h
            .services
            .approvals
            .approve(opportunity.id, dec!(1), Some("k-fail"), &Actor::user(None))
            .await
            .unwrap();
        assert!(replay.replayed);
        assert_eq!(replay.trade_id, open[0].id);
    }
}
