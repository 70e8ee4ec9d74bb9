//! Per-position reconciliation decision
//!
//! Precedence for an OPEN position, evaluated at one observed price:
//!
//! ```text
//! 1. expired PENDING profit-take  → mark EXPIRED, tighten one step, continue
//! 2. stop distance > TRADE/PCT    → close RISK
//! 3. stop crossed                 → close STOP
//! 4. target reached               → request profit take (if none pending), no trailing
//! 5. unrealized loss ≤ -R × qty   → close MAX_LOSS
//! 6. held longer than the TTL     → close TTL
//! 7. otherwise                    → tighten trail if a new level was reached
//! ```

use crate::error::{EngineError, EngineResult};
use crate::portfolio::trade_pct_limit;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;
use warden_domain::trailing::{self, TrailUpdate};
use warden_domain::{
    CloseReason, Position, Price, ProfitTakeId, ProfitTakeRequest, ProfitTakeStatus, RiskLimit,
};

/// Engine tunables
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Positions held longer than this are closed with TTL
    pub holding_ttl: Duration,
    /// Lifetime of a profit-take request before it expires
    pub profit_take_grace: Duration,
    /// Open-position ceiling; exceeding it is a portfolio breach
    pub max_open_positions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            holding_ttl: Duration::hours(24),
            profit_take_grace: Duration::seconds(60),
            max_open_positions: 20,
        }
    }
}

/// What the engine sees for one position
#[derive(Debug, Clone, Copy)]
pub struct PositionSnapshot<'a> {
    pub position: &'a Position,
    pub price: Price,
    pub now: DateTime<Utc>,
    pub pending_request: Option<&'a ProfitTakeRequest>,
}

/// Numbers recorded alongside a close
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloseMetrics {
    pub price: Decimal,
    pub entry: Decimal,
    pub stop: Decimal,
    pub target: Decimal,
    pub r_multiple: Decimal,
    pub pnl: Decimal,
    pub trail_level: Decimal,
    pub held_secs: i64,
}

impl CloseMetrics {
    fn capture(position: &Position, price: Price, now: DateTime<Utc>) -> Self {
        Self {
            price: price.as_decimal(),
            entry: position.entry_price.as_decimal(),
            stop: position.stop.current.as_decimal(),
            target: position.target.as_decimal(),
            r_multiple: position.r_multiple(price),
            pnl: position.pnl_at(price),
            trail_level: position.stop.trail_level,
            held_secs: (now - position.opened_at).num_seconds(),
        }
    }
}

/// A state change the reconciler must persist
#[derive(Debug, Clone, PartialEq)]
pub enum EngineAction {
    /// Lapsed profit-take request; `tighten` is the one-step fallback
    ExpireProfitTake { request_id: ProfitTakeId, tighten: Option<TrailUpdate> },
    /// Close the position
    Close { reason: CloseReason, exit_price: Price, metrics: CloseMetrics },
    /// Ask an operator whether to take profit
    RequestProfitTake { price: Price, expires_at: DateTime<Utc> },
    /// Ratchet the stop
    Tighten(TrailUpdate),
}

/// Ordered list of actions for one position
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decision {
    pub actions: Vec<EngineAction>,
}

impl Decision {
    /// Close reason, if the decision closes the position
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.actions.iter().find_map(|a| match a {
            EngineAction::Close { reason, .. } => Some(*reason),
            _ => None,
        })
    }

    /// Nothing to do this tick
    pub fn is_noop(&self) -> bool {
        self.actions.is_empty()
    }

    fn close(mut self, reason: CloseReason, working: &Position, price: Price, now: DateTime<Utc>) -> Self {
        // A closing position never needs a profit-take request
        self.actions.retain(|a| !matches!(a, EngineAction::RequestProfitTake { .. }));
        self.actions.push(EngineAction::Close {
            reason,
            exit_price: price,
            metrics: CloseMetrics::capture(working, price, now),
        });
        self
    }
}

pub(crate) fn evaluate(
    config: &EngineConfig,
    snapshot: &PositionSnapshot<'_>,
    limits: &[RiskLimit],
) -> EngineResult<Decision> {
    let PositionSnapshot { position, price, now, pending_request } = *snapshot;

    if !position.is_open() {
        return Err(EngineError::PositionNotOpen(position.id));
    }

    let mut pending = pending_request.filter(|r| r.status == ProfitTakeStatus::Pending);
    if let Some(request) = pending {
        if request.position_id != position.id {
            return Err(EngineError::ForeignRequest(position.id));
        }
    }

    let mut working = position.clone();
    let mut decision = Decision::default();

    // 1. Lapsed profit-take → one-step tightening fallback
    if let Some(request) = pending.filter(|r| r.is_expired(now)) {
        let tighten = trailing::step_once(
            working.side,
            working.entry_price,
            working.stop.initial,
            working.stop.current,
            working.stop.trail_level,
        );
        if let Some(update) = tighten {
            working.tighten_stop(update.level, update.stop, now)?;
        }
        decision.actions.push(EngineAction::ExpireProfitTake { request_id: request.id, tighten });
        pending = None;
    }

    // 2. RISK
    if let Some(limit) = trade_pct_limit(limits) {
        if working.stop_distance_pct() > limit {
            debug!(position_id = %position.id, %limit, "Stop distance exceeds percent risk limit");
            return Ok(decision.close(CloseReason::Risk, &working, price, now));
        }
    }

    // 3. STOP
    if trailing::is_stop_hit(working.side, price, working.stop.current) {
        return Ok(decision.close(CloseReason::Stop, &working, price, now));
    }

    // 4. TARGET
    let target_hit = trailing::is_target_hit(working.side, price, working.target);
    if target_hit && pending.is_none() {
        decision.actions.push(EngineAction::RequestProfitTake {
            price,
            expires_at: now + config.profit_take_grace,
        });
    }

    // 5. MAX_LOSS
    let r = working.risk_unit();
    if !r.is_zero() && working.pnl_at(price) <= -(r * working.quantity.as_decimal()) {
        return Ok(decision.close(CloseReason::MaxLoss, &working, price, now));
    }

    // 6. TTL
    if working.is_older_than(config.holding_ttl, now) {
        return Ok(decision.close(CloseReason::Ttl, &working, price, now));
    }

    // 7. Trail
    if !target_hit {
        let update = trailing::evaluate_trail(
            working.side,
            working.entry_price,
            working.stop.initial,
            working.stop.current,
            working.stop.trail_level,
            price,
        );
        if let Some(update) = update {
            decision.actions.push(EngineAction::Tighten(update));
        }
    }

    Ok(decision)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Engine;
    use rust_decimal_macros::dec;
    use warden_domain::{CapType, EntryPlan, Quantity, RiskScope, Side, Symbol};

    fn p(v: Decimal) -> Price {
        Price::new(v).unwrap()
    }

    fn open_position(side: Side, entry: Decimal, stop: Decimal, target: Decimal) -> Position {
        let plan = EntryPlan::new(side, p(entry), p(stop), p(target)).unwrap();
        Position::open(Symbol::new("MSFT").unwrap(), side, Quantity::new(dec!(10)).unwrap(), &plan, None, Utc::now())
    }

    fn decide(position: &Position, price: Decimal, request: Option<&ProfitTakeRequest>, limits: &[RiskLimit]) -> Decision {
        let snapshot = PositionSnapshot { position, price: p(price), now: Utc::now(), pending_request: request };
        Engine::default().evaluate(&snapshot, limits).unwrap()
    }

    #[test]
    fn test_quiet_price_is_noop() {
        let position = open_position(Side::Long, dec!(100), dec!(90), dec!(130));
        assert!(decide(&position, dec!(102), None, &[]).is_noop());
    }

    #[test]
    fn test_stop_hit_closes_with_stop() {
        let position = open_position(Side::Long, dec!(100), dec!(90), dec!(130));
        let decision = decide(&position, dec!(89.5), None, &[]);
        assert_eq!(decision.close_reason(), Some(CloseReason::Stop));

        let short = open_position(Side::Short, dec!(100), dec!(110), dec!(80));
        assert_eq!(decide(&short, dec!(110), None, &[]).close_reason(), Some(CloseReason::Stop));
    }

    #[test]
    fn test_risk_limit_precedes_stop() {
        let position = open_position(Side::Long, dec!(100), dec!(90), dec!(130));
        let limits = vec![RiskLimit::new(RiskScope::Trade, CapType::Pct, dec!(5)).unwrap()];
        // Stop also hit, but RISK wins
        let decision = decide(&position, dec!(85), None, &limits);
        assert_eq!(decision.close_reason(), Some(CloseReason::Risk));
    }

    #[test]
    fn test_target_requests_profit_take_without_trailing() {
        let position = open_position(Side::Long, dec!(100), dec!(90), dec!(120));
        let decision = decide(&position, dec!(125), None, &[]);

        assert_eq!(decision.actions.len(), 1);
        assert!(matches!(decision.actions[0], EngineAction::RequestProfitTake { .. }));
        assert!(decision.close_reason().is_none());
    }

    #[test]
    fn test_target_with_pending_request_does_nothing() {
        let position = open_position(Side::Long, dec!(100), dec!(90), dec!(120));
        let request = ProfitTakeRequest::new(position.id, p(dec!(121)), Utc::now(), Duration::seconds(60));
        assert!(decide(&position, dec!(125), Some(&request), &[]).is_noop());
    }

    #[test]
    fn test_expired_request_tightens_one_step_then_requests_again() {
        let position = open_position(Side::Long, dec!(100), dec!(90), dec!(120));
        let created = Utc::now() - Duration::seconds(120);
        let request = ProfitTakeRequest::new(position.id, p(dec!(121)), created, Duration::seconds(60));

        let decision = decide(&position, dec!(121), Some(&request), &[]);
        match &decision.actions[0] {
            EngineAction::ExpireProfitTake { request_id, tighten } => {
                assert_eq!(*request_id, request.id);
                let update = tighten.unwrap();
                assert_eq!(update.level, dec!(0.5));
                assert_eq!(update.stop, p(dec!(100)));
            },
            other => panic!("unexpected action {:?}", other),
        }
        assert!(matches!(decision.actions[1], EngineAction::RequestProfitTake { .. }));
    }

    #[test]
    fn test_expiry_tightening_can_trigger_stop() {
        let mut position = open_position(Side::Long, dec!(100), dec!(90), dec!(130));
        position.tighten_stop(dec!(1.0), p(dec!(105)), Utc::now()).unwrap();
        let created = Utc::now() - Duration::seconds(90);
        let request = ProfitTakeRequest::new(position.id, p(dec!(130)), created, Duration::seconds(60));

        // One more step puts the stop at 110; price 108 is below it
        let decision = decide(&position, dec!(108), Some(&request), &[]);
        assert_eq!(decision.close_reason(), Some(CloseReason::Stop));
        match decision.actions.last() {
            Some(EngineAction::Close { metrics, .. }) => assert_eq!(metrics.stop, dec!(110)),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_ttl_closes_old_position() {
        let mut position = open_position(Side::Long, dec!(100), dec!(90), dec!(130));
        position.opened_at = Utc::now() - Duration::hours(25);
        assert_eq!(decide(&position, dec!(101), None, &[]).close_reason(), Some(CloseReason::Ttl));
    }

    #[test]
    fn test_ttl_close_drops_profit_take_request() {
        let mut position = open_position(Side::Long, dec!(100), dec!(90), dec!(120));
        position.opened_at = Utc::now() - Duration::hours(30);
        let decision = decide(&position, dec!(125), None, &[]);
        assert_eq!(decision.actions.len(), 1);
        assert_eq!(decision.close_reason(), Some(CloseReason::Ttl));
    }

    #[test]
    fn test_max_loss_after_fill_moved_entry() {
        let mut position = open_position(Side::Long, dec!(100), dec!(90), dec!(130));
        // Filled higher than planned: R = 20 but stop stays at 90
        position.entry_price = p(dec!(110));
        position.stop.current = p(dec!(85));
        let decision = decide(&position, dec!(89), None, &[]);
        assert_eq!(decision.close_reason(), Some(CloseReason::MaxLoss));
    }

    #[test]
    fn test_new_level_tightens() {
        let position = open_position(Side::Short, dec!(100), dec!(110), dec!(70));
        let decision = decide(&position, dec!(84), None, &[]);
        assert_eq!(
            decision.actions,
            vec![EngineAction::Tighten(TrailUpdate { level: dec!(1.5), stop: p(dec!(90)) })]
        );
    }

    #[test]
    fn test_closed_position_is_rejected() {
        let mut position = open_position(Side::Long, dec!(100), dec!(90), dec!(130));
        position.close(CloseReason::Manual, None, Utc::now()).unwrap();
        let snapshot = PositionSnapshot { position: &position, price: p(dec!(100)), now: Utc::now(), pending_request: None };
        assert!(Engine::default().evaluate(&snapshot, &[]).is_err());
    }
}
