//! Risk Sizing and Portfolio Metrics (Pure Functions)
//!
//! Position sizing under per-trade, daily and weekly risk budgets, plus the
//! aggregate metrics the reconciler and the portfolio report rely on.
//!
//! # Sizing Rule
//!
//! ```text
//! base   = floor(equity × per_trade% / per_unit_risk)
//! day    = floor(max(equity × day% − day_used, 0) / per_unit_risk)
//! week   = floor(max(equity × week% − week_used, 0) / per_unit_risk)
//! cap    = max(0, min(base, day, week))
//! ```
//!
//! The cap is the only gate for approval: a request above it is rejected.

use crate::entities::Position;
use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Sizing
// =============================================================================

/// Risk budget fractions used by [`size_with_caps`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskCaps {
    /// Max fraction of equity risked on one trade (0.01 = 1%)
    pub per_trade_pct: Decimal,
    /// Max fraction of equity risked on trades opened in one UTC day
    pub daily_pct: Decimal,
    /// Max fraction of equity risked on trades opened in one UTC week
    pub weekly_pct: Decimal,
}

impl Default for RiskCaps {
    fn default() -> Self {
        Self {
            per_trade_pct: Decimal::new(1, 2),
            daily_pct: Decimal::new(2, 2),
            weekly_pct: Decimal::new(5, 2),
        }
    }
}

/// Quantity allowed when risking `max_risk_pct` of `equity`
///
/// ```text
/// size = floor(equity × max_risk_pct / per_unit_risk), clamped at 0
/// ```
///
/// Returns 0 when `per_unit_risk` is not positive.
///
/// # Example
///
/// ```
/// # use warden_domain::risk::size_by_volatility;
/// # use rust_decimal_macros::dec;
/// assert_eq!(size_by_volatility(dec!(100000), dec!(2), dec!(0.01)), dec!(500));
/// assert_eq!(size_by_volatility(dec!(100000), dec!(0), dec!(0.01)), dec!(0));
/// ```
pub fn size_by_volatility(equity: Decimal, per_unit_risk: Decimal, max_risk_pct: Decimal) -> Decimal {
    budget_to_units(equity * max_risk_pct, per_unit_risk)
}

/// Maximum allowed quantity under the per-trade, daily and weekly caps
///
/// # Example
///
/// ```
/// # use warden_domain::risk::{size_with_caps, RiskCaps};
/// # use rust_decimal_macros::dec;
/// let caps = RiskCaps::default();
/// assert_eq!(size_with_caps(dec!(100000), dec!(2), dec!(0), dec!(0), &caps), dec!(500));
/// assert_eq!(size_with_caps(dec!(100000), dec!(2), dec!(1900), dec!(0), &caps), dec!(50));
/// ```
pub fn size_with_caps(
    equity: Decimal,
    per_unit_risk: Decimal,
    day_risk_used: Decimal,
    week_risk_used: Decimal,
    caps: &RiskCaps,
) -> Decimal {
    let base = size_by_volatility(equity, per_unit_risk, caps.per_trade_pct);
    let day = budget_to_units(equity * caps.daily_pct - day_risk_used, per_unit_risk);
    let week = budget_to_units(equity * caps.weekly_pct - week_risk_used, per_unit_risk);

    base.min(day).min(week).max(Decimal::ZERO)
}

fn budget_to_units(budget: Decimal, per_unit_risk: Decimal) -> Decimal {
    if per_unit_risk <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    budget
        .max(Decimal::ZERO)
        .checked_div(per_unit_risk)
        .map_or(Decimal::MAX, |units| units.floor())
}

// =============================================================================
// Exposure
// =============================================================================

/// One position's contribution to group exposure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposureLeg {
    /// Correlation group
    pub group: String,
    /// Quantity, negative for shorts
    pub signed_quantity: Decimal,
    /// Mark price
    pub price: Decimal,
}

impl ExposureLeg {
    /// Build a leg for an open position marked at `price`
    pub fn from_position(position: &Position, price: Decimal) -> Self {
        Self {
            group: position.correlation_group.clone(),
            signed_quantity: position.side.sign() * position.quantity.as_decimal(),
            price,
        }
    }
}

/// Signed notional exposure per correlation group
///
/// # Example
///
/// ```
/// # use warden_domain::risk::{exposure_by_group, ExposureLeg};
/// # use rust_decimal_macros::dec;
/// let legs = vec![
///     ExposureLeg { group: "FX".into(), signed_quantity: dec!(10), price: dec!(1.10) },
///     ExposureLeg { group: "FX".into(), signed_quantity: dec!(-5), price: dec!(1.10) },
/// ];
/// let exposure = exposure_by_group(&legs);
/// assert_eq!(exposure["FX"], dec!(5.5));
/// ```
pub fn exposure_by_group(legs: &[ExposureLeg]) -> BTreeMap<String, Decimal> {
    let mut exposure = BTreeMap::new();
    for leg in legs {
        *exposure.entry(leg.group.clone()).or_insert(Decimal::ZERO) += leg.signed_quantity * leg.price;
    }
    exposure
}

/// Sum of money lost if every open position hit its current stop
pub fn total_open_risk<'a>(positions: impl IntoIterator<Item = &'a Position>) -> Decimal {
    positions.into_iter().filter(|p| p.is_open()).map(Position::open_risk).sum()
}

/// Sum of initial risk of positions opened in `[start, end)`
///
/// Used as the "risk already used" input of [`size_with_caps`].
pub fn risk_opened_between<'a>(
    positions: impl IntoIterator<Item = &'a Position>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Decimal {
    positions
        .into_iter()
        .filter(|p| p.opened_at >= start && p.opened_at < end)
        .map(Position::initial_risk)
        .sum()
}

// =============================================================================
// PnL windows
// =============================================================================

/// UTC calendar day containing `reference`: `[00:00, next 00:00)`
pub fn day_bounds(reference: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc.from_utc_datetime(&reference.date_naive().and_time(NaiveTime::MIN));
    (start, start + Duration::days(1))
}

/// UTC week containing `reference`, starting Sunday 00:00
pub fn week_bounds(reference: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let (day_start, _) = day_bounds(reference);
    let days_since_sunday = i64::from(reference.weekday().num_days_from_sunday());
    let start = day_start - Duration::days(days_since_sunday);
    (start, start + Duration::days(7))
}

/// Realized PnL of positions closed in the UTC day of `reference`
pub fn daily_pnl<'a>(positions: impl IntoIterator<Item = &'a Position>, reference: DateTime<Utc>) -> Decimal {
    let (start, end) = day_bounds(reference);
    realized_between(positions, start, end)
}

/// Realized PnL of positions closed in the UTC week (Sunday start) of `reference`
pub fn weekly_pnl<'a>(positions: impl IntoIterator<Item = &'a Position>, reference: DateTime<Utc>) -> Decimal {
    let (start, end) = week_bounds(reference);
    realized_between(positions, start, end)
}

fn realized_between<'a>(
    positions: impl IntoIterator<Item = &'a Position>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Decimal {
    positions
        .into_iter()
        .filter(|p| p.closed_at.is_some_and(|at| at >= start && at < end))
        .filter_map(|p| p.realized_pnl)
        .sum()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::CloseReason;
    use crate::value_objects::{EntryPlan, Price, Quantity, Side, Symbol};
    use rust_decimal_macros::dec;

    fn position(side: Side, entry: Decimal, stop: Decimal, target: Decimal, qty: Decimal) -> Position {
        let plan = EntryPlan::new(
            side,
            Price::new(entry).unwrap(),
            Price::new(stop).unwrap(),
            Price::new(target).unwrap(),
        )
        .unwrap();
        Position::open(
            Symbol::new("EUR/USD").unwrap(),
            side,
            Quantity::new(qty).unwrap(),
            &plan,
            Some("FX".to_string()),
            Utc::now(),
        )
    }

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_size_with_caps_weekly_binds() {
        let caps = RiskCaps::default();
        // week budget 5000 - 4990 = 10 → 5 units
        assert_eq!(size_with_caps(dec!(100000), dec!(2), dec!(0), dec!(4990), &caps), dec!(5));
    }

    #[test]
    fn test_size_with_caps_exhausted_budget_is_zero() {
        let caps = RiskCaps::default();
        assert_eq!(size_with_caps(dec!(100000), dec!(2), dec!(2500), dec!(0), &caps), dec!(0));
        assert_eq!(size_with_caps(dec!(100000), dec!(-1), dec!(0), dec!(0), &caps), dec!(0));
    }

    #[test]
    fn test_size_floors_fractional_units() {
        assert_eq!(size_by_volatility(dec!(10000), dec!(3), dec!(0.01)), dec!(33));
    }

    #[test]
    fn test_exposure_nets_long_and_short() {
        let long = position(Side::Long, dec!(1.10), dec!(1.05), dec!(1.20), dec!(10));
        let short = position(Side::Short, dec!(1.10), dec!(1.15), dec!(1.00), dec!(5));
        let legs = vec![
            ExposureLeg::from_position(&long, dec!(1.10)),
            ExposureLeg::from_position(&short, dec!(1.10)),
        ];
        assert_eq!(exposure_by_group(&legs)["FX"], dec!(5.5));
    }

    #[test]
    fn test_total_open_risk_ignores_protected_positions() {
        let at_risk = position(Side::Long, dec!(100), dec!(95), dec!(120), dec!(2));
        let mut protected = position(Side::Short, dec!(100), dec!(105), dec!(80), dec!(3));
        protected.tighten_stop(dec!(1), Price::new(dec!(97.5)).unwrap(), Utc::now()).unwrap();

        assert_eq!(total_open_risk([&at_risk, &protected]), dec!(10));
    }

    #[test]
    fn test_week_starts_sunday_utc() {
        let (start, end) = week_bounds(at("2024-03-13T15:30:00Z")); // Wednesday
        assert_eq!(start, at("2024-03-10T00:00:00Z"));
        assert_eq!(end, at("2024-03-17T00:00:00Z"));

        let (start, _) = week_bounds(at("2024-03-10T00:00:00Z")); // Sunday midnight
        assert_eq!(start, at("2024-03-10T00:00:00Z"));
    }

    #[test]
    fn test_daily_and_weekly_pnl_windows() {
        let mut today = position(Side::Long, dec!(100), dec!(90), dec!(120), dec!(1));
        today.close(CloseReason::Stop, Some(Price::new(dec!(90)).unwrap()), at("2024-03-13T01:00:00Z")).unwrap();

        let mut monday = position(Side::Long, dec!(100), dec!(90), dec!(120), dec!(1));
        monday.close(CloseReason::Manual, Some(Price::new(dec!(130)).unwrap()), at("2024-03-11T12:00:00Z")).unwrap();

        let mut last_week = position(Side::Long, dec!(100), dec!(90), dec!(120), dec!(1));
        last_week.close(CloseReason::Manual, Some(Price::new(dec!(150)).unwrap()), at("2024-03-09T23:59:59Z")).unwrap();

        let open = position(Side::Long, dec!(100), dec!(90), dec!(120), dec!(1));

        let all = [&today, &monday, &last_week, &open];
        let reference = at("2024-03-13T18:00:00Z");
        assert_eq!(daily_pnl(all, reference), dec!(-10));
        assert_eq!(weekly_pnl(all, reference), dec!(20));
    }

    #[test]
    fn test_risk_opened_between_window() {
        let mut inside = position(Side::Long, dec!(100), dec!(98), dec!(110), dec!(5));
        inside.opened_at = at("2024-03-13T09:00:00Z");
        let mut outside = position(Side::Long, dec!(100), dec!(98), dec!(110), dec!(5));
        outside.opened_at = at("2024-03-12T09:00:00Z");

        let (start, end) = day_bounds(at("2024-03-13T18:00:00Z"));
        assert_eq!(risk_opened_between([&inside, &outside], start, end), dec!(10));
    }

    #[test]
    fn test_sizing_with_vanishing_risk_does_not_overflow() {
        let tiny = dec!(0.0000000000000000000000000001);
        assert_eq!(size_by_volatility(dec!(100000), tiny, dec!(0.01)), Decimal::MAX);

        let caps = RiskCaps::default();
        assert_eq!(size_with_caps(dec!(100000), tiny, dec!(0), dec!(0), &caps), Decimal::MAX);
    }
}
