//! Portfolio-level breach detection

use rust_decimal::Decimal;
use serde::Serialize;
use warden_domain::risk::{exposure_by_group, ExposureLeg};
use warden_domain::{CapType, RiskLimit, RiskScope};

/// An open position marked at its latest price
pub type OpenLeg = ExposureLeg;

/// Portfolio limit that was exceeded
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Breach {
    /// Too many open positions
    OpenCount { count: usize, ceiling: usize },
    /// A correlation group is over its exposure limit
    GroupExposure { group: String, exposure: Decimal, limit: Decimal },
}

/// Tightest active TRADE/PCT limit, if any
pub fn trade_pct_limit(limits: &[RiskLimit]) -> Option<Decimal> {
    tightest(limits, CapType::Pct)
}

/// Tightest active TRADE/USD limit, if any
pub fn trade_usd_limit(limits: &[RiskLimit]) -> Option<Decimal> {
    tightest(limits, CapType::Usd)
}

fn tightest(limits: &[RiskLimit], cap_type: CapType) -> Option<Decimal> {
    limits
        .iter()
        .filter(|l| l.active && l.scope == RiskScope::Trade && l.cap_type == cap_type)
        .map(|l| l.value)
        .min()
}

/// `open_count` covers every open position; `legs` only the ones with a
/// mark this tick.
pub(crate) fn check(
    open_count: usize,
    legs: &[OpenLeg],
    limits: &[RiskLimit],
    equity: Decimal,
    max_open_positions: usize,
) -> Option<Breach> {
    if open_count > max_open_positions {
        return Some(Breach::OpenCount { count: open_count, ceiling: max_open_positions });
    }

    for (group, exposure) in exposure_by_group(legs) {
        let breached = limits
            .iter()
            .filter(|l| l.applies_to_group(&group))
            .map(|l| l.usd_value(equity))
            .find(|limit| exposure.abs() > *limit);

        if let Some(limit) = breached {
            return Some(Breach::GroupExposure { group, exposure, limit });
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn leg(group: &str, qty: Decimal, price: Decimal) -> OpenLeg {
        ExposureLeg { group: group.to_string(), signed_quantity: qty, price }
    }

    #[test]
    fn test_open_count_ceiling() {
        let legs = vec![leg("A", dec!(1), dec!(10)), leg("B", dec!(1), dec!(10)), leg("C", dec!(1), dec!(10))];
        assert_eq!(check(legs.len(), &legs, &[], dec!(100000), 3), None);
        assert_eq!(check(legs.len(), &legs, &[], dec!(100000), 2), Some(Breach::OpenCount { count: 3, ceiling: 2 }));
    }

    #[test]
    fn test_unmarked_positions_count_toward_ceiling_only() {
        let limits = vec![RiskLimit::new(RiskScope::Group, CapType::Usd, dec!(900)).unwrap()];
        let legs = vec![leg("MSFT", dec!(1), dec!(100))];

        assert_eq!(check(3, &legs, &limits, dec!(100000), 3), None);
        assert_eq!(check(4, &legs, &limits, dec!(100000), 3), Some(Breach::OpenCount { count: 4, ceiling: 3 }));
    }

    #[test]
    fn test_group_exposure_uses_absolute_value() {
        let limits = vec![RiskLimit::new(RiskScope::Group, CapType::Usd, dec!(1000)).unwrap()];
        let legs = vec![leg("TECH", dec!(-20), dec!(60))];

        assert_eq!(
            check(legs.len(), &legs, &limits, dec!(100000), 10),
            Some(Breach::GroupExposure { group: "TECH".into(), exposure: dec!(-1200), limit: dec!(1000) })
        );
    }

    #[test]
    fn test_hedged_group_stays_within_limit() {
        let limits = vec![RiskLimit::new(RiskScope::Group, CapType::Pct, dec!(1)).unwrap().for_group("FX")];
        let legs = vec![leg("FX", dec!(1000), dec!(1.1)), leg("FX", dec!(-500), dec!(1.1))];
        // |550| <= 1% of 100000
        assert_eq!(check(legs.len(), &legs, &limits, dec!(100000), 10), None);
    }

    #[test]
    fn test_inactive_and_foreign_limits_ignored() {
        let mut inactive = RiskLimit::new(RiskScope::Group, CapType::Usd, dec!(1)).unwrap();
        inactive.active = false;
        let other_group = RiskLimit::new(RiskScope::Group, CapType::Usd, dec!(1)).unwrap().for_group("FX");
        let legs = vec![leg("TECH", dec!(10), dec!(100))];
        assert_eq!(check(legs.len(), &legs, &[inactive, other_group], dec!(100000), 10), None);
    }

    #[test]
    fn test_tightest_trade_limits() {
        let limits = vec![
            RiskLimit::new(RiskScope::Trade, CapType::Pct, dec!(3)).unwrap(),
            RiskLimit::new(RiskScope::Trade, CapType::Pct, dec!(2)).unwrap(),
            RiskLimit::new(RiskScope::Trade, CapType::Usd, dec!(750)).unwrap(),
            RiskLimit::new(RiskScope::Group, CapType::Pct, dec!(1)).unwrap(),
        ];
        assert_eq!(trade_pct_limit(&limits), Some(dec!(2)));
        assert_eq!(trade_usd_limit(&limits), Some(dec!(750)));
        assert_eq!(trade_pct_limit(&[]), None);
    }
}
