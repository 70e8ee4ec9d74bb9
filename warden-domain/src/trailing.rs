//! Trailing Stop Logic (Pure Functions)
//!
//! This module contains pure functions for the R-stepped trailing stop.
//! All functions are deterministic and have no side effects.
//!
//! # Trailing Stop Algorithm (0.5R ratchet)
//!
//! R is the distance between entry and the initial stop. As the unrealized
//! gain crosses each half-R boundary the trail level ratchets up, and the
//! stop is placed half an R behind the level:
//!
//! ```text
//! level  = floor(r_multiple / 0.5) * 0.5
//! move   = max(0, level - 0.5) * R
//! LONG:  stop = entry + move
//! SHORT: stop = entry - move
//! ```
//!
//! Key invariants:
//! - Trail level is monotonic (never decreases)
//! - Stop is monotonic (never moves against the position)

use crate::value_objects::{Price, Side};
use rust_decimal::Decimal;

/// Size of one trail step, in R (0.5)
pub const TRAIL_STEP: Decimal = Decimal::from_parts(5, 0, 0, false, 1);

/// Initial risk per unit: `|entry - initial_stop|`
pub fn risk_unit(entry: Price, initial_stop: Price) -> Decimal {
    (entry.as_decimal() - initial_stop.as_decimal()).abs()
}

/// Unrealized gain at `price` as a multiple of R
///
/// Returns zero when R is zero (entry equals the initial stop).
///
/// # Examples
///
/// ```
/// # use warden_domain::trailing::r_multiple;
/// # use warden_domain::value_objects::{Price, Side};
/// # use rust_decimal_macros::dec;
/// let p = |v| Price::new(v).unwrap();
/// assert_eq!(r_multiple(Side::Long, p(dec!(100)), p(dec!(90)), p(dec!(112))), dec!(1.2));
/// assert_eq!(r_multiple(Side::Short, p(dec!(100)), p(dec!(110)), p(dec!(95))), dec!(0.5));
/// ```
pub fn r_multiple(side: Side, entry: Price, initial_stop: Price, price: Price) -> Decimal {
    let r = risk_unit(entry, initial_stop);
    if r.is_zero() {
        return Decimal::ZERO;
    }
    let gain = side.sign() * (price.as_decimal() - entry.as_decimal());
    // Saturates for a vanishing R
    gain.checked_div(r).unwrap_or(if gain.is_sign_negative() { Decimal::MIN } else { Decimal::MAX })
}

/// Next trail level reached by `r`, if it is above `last_level`
///
/// # Examples
///
/// ```
/// # use warden_domain::trailing::next_trail_level;
/// # use rust_decimal_macros::dec;
/// assert_eq!(next_trail_level(dec!(1.2), dec!(0)), Some(dec!(1.0)));
/// assert_eq!(next_trail_level(dec!(0.3), dec!(0)), None);
/// assert_eq!(next_trail_level(dec!(1.4), dec!(1.0)), None);
/// ```
pub fn next_trail_level(r: Decimal, last_level: Decimal) -> Option<Decimal> {
    let level = r.checked_div(TRAIL_STEP)?.floor() * TRAIL_STEP;
    if level > last_level {
        Some(level)
    } else {
        None
    }
}

/// Whether the stop should be tightened for gain `r`
pub fn should_tighten(r: Decimal, last_level: Decimal) -> bool {
    next_trail_level(r, last_level).is_some()
}

/// Stop price for a trail level
///
/// The stop lags the level by one step: level 0.5 puts the stop at entry
/// (break-even), level 1.0 at entry + 0.5R, and so on.
///
/// Returns `None` when the computed price is not positive (a SHORT trailed
/// far enough to cross zero).
///
/// # Examples
///
/// ```
/// # use warden_domain::trailing::trail_stop;
/// # use warden_domain::value_objects::{Price, Side};
/// # use rust_decimal_macros::dec;
/// let p = |v| Price::new(v).unwrap();
/// assert_eq!(trail_stop(p(dec!(100)), p(dec!(90)), dec!(1.0), Side::Long), Some(p(dec!(105))));
/// assert_eq!(trail_stop(p(dec!(100)), p(dec!(110)), dec!(1.0), Side::Short), Some(p(dec!(95))));
/// ```
pub fn trail_stop(entry: Price, initial_stop: Price, level: Decimal, side: Side) -> Option<Price> {
    let r = risk_unit(entry, initial_stop);
    let step_back = (level - TRAIL_STEP).max(Decimal::ZERO);
    let stop = entry.as_decimal() + side.sign() * step_back * r;
    Price::new(stop).ok()
}

/// Check if the stop has been hit
///
/// - LONG: exit when price <= stop
/// - SHORT: exit when price >= stop
pub fn is_stop_hit(side: Side, price: Price, stop: Price) -> bool {
    match side {
        Side::Long => price <= stop,
        Side::Short => price >= stop,
    }
}

/// Check if the profit target has been reached
///
/// - LONG: price >= target
/// - SHORT: price <= target
pub fn is_target_hit(side: Side, price: Price, target: Price) -> bool {
    match side {
        Side::Long => price >= target,
        Side::Short => price <= target,
    }
}

/// A computed stop tightening
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailUpdate {
    /// New trail level
    pub level: Decimal,
    /// Stop price for that level
    pub stop: Price,
}

/// Compute the tightening for a price observation, if any
///
/// Combines [`r_multiple`], [`next_trail_level`] and [`trail_stop`], and
/// discards candidates that would loosen `current_stop`.
pub fn evaluate_trail(
    side: Side,
    entry: Price,
    initial_stop: Price,
    current_stop: Price,
    last_level: Decimal,
    price: Price,
) -> Option<TrailUpdate> {
    let r = r_multiple(side, entry, initial_stop, price);
    let level = next_trail_level(r, last_level)?;
    step_to(side, entry, initial_stop, current_stop, level)
}

/// Tighten by exactly one step above `last_level`, regardless of price
///
/// Used when a profit-take request lapses without a decision.
pub fn step_once(
    side: Side,
    entry: Price,
    initial_stop: Price,
    current_stop: Price,
    last_level: Decimal,
) -> Option<TrailUpdate> {
    if risk_unit(entry, initial_stop).is_zero() {
        return None;
    }
    step_to(side, entry, initial_stop, current_stop, last_level + TRAIL_STEP)
}

fn step_to(
    side: Side,
    entry: Price,
    initial_stop: Price,
    current_stop: Price,
    level: Decimal,
) -> Option<TrailUpdate> {
    let stop = trail_stop(entry, initial_stop, level, side)?;
    let improves = match side {
        Side::Long => stop >= current_stop,
        Side::Short => stop <= current_stop,
    };
    improves.then_some(TrailUpdate { level, stop })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn p(v: Decimal) -> Price {
        Price::new(v).unwrap()
    }

    #[test]
    fn test_half_constant() {
        assert_eq!(TRAIL_STEP, dec!(0.5));
    }

    #[test]
    fn test_r_multiple_zero_risk() {
        assert_eq!(r_multiple(Side::Long, p(dec!(100)), p(dec!(100)), p(dec!(150))), dec!(0));
    }

    #[test]
    fn test_next_trail_level_steps() {
        assert_eq!(next_trail_level(dec!(0.5), dec!(0)), Some(dec!(0.5)));
        assert_eq!(next_trail_level(dec!(0.99), dec!(0.5)), None);
        assert_eq!(next_trail_level(dec!(2.7), dec!(1.0)), Some(dec!(2.5)));
        assert_eq!(next_trail_level(dec!(-1.3), dec!(0)), None);
    }

    #[test]
    fn test_trail_stop_break_even_at_first_step() {
        assert_eq!(trail_stop(p(dec!(100)), p(dec!(90)), dec!(0.5), Side::Long), Some(p(dec!(100))));
        assert_eq!(trail_stop(p(dec!(100)), p(dec!(90)), dec!(0), Side::Long), Some(p(dec!(100))));
    }

    #[test]
    fn test_long_trailing_stop_moves_up_on_new_high() {
        let update = evaluate_trail(Side::Long, p(dec!(100)), p(dec!(90)), p(dec!(90)), dec!(0), p(dec!(121)))
            .unwrap();
        assert_eq!(update.level, dec!(2.0));
        assert_eq!(update.stop, p(dec!(115)));
    }

    #[test]
    fn test_short_trailing_stop_moves_down_on_new_low() {
        let update = evaluate_trail(Side::Short, p(dec!(100)), p(dec!(110)), p(dec!(110)), dec!(0), p(dec!(89)))
            .unwrap();
        assert_eq!(update.level, dec!(1.0));
        assert_eq!(update.stop, p(dec!(95)));
    }

    #[test]
    fn test_trail_never_loosens_over_price_path() {
        let entry = p(dec!(50));
        let initial = p(dec!(48));
        let mut stop = initial;
        let mut level = dec!(0);

        let path = [dec!(51), dec!(53.1), dec!(52), dec!(49), dec!(55.4), dec!(54), dec!(56.2), dec!(47)];
        for price in path {
            if let Some(update) = evaluate_trail(Side::Long, entry, initial, stop, level, p(price)) {
                assert!(update.level > level);
                assert!(update.stop >= stop);
                level = update.level;
                stop = update.stop;
            }
        }

        // Best price 56.2 → r = 3.1 → level 3.0 → stop = 50 + 2.5*2
        assert_eq!(level, dec!(3.0));
        assert_eq!(stop, p(dec!(55)));
    }

    #[test]
    fn test_step_once_advances_one_increment() {
        let update = step_once(Side::Long, p(dec!(100)), p(dec!(90)), p(dec!(100)), dec!(0.5)).unwrap();
        assert_eq!(update.level, dec!(1.0));
        assert_eq!(update.stop, p(dec!(105)));

        assert!(step_once(Side::Long, p(dec!(100)), p(dec!(100)), p(dec!(100)), dec!(0)).is_none());
    }

    #[test]
    fn test_stop_and_target_hits() {
        assert!(is_stop_hit(Side::Long, p(dec!(90)), p(dec!(90))));
        assert!(!is_stop_hit(Side::Long, p(dec!(90.01)), p(dec!(90))));
        assert!(is_stop_hit(Side::Short, p(dec!(110)), p(dec!(110))));
        assert!(is_target_hit(Side::Long, p(dec!(120)), p(dec!(120))));
        assert!(is_target_hit(Side::Short, p(dec!(79)), p(dec!(80))));
        assert!(!is_target_hit(Side::Short, p(dec!(81)), p(dec!(80))));
    }

    #[test]
    fn test_vanishing_risk_saturates_instead_of_overflowing() {
        let entry = p(dec!(1));
        let stop = p(dec!(0.999999999999999999999999999));
        let r = r_multiple(Side::Long, entry, stop, p(dec!(1000000000000)));

        assert_eq!(r, Decimal::MAX);
        assert_eq!(next_trail_level(r, dec!(0)), None);
        assert_eq!(r_multiple(Side::Short, entry, stop, p(dec!(1000000000000))), Decimal::MIN);
    }
}
