//! Warden Engine Layer
//!
//! Pure decision logic, deterministic, no I/O.
//! Takes a position snapshot and a price → Returns actions to execute.
//!
//! The reconciler feeds one open position at a time through
//! [`Engine::evaluate`] and applies the returned actions in order, then
//! feeds the surviving open book through [`Engine::check_portfolio`].

#![warn(clippy::all)]

mod error;
mod portfolio;
mod reconcile;

pub use error::{EngineError, EngineResult};
pub use portfolio::{trade_pct_limit, trade_usd_limit, Breach, OpenLeg};
pub use reconcile::{CloseMetrics, Decision, EngineAction, EngineConfig, PositionSnapshot};

use warden_domain::RiskLimit;

/// Reconciliation decision engine
#[derive(Debug, Clone, Default)]
pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    /// Create an engine with the given configuration
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Decide what to do with one open position at the observed price
    pub fn evaluate(&self, snapshot: &PositionSnapshot<'_>, limits: &[RiskLimit]) -> EngineResult<Decision> {
        reconcile::evaluate(&self.config, snapshot, limits)
    }

    /// Check the open-count ceiling against `open_count` and group exposure
    /// limits against the marked `legs`
    pub fn check_portfolio(
        &self,
        open_count: usize,
        legs: &[OpenLeg],
        limits: &[RiskLimit],
        equity: rust_decimal::Decimal,
    ) -> Option<Breach> {
        portfolio::check(open_count, legs, limits, equity, self.config.max_open_positions)
    }
}
