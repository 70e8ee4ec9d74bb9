//! Portfolio PnL and open-position views.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::warn;

use warden_domain::risk::{daily_pnl, exposure_by_group, total_open_risk, weekly_pnl, ExposureLeg};
use warden_domain::{Position, PositionId, Price, Quantity, Side, StopState, Symbol};
use warden_exec::BrokerPort;
use warden_store::Store;

use crate::error::DaemonResult;

/// Realized and unrealized PnL across the book
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioReport {
    pub equity: Decimal,
    pub daily_realized_pnl: Decimal,
    pub weekly_realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_open_risk: Decimal,
    pub open_positions: usize,
    pub exposure_by_group: BTreeMap<String, Decimal>,
    /// Open positions with no current price; marked at entry
    pub unpriced_positions: Vec<PositionId>,
    pub as_of: DateTime<Utc>,
}

/// An open position with its current mark
#[derive(Debug, Clone, Serialize)]
pub struct OpenPositionView {
    pub id: PositionId,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Quantity,
    pub correlation_group: String,
    pub entry_price: Price,
    pub target: Price,
    pub stop: StopState,
    pub needs_review: bool,
    pub opened_at: DateTime<Utc>,
    pub last_price: Option<Price>,
    pub unrealized_pnl: Option<Decimal>,
    pub r_multiple: Option<Decimal>,
}

pub struct PortfolioService<B: BrokerPort, S: Store> {
    broker: Arc<B>,
    store: Arc<S>,
    equity: Decimal,
}

impl<B: BrokerPort, S: Store> PortfolioService<B, S> {
    pub fn new(broker: Arc<B>, store: Arc<S>, equity: Decimal) -> Self {
        Self { broker, store, equity }
    }

    pub async fn report(&self, now: DateTime<Utc>) -> DaemonResult<PortfolioReport> {
        let positions = self.store.positions().find_all().await?;
        let open: Vec<&Position> = positions.iter().filter(|p| p.is_open()).collect();

        let mut unrealized = Decimal::ZERO;
        let mut unpriced = Vec::new();
        let mut legs = Vec::with_capacity(open.len());
        for position in &open {
            let mark = match self.mark(position).await {
                Some(price) => {
                    unrealized += position.pnl_at(price);
                    price
                }
                None => {
                    unpriced.push(position.id);
                    position.entry_price
                }
            };
            legs.push(ExposureLeg::from_position(position, mark.as_decimal()));
        }

        Ok(PortfolioReport {
            equity: self.equity,
            daily_realized_pnl: daily_pnl(&positions, now),
            weekly_realized_pnl: weekly_pnl(&positions, now),
            unrealized_pnl: unrealized,
            total_open_risk: total_open_risk(open.iter().copied()),
            open_positions: open.len(),
            exposure_by_group: exposure_by_group(&legs),
            unpriced_positions: unpriced,
            as_of: now,
        })
    }

    pub async fn open_positions(&self) -> DaemonResult<Vec<OpenPositionView>> {
        let positions = self.store.positions().find_open().await?;
        let mut views = Vec::with_capacity(positions.len());

        for position in positions {
            let last_price = self.mark(&position).await;
            views.push(OpenPositionView {
                id: position.id,
                unrealized_pnl: last_price.map(|p| position.pnl_at(p)),
                r_multiple: last_price.map(|p| position.r_multiple(p)),
                last_price,
                symbol: position.symbol,
                side: position.side,
                quantity: position.quantity,
                correlation_group: position.correlation_group,
                entry_price: position.entry_price,
                target: position.target,
                stop: position.stop,
                needs_review: position.needs_review,
                opened_at: position.opened_at,
            });
        }
        Ok(views)
    }

    async fn mark(&self, position: &Position) -> Option<Price> {
        match self.broker.latest_price(&position.symbol).await {
            Ok(price) => price,
            Err(e) => {
                warn!(position_id = %position.id, error = %e, "Price lookup failed");
                None
            }
        }
    }
}
