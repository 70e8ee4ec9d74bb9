//! Execution layer port definitions.
//!
//! Ports define the interfaces for external services (broker, narrative
//! generator). Adapters implement these ports for specific services
//! (Alpaca, stub, etc.).

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use warden_domain::{Order, OrderSide, OrderType, Price, Quantity, Side, Symbol};

use crate::error::ExecError;

// =============================================================================
// Broker Port
// =============================================================================

/// Port for broker operations.
///
/// Implementations:
/// - `StubBroker` - For testing (scripted fills, injected failures)
/// - `AlpacaClient` - Alpaca paper/live REST API
#[async_trait]
pub trait BrokerPort: Send + Sync {
    /// Submit an order. The client order id makes resubmission safe.
    async fn place_order(&self, request: &BrokerOrderRequest) -> Result<BrokerOrderAck, ExecError>;

    /// Current cumulative state of a broker order.
    async fn get_order(&self, broker_order_id: &str) -> Result<BrokerOrderReport, ExecError>;

    /// Cancel one order.
    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), ExecError>;

    /// Cancel every open order on the account. Returns how many were canceled.
    async fn cancel_all_orders(&self) -> Result<usize, ExecError>;

    /// Market-close every position on the account. Returns how many were closed.
    async fn liquidate_all_positions(&self) -> Result<usize, ExecError>;

    /// Latest trade price, `None` when the broker has no data for the symbol.
    async fn latest_price(&self, symbol: &Symbol) -> Result<Option<Price>, ExecError>;
}

/// Order as sent to the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrderRequest {
    pub client_order_id: String,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Quantity,
    pub limit_price: Option<Price>,
    /// Always "day"
    pub time_in_force: String,
}

impl BrokerOrderRequest {
    /// Request for a locally recorded order
    pub fn for_order(order: &Order) -> Self {
        Self {
            client_order_id: order.client_order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            quantity: order.quantity,
            limit_price: order.limit_price,
            time_in_force: "day".to_string(),
        }
    }
}

/// Broker-side order state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerOrderStatus {
    /// Accepted, nothing filled
    New,
    /// Some quantity filled
    PartiallyFilled,
    /// Completely filled
    Filled,
    /// Canceled by us or the broker
    Canceled,
    /// Refused after acceptance
    Rejected,
    /// Time in force ran out
    Expired,
}

impl BrokerOrderStatus {
    /// Will never fill further
    pub fn is_dead(&self) -> bool {
        matches!(self, Self::Canceled | Self::Rejected | Self::Expired)
    }
}

/// Broker acknowledgement of a submitted order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrderAck {
    pub broker_order_id: String,
    pub client_order_id: String,
    pub status: BrokerOrderStatus,
    /// Raw broker response body
    pub raw: serde_json::Value,
}

/// Cumulative fill state reported by the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrderReport {
    pub broker_order_id: String,
    pub status: BrokerOrderStatus,
    /// Total filled so far (not the increment)
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Price>,
    pub raw: serde_json::Value,
}

// =============================================================================
// Narrative Port
// =============================================================================

/// Facts handed to the narrative generator for an approved trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrativeContext {
    pub symbol: Symbol,
    pub side: Side,
    pub timeframe: String,
    pub entry: Price,
    pub stop: Price,
    pub target: Price,
    pub quantity: Quantity,
}

/// Port for the external text generator that explains a trade.
///
/// Callers never depend on it succeeding; see `narrative::narrate_or_fallback`.
#[async_trait]
pub trait NarrativePort: Send + Sync {
    /// Produce a short human-readable rationale.
    async fn narrate(&self, context: &NarrativeContext) -> Result<String, ExecError>;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;
    use warden_domain::OrderPurpose;

    #[test]
    fn test_request_for_market_order() {
        let order = Order::new(
            Uuid::now_v7(),
            1,
            OrderPurpose::Entry,
            Symbol::new("AAPL").unwrap(),
            OrderSide::Buy,
            Quantity::new(dec!(10)).unwrap(),
            None,
        );

        let request = BrokerOrderRequest::for_order(&order);

        assert_eq!(request.client_order_id, order.client_order_id);
        assert_eq!(request.order_type, OrderType::Market);
        assert_eq!(request.time_in_force, "day");
        assert!(request.limit_price.is_none());
    }

    #[test]
    fn test_dead_statuses() {
        assert!(BrokerOrderStatus::Rejected.is_dead());
        assert!(BrokerOrderStatus::Expired.is_dead());
        assert!(!BrokerOrderStatus::PartiallyFilled.is_dead());
    }
}
