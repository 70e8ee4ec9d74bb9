//! Stub implementations for testing.
//!
//! These implementations simulate broker and narrative behavior
//! without making real API calls.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use warden_domain::{OrderSide, Price, Symbol};

use crate::error::ExecError;
use crate::ports::{
    BrokerOrderAck, BrokerOrderReport, BrokerOrderRequest, BrokerOrderStatus, BrokerPort,
    NarrativeContext, NarrativePort,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Stub Broker
// =============================================================================

/// How submitted orders fill
#[derive(Debug, Clone, PartialEq)]
pub enum FillScript {
    /// Fully filled at submission
    Immediate,
    /// Never fills
    Never,
    /// Cumulative filled quantity reported by each successive status poll;
    /// the last step repeats
    Steps(Vec<Decimal>),
}

/// Failure injected into the next broker call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubFailure {
    /// HTTP 429
    RateLimited,
    /// HTTP 5xx
    Server(u16),
    /// HTTP 4xx rejection
    Rejected,
    /// Call timed out
    Timeout,
}

impl StubFailure {
    fn into_error(self, operation: &str) -> ExecError {
        match self {
            Self::RateLimited => ExecError::RateLimited(format!("stub: {}", operation)),
            Self::Server(status) => {
                ExecError::Server { status, message: format!("stub: {}", operation) }
            }
            Self::Rejected => ExecError::Rejected {
                status: Some(422),
                message: format!("stub: {} rejected", operation),
            },
            Self::Timeout => ExecError::Timeout(format!("stub: {}", operation)),
        }
    }
}

#[derive(Debug, Clone)]
struct StubOrder {
    request: BrokerOrderRequest,
    status: BrokerOrderStatus,
    filled: Decimal,
    avg_price: Option<Price>,
    polls: usize,
}

/// Stub broker for testing.
///
/// Fills follow the configured `FillScript` at the symbol's current price
/// (or the order's limit price when no price is set). Net positions are
/// tracked per symbol so liquidation can report what it closed.
pub struct StubBroker {
    prices: Mutex<HashMap<String, Decimal>>,
    script: Mutex<FillScript>,
    orders: Mutex<HashMap<String, StubOrder>>,
    net_positions: Mutex<HashMap<String, Decimal>>,
    failures: Mutex<VecDeque<StubFailure>>,
    order_counter: AtomicU64,
    place_calls: AtomicUsize,
    cancel_all_calls: AtomicUsize,
    liquidate_calls: AtomicUsize,
}

impl StubBroker {
    /// Create a stub broker that fills immediately
    pub fn new() -> Self {
        Self::with_script(FillScript::Immediate)
    }

    /// Create a stub broker with a fill script
    pub fn with_script(script: FillScript) -> Self {
        Self {
            prices: Mutex::new(HashMap::new()),
            script: Mutex::new(script),
            orders: Mutex::new(HashMap::new()),
            net_positions: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
            order_counter: AtomicU64::new(0),
            place_calls: AtomicUsize::new(0),
            cancel_all_calls: AtomicUsize::new(0),
            liquidate_calls: AtomicUsize::new(0),
        }
    }

    /// Set the latest price of a symbol
    pub fn set_price(&self, symbol: &str, price: Decimal) {
        lock(&self.prices).insert(symbol.to_string(), price);
    }

    /// Forget the price of a symbol
    pub fn clear_price(&self, symbol: &str) {
        lock(&self.prices).remove(symbol);
    }

    /// Replace the fill script for orders submitted from now on
    pub fn set_script(&self, script: FillScript) {
        *lock(&self.script) = script;
    }

    /// Fail the next broker call (any operation) with `failure`
    pub fn fail_next(&self, failure: StubFailure) {
        lock(&self.failures).push_back(failure);
    }

    /// Pretend the account holds `quantity` (signed) of `symbol`
    pub fn seed_position(&self, symbol: &str, quantity: Decimal) {
        lock(&self.net_positions).insert(symbol.to_string(), quantity);
    }

    /// Number of `place_order` calls, including failed ones
    pub fn place_calls(&self) -> usize {
        self.place_calls.load(Ordering::SeqCst)
    }

    /// Number of `cancel_all_orders` calls
    pub fn cancel_all_calls(&self) -> usize {
        self.cancel_all_calls.load(Ordering::SeqCst)
    }

    /// Number of `liquidate_all_positions` calls
    pub fn liquidate_calls(&self) -> usize {
        self.liquidate_calls.load(Ordering::SeqCst)
    }

    /// Orders accepted so far
    pub fn submitted_orders(&self) -> Vec<BrokerOrderRequest> {
        let orders = lock(&self.orders);
        let mut requests: Vec<(String, BrokerOrderRequest)> =
            orders.iter().map(|(id, o)| (id.clone(), o.request.clone())).collect();
        requests.sort_by_key(|(id, _)| id.trim_start_matches("STUB-").parse::<u64>().unwrap_or(0));
        requests.into_iter().map(|(_, r)| r).collect()
    }

    /// Net signed quantity held in `symbol`
    pub fn net_position(&self, symbol: &str) -> Decimal {
        lock(&self.net_positions).get(symbol).copied().unwrap_or(Decimal::ZERO)
    }

    fn take_failure(&self, operation: &str) -> Result<(), ExecError> {
        match lock(&self.failures).pop_front() {
            Some(failure) => Err(failure.into_error(operation)),
            None => Ok(()),
        }
    }

    fn next_order_id(&self) -> String {
        format!("STUB-{}", self.order_counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn fill_price(&self, request: &BrokerOrderRequest) -> Result<Price, ExecError> {
        if let Some(price) = lock(&self.prices).get(request.symbol.as_str()) {
            return Ok(Price::new(*price)?);
        }
        request
            .limit_price
            .ok_or_else(|| ExecError::NoMarketData(request.symbol.to_string()))
    }

    /// Move an order to `filled` cumulative quantity, updating net positions
    fn advance(&self, order: &mut StubOrder, filled: Decimal) -> Result<(), ExecError> {
        let filled = filled.min(order.request.quantity.as_decimal());
        if filled <= order.filled {
            return Ok(());
        }

        let price = self.fill_price(&order.request)?;
        let delta = filled - order.filled;
        let sign = match order.request.side {
            OrderSide::Buy => Decimal::ONE,
            OrderSide::Sell => -Decimal::ONE,
        };
        *lock(&self.net_positions)
            .entry(order.request.symbol.as_str().to_string())
            .or_insert(Decimal::ZERO) += sign * delta;

        order.avg_price = Some(price);
        order.filled = filled;
        order.status = if filled == order.request.quantity.as_decimal() {
            BrokerOrderStatus::Filled
        } else {
            BrokerOrderStatus::PartiallyFilled
        };
        Ok(())
    }

    fn report(broker_order_id: &str, order: &StubOrder) -> BrokerOrderReport {
        BrokerOrderReport {
            broker_order_id: broker_order_id.to_string(),
            status: order.status,
            filled_quantity: order.filled,
            avg_fill_price: order.avg_price,
            raw: serde_json::json!({
                "id": broker_order_id,
                "client_order_id": order.request.client_order_id,
                "status": order.status,
                "filled_qty": order.filled.to_string(),
            }),
        }
    }
}

impl Default for StubBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerPort for StubBroker {
    async fn place_order(&self, request: &BrokerOrderRequest) -> Result<BrokerOrderAck, ExecError> {
        self.place_calls.fetch_add(1, Ordering::SeqCst);
        self.take_failure("place_order")?;

        let mut orders = lock(&self.orders);
        if let Some((id, existing)) =
            orders.iter().find(|(_, o)| o.request.client_order_id == request.client_order_id)
        {
            return Ok(BrokerOrderAck {
                broker_order_id: id.clone(),
                client_order_id: request.client_order_id.clone(),
                status: existing.status,
                raw: serde_json::json!({ "id": id, "duplicate": true }),
            });
        }

        let broker_order_id = self.next_order_id();
        let mut order = StubOrder {
            request: request.clone(),
            status: BrokerOrderStatus::New,
            filled: Decimal::ZERO,
            avg_price: None,
            polls: 0,
        };

        if *lock(&self.script) == FillScript::Immediate {
            self.advance(&mut order, request.quantity.as_decimal())?;
        }

        let ack = BrokerOrderAck {
            broker_order_id: broker_order_id.clone(),
            client_order_id: request.client_order_id.clone(),
            status: order.status,
            raw: serde_json::json!({
                "id": broker_order_id,
                "client_order_id": request.client_order_id,
                "status": order.status,
            }),
        };
        orders.insert(broker_order_id.clone(), order);

        tracing::debug!(broker_order_id = %ack.broker_order_id, "Stub: order accepted");
        Ok(ack)
    }

    async fn get_order(&self, broker_order_id: &str) -> Result<BrokerOrderReport, ExecError> {
        self.take_failure("get_order")?;

        let script = lock(&self.script).clone();
        let mut orders = lock(&self.orders);
        let order = orders.get_mut(broker_order_id).ok_or_else(|| ExecError::Rejected {
            status: Some(404),
            message: format!("unknown order {}", broker_order_id),
        })?;

        if !order.status.is_dead() && order.status != BrokerOrderStatus::Filled {
            if let FillScript::Steps(steps) = &script {
                if let Some(target) = steps.get(order.polls).or_else(|| steps.last()) {
                    self.advance(order, *target)?;
                }
            }
            order.polls += 1;
        }

        Ok(Self::report(broker_order_id, order))
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), ExecError> {
        self.take_failure("cancel_order")?;

        let mut orders = lock(&self.orders);
        if let Some(order) = orders.get_mut(broker_order_id) {
            if order.status != BrokerOrderStatus::Filled {
                order.status = BrokerOrderStatus::Canceled;
            }
        }
        tracing::debug!(broker_order_id, "Stub: order canceled");
        Ok(())
    }

    async fn cancel_all_orders(&self) -> Result<usize, ExecError> {
        self.cancel_all_calls.fetch_add(1, Ordering::SeqCst);
        self.take_failure("cancel_all_orders")?;

        let mut orders = lock(&self.orders);
        let mut canceled = 0;
        for order in orders.values_mut() {
            if !order.status.is_dead() && order.status != BrokerOrderStatus::Filled {
                order.status = BrokerOrderStatus::Canceled;
                canceled += 1;
            }
        }
        Ok(canceled)
    }

    async fn liquidate_all_positions(&self) -> Result<usize, ExecError> {
        self.liquidate_calls.fetch_add(1, Ordering::SeqCst);
        self.take_failure("liquidate_all_positions")?;

        let mut positions = lock(&self.net_positions);
        let closed = positions.values().filter(|q| !q.is_zero()).count();
        positions.clear();
        Ok(closed)
    }

    async fn latest_price(&self, symbol: &Symbol) -> Result<Option<Price>, ExecError> {
        self.take_failure("latest_price")?;

        match lock(&self.prices).get(symbol.as_str()) {
            Some(price) => Ok(Some(Price::new(*price)?)),
            None => Ok(None),
        }
    }
}

// =============================================================================
// Stub Narrator
// =============================================================================

/// Stub narrative generator
pub enum StubNarrator {
    /// Always answers with this text
    Fixed(String),
    /// Always fails
    Failing,
    /// Answers after a delay
    Slow(Duration, String),
}

#[async_trait]
impl NarrativePort for StubNarrator {
    async fn narrate(&self, context: &NarrativeContext) -> Result<String, ExecError> {
        match self {
            Self::Fixed(text) => Ok(format!("{} {}", context.symbol, text)),
            Self::Failing => Err(ExecError::Server { status: 500, message: "stub narrator down".into() }),
            Self::Slow(delay, text) => {
                tokio::time::sleep(*delay).await;
                Ok(text.clone())
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use warden_domain::{OrderType, Quantity};

    fn request(client_id: &str, side: OrderSide, qty: Decimal) -> BrokerOrderRequest {
        BrokerOrderRequest {
            client_order_id: client_id.to_string(),
            symbol: Symbol::new("AAPL").unwrap(),
            side,
            order_type: OrderType::Market,
            quantity: Quantity::new(qty).unwrap(),
            limit_price: None,
            time_in_force: "day".to_string(),
        }
    }

    #[tokio::test]
    async fn test_immediate_fill_at_current_price() {
        let broker = StubBroker::new();
        broker.set_price("AAPL", dec!(190));

        let ack = broker.place_order(&request("p-1", OrderSide::Buy, dec!(10))).await.unwrap();
        let report = broker.get_order(&ack.broker_order_id).await.unwrap();

        assert_eq!(ack.status, BrokerOrderStatus::Filled);
        assert_eq!(report.filled_quantity, dec!(10));
        assert_eq!(report.avg_fill_price.unwrap().as_decimal(), dec!(190));
        assert_eq!(broker.net_position("AAPL"), dec!(10));
    }

    #[tokio::test]
    async fn test_resubmitted_client_id_returns_same_order() {
        let broker = StubBroker::new();
        broker.set_price("AAPL", dec!(190));

        let first = broker.place_order(&request("p-1", OrderSide::Buy, dec!(10))).await.unwrap();
        let second = broker.place_order(&request("p-1", OrderSide::Buy, dec!(10))).await.unwrap();

        assert_eq!(first.broker_order_id, second.broker_order_id);
        assert_eq!(broker.net_position("AAPL"), dec!(10));
    }

    #[tokio::test]
    async fn test_stepped_fills_advance_per_poll() {
        let broker = StubBroker::with_script(FillScript::Steps(vec![dec!(0), dec!(4), dec!(10)]));
        broker.set_price("AAPL", dec!(190));

        let ack = broker.place_order(&request("p-1", OrderSide::Buy, dec!(10))).await.unwrap();

        let first = broker.get_order(&ack.broker_order_id).await.unwrap();
        let second = broker.get_order(&ack.broker_order_id).await.unwrap();
        let third = broker.get_order(&ack.broker_order_id).await.unwrap();

        assert_eq!(first.filled_quantity, dec!(0));
        assert_eq!(second.status, BrokerOrderStatus::PartiallyFilled);
        assert_eq!(second.filled_quantity, dec!(4));
        assert_eq!(third.status, BrokerOrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_injected_failure_applies_once() {
        let broker = StubBroker::new();
        broker.set_price("AAPL", dec!(190));
        broker.fail_next(StubFailure::RateLimited);

        let failed = broker.place_order(&request("p-1", OrderSide::Buy, dec!(1))).await;
        let ok = broker.place_order(&request("p-1", OrderSide::Buy, dec!(1))).await;

        assert!(matches!(failed, Err(ExecError::RateLimited(_))));
        assert!(ok.is_ok());
        assert_eq!(broker.place_calls(), 2);
    }

    #[tokio::test]
    async fn test_kill_switch_operations_report_counts() {
        let broker = StubBroker::with_script(FillScript::Never);
        broker.set_price("AAPL", dec!(190));
        broker.seed_position("MSFT", dec!(-5));

        broker.place_order(&request("p-1", OrderSide::Buy, dec!(1))).await.unwrap();
        broker.place_order(&request("p-2", OrderSide::Buy, dec!(1))).await.unwrap();

        assert_eq!(broker.cancel_all_orders().await.unwrap(), 2);
        assert_eq!(broker.liquidate_all_positions().await.unwrap(), 1);
        assert_eq!(broker.net_position("MSFT"), dec!(0));
    }

    #[tokio::test]
    async fn test_latest_price_unknown_symbol() {
        let broker = StubBroker::new();
        let price = broker.latest_price(&Symbol::new("TSLA").unwrap()).await.unwrap();
        assert!(price.is_none());
    }
}
