//! Domain Entities for Warden
//!
//! Core business entities with lifecycle management.
//! All entities have identity and state transitions.
//!
//! ```text
//! Opportunity (PENDING_APPROVAL) ──approve──► Position (OPEN) ──close──► Position (CLOSED)
//!                                                  │
//!                                                  └── Order (NEW → PARTIALLY_FILLED* → FILLED | CANCELED)
//!                                                            └── Fill*
//! ```

use crate::trailing;
use crate::value_objects::{DomainError, EntryPlan, OrderSide, Price, Quantity, Side, Symbol};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// =============================================================================
// Identifiers
// =============================================================================

/// Unique identifier for a Position (a.k.a. trade id)
pub type PositionId = Uuid;

/// Unique identifier for an Order
pub type OrderId = Uuid;

/// Unique identifier for an Opportunity
pub type OpportunityId = Uuid;

/// Unique identifier for a ProfitTakeRequest
pub type ProfitTakeId = Uuid;

// =============================================================================
// Position
// =============================================================================

/// Stop state of an open position.
///
/// `trail_level` is a non-negative multiple of 0.5 (R units) that never
/// decreases; `current` never moves against the position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopState {
    /// Active protective stop
    pub current: Price,
    /// Stop at entry time, defines R
    pub initial: Price,
    /// Highest trail level reached
    pub trail_level: Decimal,
}

impl StopState {
    /// Stop state for a freshly opened position
    pub fn initial(stop: Price) -> Self {
        Self { current: stop, initial: stop, trail_level: Decimal::ZERO }
    }
}

/// Lifecycle status of a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    /// Position is live and reconciled every tick
    Open,
    /// Terminal, immutable
    Closed,
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    /// Price crossed the protective stop
    Stop,
    /// Profit target taken (approved profit-take request)
    Target,
    /// Unrealized loss reached one R
    MaxLoss,
    /// Stop distance exceeded the per-trade percent risk limit
    Risk,
    /// Holding time ceiling exceeded
    Ttl,
    /// Closed by an operator
    Manual,
    /// Forced closure by the kill switch
    KillSwitch,
}

impl CloseReason {
    /// Wire / storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Stop => "STOP",
            CloseReason::Target => "TARGET",
            CloseReason::MaxLoss => "MAX_LOSS",
            CloseReason::Risk => "RISK",
            CloseReason::Ttl => "TTL",
            CloseReason::Manual => "MANUAL",
            CloseReason::KillSwitch => "KILL_SWITCH",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position represents an approved trade and its risk state
///
/// Key concepts:
/// - R = |entry - initial stop|, fixed by the initial stop
/// - Entry price and quantity are set from fills by the order tracker
/// - `version` changes on every persisted write (optimistic concurrency)
/// - Once CLOSED the position is never modified again
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub opportunity_id: Option<OpportunityId>,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Quantity,
    pub correlation_group: String,

    pub entry_price: Price,
    pub target: Price,
    pub stop: StopState,

    pub status: PositionStatus,
    pub close_reason: Option<CloseReason>,
    pub exit_price: Option<Price>,
    pub realized_pnl: Option<Decimal>,

    /// Entry could not be placed at the broker; operator attention required
    pub needs_review: bool,

    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,

    pub version: u64,
}

impl Position {
    /// Open a position from an approved plan
    pub fn open(
        symbol: Symbol,
        side: Side,
        quantity: Quantity,
        plan: &EntryPlan,
        correlation_group: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let correlation_group = correlation_group.unwrap_or_else(|| symbol.as_str().to_string());
        Self {
            id: Uuid::now_v7(),
            opportunity_id: None,
            symbol,
            side,
            quantity,
            correlation_group,
            entry_price: plan.entry,
            target: plan.target,
            stop: StopState::initial(plan.stop),
            status: PositionStatus::Open,
            close_reason: None,
            exit_price: None,
            realized_pnl: None,
            needs_review: false,
            opened_at: now,
            updated_at: now,
            closed_at: None,
            version: 0,
        }
    }

    /// Check if position is open
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Initial risk per unit (R). Zero when entry equals the initial stop.
    pub fn risk_unit(&self) -> Decimal {
        trailing::risk_unit(self.entry_price, self.stop.initial)
    }

    /// Unrealized gain at `price` expressed in R
    pub fn r_multiple(&self, price: Price) -> Decimal {
        trailing::r_multiple(self.side, self.entry_price, self.stop.initial, price)
    }

    /// Profit (negative for loss) of the full quantity at `price`
    pub fn pnl_at(&self, price: Price) -> Decimal {
        self.side.sign()
            * (price.as_decimal() - self.entry_price.as_decimal())
            * self.quantity.as_decimal()
    }

    /// Current stop distance as a percentage of entry
    pub fn stop_distance_pct(&self) -> Decimal {
        let entry = self.entry_price.as_decimal();
        (entry - self.stop.current.as_decimal())
            .abs()
            .checked_div(entry)
            .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
            .unwrap_or(Decimal::MAX)
    }

    /// Money lost if the current stop is hit (0 once the stop is past entry)
    pub fn open_risk(&self) -> Decimal {
        let distance = self.side.sign()
            * (self.entry_price.as_decimal() - self.stop.current.as_decimal());
        distance.max(Decimal::ZERO) * self.quantity.as_decimal()
    }

    /// Money at risk between entry and the initial stop
    pub fn initial_risk(&self) -> Decimal {
        self.risk_unit() * self.quantity.as_decimal()
    }

    /// Whether the position has been held longer than `ttl`
    pub fn is_older_than(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now - self.opened_at > ttl
    }

    /// Record executed entry fills (quantity and average price)
    ///
    /// # Errors
    /// Returns `DomainError::InvalidStateTransition` if the position is closed
    pub fn apply_entry_fill(
        &mut self,
        filled: Quantity,
        avg_price: Price,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.ensure_open("apply entry fill")?;
        self.quantity = filled;
        self.entry_price = avg_price;
        self.updated_at = now;
        Ok(())
    }

    /// Ratchet the stop to a new trail level.
    ///
    /// Returns `false` (and leaves the position untouched) when the level is
    /// not higher than the current one or the stop would move against the
    /// position.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidStateTransition` if the position is closed
    pub fn tighten_stop(
        &mut self,
        level: Decimal,
        new_stop: Price,
        now: DateTime<Utc>,
    ) -> Result<bool, DomainError> {
        self.ensure_open("tighten stop")?;

        if level <= self.stop.trail_level {
            return Ok(false);
        }

        let improves = match self.side {
            Side::Long => new_stop >= self.stop.current,
            Side::Short => new_stop <= self.stop.current,
        };
        if !improves {
            return Ok(false);
        }

        self.stop.trail_level = level;
        self.stop.current = new_stop;
        self.updated_at = now;
        Ok(true)
    }

    /// Close the position. Realized PnL is computed when an exit price is known.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidStateTransition` if already closed
    pub fn close(
        &mut self,
        reason: CloseReason,
        exit_price: Option<Price>,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.ensure_open("close")?;

        self.status = PositionStatus::Closed;
        self.close_reason = Some(reason);
        self.exit_price = exit_price;
        self.realized_pnl = exit_price.map(|price| self.pnl_at(price));
        self.closed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Flag the position for manual review
    ///
    /// # Errors
    /// Returns `DomainError::InvalidStateTransition` if the position is closed
    pub fn flag_for_review(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.ensure_open("flag for review")?;
        self.needs_review = true;
        self.updated_at = now;
        Ok(())
    }

    fn ensure_open(&self, action: &str) -> Result<(), DomainError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(DomainError::InvalidStateTransition(format!(
                "cannot {} on closed position {}",
                action, self.id
            )))
        }
    }
}

// =============================================================================
// Opportunity
// =============================================================================

/// Opportunity lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpportunityStatus {
    /// Waiting for an operator decision
    PendingApproval,
    /// Approved, a position was opened
    Approved,
    /// Rejected by an operator
    Rejected,
    /// No longer actionable
    Expired,
}

/// A proposed trade awaiting approval. The plan is immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: OpportunityId,
    pub symbol: Symbol,
    pub side: Side,
    pub timeframe: String,
    pub plan: EntryPlan,
    pub correlation_group: Option<String>,
    pub status: OpportunityStatus,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl Opportunity {
    /// Create a new opportunity pending approval
    pub fn new(symbol: Symbol, side: Side, timeframe: impl Into<String>, plan: EntryPlan) -> Self {
        Self {
            id: Uuid::now_v7(),
            symbol,
            side,
            timeframe: timeframe.into(),
            plan,
            correlation_group: None,
            status: OpportunityStatus::PendingApproval,
            rejection_reason: None,
            created_at: Utc::now(),
            decided_at: None,
        }
    }

    /// Assign a correlation group (defaults to the symbol otherwise)
    pub fn with_correlation_group(mut self, group: impl Into<String>) -> Self {
        self.correlation_group = Some(group.into());
        self
    }

    /// Check if the opportunity can still be approved or rejected
    pub fn is_pending(&self) -> bool {
        self.status == OpportunityStatus::PendingApproval
    }
}

// =============================================================================
// Order
// =============================================================================

/// Why an order exists
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderPurpose {
    /// Opens the position; fills update position quantity and entry price
    Entry,
    /// Flattens the position after a close
    Exit,
}

/// Order types supported
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    /// Market order (immediate execution)
    Market,
    /// Limit order (price guaranteed)
    Limit,
}

impl OrderType {
    /// Broker wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
        }
    }
}

/// Order status lifecycle
///
/// ```text
/// NEW ──► PARTIALLY_FILLED* ──► FILLED
///  │              │
///  └──────────────┴──────────► CANCELED
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Submitted to the broker, nothing filled yet
    New,
    /// Some quantity filled
    PartiallyFilled,
    /// Completely filled
    Filled,
    /// Cancelled (remaining quantity will never fill)
    Canceled,
}

impl OrderStatus {
    /// FILLED and CANCELED are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Canceled)
    }
}

/// Order represents an instruction to buy/sell at the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub position_id: PositionId,
    /// Deterministic `{position_id}-{attempt}`, used for broker-side dedup
    pub client_order_id: String,
    pub broker_order_id: Option<String>,

    pub purpose: OrderPurpose,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Quantity,
    pub limit_price: Option<Price>,

    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Price>,

    pub raw_request: Option<serde_json::Value>,
    pub raw_response: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Build the deterministic client order id for a placement attempt
///
/// ```
/// # use warden_domain::entities::client_order_id;
/// # use uuid::Uuid;
/// let id = Uuid::nil();
/// assert_eq!(client_order_id(id, 2), "00000000-0000-0000-0000-000000000000-2");
/// ```
pub fn client_order_id(position_id: PositionId, attempt: u32) -> String {
    format!("{}-{}", position_id, attempt)
}

impl Order {
    /// Create a new order for the given placement attempt
    pub fn new(
        position_id: PositionId,
        attempt: u32,
        purpose: OrderPurpose,
        symbol: Symbol,
        side: OrderSide,
        quantity: Quantity,
        limit_price: Option<Price>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            position_id,
            client_order_id: client_order_id(position_id, attempt),
            broker_order_id: None,
            purpose,
            symbol,
            side,
            order_type: if limit_price.is_some() { OrderType::Limit } else { OrderType::Market },
            quantity,
            limit_price,
            status: OrderStatus::New,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            raw_request: None,
            raw_response: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if order is filled
    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }

    /// Quantity still expected to fill
    pub fn remaining(&self) -> Decimal {
        (self.quantity.as_decimal() - self.filled_quantity).max(Decimal::ZERO)
    }

    /// Reconcile a cumulative fill report from the broker.
    ///
    /// Returns the new `Fill` when the report adds quantity, `None` when
    /// nothing changed.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidQuantity` if the report exceeds the order
    /// quantity or shrinks the already filled quantity, and
    /// `DomainError::InvalidStateTransition` for terminal orders.
    pub fn apply_fill_report(
        &mut self,
        total_filled: Decimal,
        avg_price: Option<Price>,
        now: DateTime<Utc>,
    ) -> Result<Option<Fill>, DomainError> {
        if self.status.is_terminal() {
            return Err(DomainError::InvalidStateTransition(format!(
                "order {} is already {:?}",
                self.client_order_id, self.status
            )));
        }
        if total_filled > self.quantity.as_decimal() {
            return Err(DomainError::InvalidQuantity(format!(
                "filled {} exceeds order quantity {}",
                total_filled, self.quantity
            )));
        }
        if total_filled < self.filled_quantity {
            return Err(DomainError::InvalidQuantity(format!(
                "filled quantity went backwards: {} -> {}",
                self.filled_quantity, total_filled
            )));
        }

        let delta = total_filled - self.filled_quantity;
        if delta.is_zero() {
            return Ok(None);
        }

        let avg_price = avg_price.ok_or_else(|| {
            DomainError::InvalidPrice(format!("fill on {} reported without price", self.client_order_id))
        })?;

        // Price of the incremental fill, derived from the cumulative average
        let prev_notional = self
            .avg_fill_price
            .map(|p| p.as_decimal() * self.filled_quantity)
            .unwrap_or(Decimal::ZERO);
        let fill_price = (avg_price.as_decimal() * total_filled - prev_notional)
            .checked_div(delta)
            .and_then(|p| Price::new(p).ok())
            .unwrap_or(avg_price);

        let fill = Fill {
            id: Uuid::now_v7(),
            order_id: self.id,
            price: fill_price,
            quantity: Quantity::new(delta)?,
            filled_at: now,
        };

        self.filled_quantity = total_filled;
        self.avg_fill_price = Some(avg_price);
        self.status = if total_filled == self.quantity.as_decimal() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.updated_at = now;

        Ok(Some(fill))
    }

    /// Mark the order canceled, keeping whatever already filled
    pub fn mark_canceled(&mut self, now: DateTime<Utc>) {
        if !self.status.is_terminal() {
            self.status = OrderStatus::Canceled;
            self.updated_at = now;
        }
    }
}

/// A single execution against an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub id: Uuid,
    pub order_id: OrderId,
    pub price: Price,
    pub quantity: Quantity,
    pub filled_at: DateTime<Utc>,
}

// =============================================================================
// Profit-take requests
// =============================================================================

/// Profit-take request lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProfitTakeStatus {
    /// Awaiting an operator decision
    Pending,
    /// Operator took profit; position closed with TARGET
    Approved,
    /// Operator declined
    Denied,
    /// Nobody decided before the grace window ran out
    Expired,
}

/// Raised when price reaches the target. The position is not closed until an
/// operator approves; if the request expires the trail tightens instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfitTakeRequest {
    pub id: ProfitTakeId,
    pub position_id: PositionId,
    pub price: Price,
    pub status: ProfitTakeStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl ProfitTakeRequest {
    /// Create a pending request expiring after `grace`
    pub fn new(position_id: PositionId, price: Price, now: DateTime<Utc>, grace: Duration) -> Self {
        Self {
            id: Uuid::now_v7(),
            position_id,
            price,
            status: ProfitTakeStatus::Pending,
            created_at: now,
            expires_at: now + grace,
            decided_at: None,
        }
    }

    /// A pending request whose grace window has elapsed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ProfitTakeStatus::Pending && now >= self.expires_at
    }

    /// Move out of PENDING
    ///
    /// # Errors
    /// Returns `DomainError::InvalidStateTransition` if not pending or the
    /// target status is PENDING
    pub fn decide(&mut self, status: ProfitTakeStatus, now: DateTime<Utc>) -> Result<(), DomainError> {
        if self.status != ProfitTakeStatus::Pending || status == ProfitTakeStatus::Pending {
            return Err(DomainError::InvalidStateTransition(format!(
                "profit take {} cannot go from {:?} to {:?}",
                self.id, self.status, status
            )));
        }
        self.status = status;
        self.decided_at = Some(now);
        Ok(())
    }
}

// =============================================================================
// Idempotency
// =============================================================================

/// Write-once mapping of a client idempotency key to the entity it created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub entity_id: Uuid,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Tests
// =============================================================================
