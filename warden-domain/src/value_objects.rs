//! Value Objects for the Warden Domain
//!
//! Immutable, validated domain primitives.
//! All value objects enforce invariants at construction time.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Domain errors for value object validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    /// Price must be positive
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    /// Quantity must be positive
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    /// Symbol must be a valid ticker
    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    /// Entry plan is inconsistent with the side
    #[error("Invalid entry plan: {0}")]
    InvalidEntryPlan(String),

    /// Risk limit value is out of range
    #[error("Invalid risk limit: {0}")]
    InvalidRiskLimit(String),

    /// Invalid state transition
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),
}

// =============================================================================
// Price
// =============================================================================

/// Price represents a positive decimal price
///
/// # Invariants
/// - Must be > 0 and <= `Price::MAX`
///
/// The ceiling keeps notional, PnL and exposure arithmetic (price × quantity,
/// summed over a book) inside `Decimal` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Price(Decimal);

impl Price {
    /// Largest accepted price (10^12)
    pub const MAX: Decimal = Decimal::from_parts(3_567_587_328, 232, 0, false, 0);

    /// Create a new Price with validation
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPrice` if value <= 0 or above `Price::MAX`
    pub fn new(value: Decimal) -> Result<Self, DomainError> {
        if value <= Decimal::ZERO {
            return Err(DomainError::InvalidPrice(format!("{} is not positive", value)));
        }
        if value > Self::MAX {
            return Err(DomainError::InvalidPrice(format!("{} exceeds {}", value, Self::MAX)));
        }
        Ok(Self(value))
    }

    /// Get the underlying Decimal value
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Price {
    type Error = DomainError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Price> for Decimal {
    fn from(price: Price) -> Self {
        price.0
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Quantity
// =============================================================================

/// Quantity represents a positive decimal quantity
///
/// # Invariants
/// - Must be > 0 and <= `Quantity::MAX`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Quantity(Decimal);

impl Quantity {
    /// Largest accepted quantity (10^12)
    pub const MAX: Decimal = Price::MAX;

    /// Create a new Quantity with validation
    ///
    /// # Errors
    /// Returns `DomainError::InvalidQuantity` if value <= 0 or above `Quantity::MAX`
    pub fn new(value: Decimal) -> Result<Self, DomainError> {
        if value <= Decimal::ZERO {
            return Err(DomainError::InvalidQuantity(format!("{} is not positive", value)));
        }
        if value > Self::MAX {
            return Err(DomainError::InvalidQuantity(format!("{} exceeds {}", value, Self::MAX)));
        }
        Ok(Self(value))
    }

    /// Get the underlying Decimal value
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Quantity {
    type Error = DomainError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Quantity> for Decimal {
    fn from(quantity: Quantity) -> Self {
        quantity.0
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Symbol
// =============================================================================

/// Symbol represents a tradable instrument ticker (e.g., AAPL, BRK.B, EUR/USD)
///
/// # Invariants
/// - Non-empty, at most 16 characters
/// - Uppercase ASCII letters, digits, `.`, `/` or `-`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    const MAX_LEN: usize = 16;

    /// Create a Symbol from a ticker string. Input is upper-cased.
    ///
    /// # Examples
    /// ```
    /// # use warden_domain::value_objects::Symbol;
    /// let symbol = Symbol::new("aapl").unwrap();
    /// assert_eq!(symbol.as_str(), "AAPL");
    /// assert!(Symbol::new("").is_err());
    /// ```
    ///
    /// # Errors
    /// Returns `DomainError::InvalidSymbol` if the ticker is malformed
    pub fn new(ticker: &str) -> Result<Self, DomainError> {
        let ticker = ticker.trim().to_ascii_uppercase();

        if ticker.is_empty() || ticker.len() > Self::MAX_LEN {
            return Err(DomainError::InvalidSymbol(format!("'{}' has invalid length", ticker)));
        }

        let valid = ticker
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || matches!(c, '.' | '/' | '-'));
        if !valid {
            return Err(DomainError::InvalidSymbol(format!("'{}' contains invalid characters", ticker)));
        }

        Ok(Self(ticker))
    }

    /// Get the ticker as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Symbol {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Symbol> for String {
    fn from(symbol: Symbol) -> Self {
        symbol.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Side
// =============================================================================

/// Side represents the position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    /// Long position (buy low, sell high)
    Long,
    /// Short position (sell high, buy low)
    Short,
}

impl Side {
    /// Sign applied to price moves: +1 for Long, -1 for Short
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Long => Decimal::ONE,
            Side::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// Get the entry action for this side
    ///
    /// Long → Buy, Short → Sell
    pub fn entry_action(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Get the exit action for this side
    ///
    /// Long → Sell, Short → Buy
    pub fn exit_action(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// OrderSide represents the order direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    /// Buy order
    Buy,
    /// Sell order
    Sell,
}

impl OrderSide {
    /// Lowercase wire representation used by broker APIs
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

// =============================================================================
// EntryPlan
// =============================================================================

/// Entry plan attached to an opportunity: where to enter, where the
/// protective stop sits and where the profit target is.
///
/// # Invariants
/// - LONG: stop < entry < target
/// - SHORT: target < entry < stop
///
/// # Example
///
/// ```
/// # use warden_domain::value_objects::{EntryPlan, Price, Side};
/// # use rust_decimal_macros::dec;
/// let plan = EntryPlan::new(
///     Side::Long,
///     Price::new(dec!(100)).unwrap(),
///     Price::new(dec!(98)).unwrap(),
///     Price::new(dec!(106)).unwrap(),
/// )
/// .unwrap();
/// assert_eq!(plan.per_unit_risk(), dec!(2));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPlan {
    /// Planned entry price
    pub entry: Price,
    /// Initial protective stop
    pub stop: Price,
    /// Profit target
    pub target: Price,
}

impl EntryPlan {
    /// Create a validated entry plan for the given side
    ///
    /// # Errors
    /// Returns `DomainError::InvalidEntryPlan` if the levels are not ordered
    /// consistently with the side
    pub fn new(side: Side, entry: Price, stop: Price, target: Price) -> Result<Self, DomainError> {
        let ordered = match side {
            Side::Long => stop < entry && entry < target,
            Side::Short => target < entry && entry < stop,
        };

        if !ordered {
            return Err(DomainError::InvalidEntryPlan(format!(
                "{} plan requires ordered levels, got entry={} stop={} target={}",
                side, entry, stop, target
            )));
        }

        Ok(Self { entry, stop, target })
    }

    /// Distance between entry and stop (risk per unit)
    pub fn per_unit_risk(&self) -> Decimal {
        (self.entry.as_decimal() - self.stop.as_decimal()).abs()
    }
}

// =============================================================================
// Risk limits
// =============================================================================

/// What a risk limit applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskScope {
    /// Applies to each individual trade
    Trade,
    /// Applies to the aggregate exposure of a correlation group
    Group,
}

/// Unit in which a risk limit is expressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapType {
    /// Percentage (e.g. 2 = 2%)
    Pct,
    /// Absolute US dollars
    Usd,
}

/// A configured risk limit. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskLimit {
    /// Scope of the limit
    pub scope: RiskScope,
    /// Unit of `value`
    pub cap_type: CapType,
    /// Limit value
    pub value: Decimal,
    /// Correlation group this limit targets (`None` = every group)
    pub group: Option<String>,
    /// Inactive limits are ignored
    pub active: bool,
}

impl RiskLimit {
    /// Create an active risk limit
    ///
    /// # Errors
    /// Returns `DomainError::InvalidRiskLimit` if value <= 0
    pub fn new(scope: RiskScope, cap_type: CapType, value: Decimal) -> Result<Self, DomainError> {
        if value <= Decimal::ZERO {
            return Err(DomainError::InvalidRiskLimit(format!("{} is not positive", value)));
        }
        Ok(Self { scope, cap_type, value, group: None, active: true })
    }

    /// Restrict a GROUP limit to a single correlation group
    pub fn for_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Whether this limit applies to the given correlation group
    pub fn applies_to_group(&self, group: &str) -> bool {
        self.active
            && self.scope == RiskScope::Group
            && self.group.as_deref().map_or(true, |g| g == group)
    }

    /// Convert the limit to USD, resolving percentages against equity
    pub fn usd_value(&self, equity: Decimal) -> Decimal {
        match self.cap_type {
            CapType::Usd => self.value,
            CapType::Pct => equity * self.value / Decimal::ONE_HUNDRED,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
