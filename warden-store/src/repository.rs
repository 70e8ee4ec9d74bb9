//! Repository trait definitions (Ports)
//!
//! These traits define the storage interface for the domain.
//! Implementations can be PostgreSQL, in-memory, or mock for testing.
//!
//! Every mutating call that races with other writers is conditional: it
//! names the state it expects to replace and fails with
//! `StoreError::ConcurrencyConflict` when that state has moved on.

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use warden_domain::{
    CloseReason, Fill, IdempotencyRecord, Opportunity, OpportunityId, OpportunityStatus, Order,
    OrderId, Position, PositionId, ProfitTakeId, ProfitTakeRequest, ProfitTakeStatus, RiskLimit,
};

/// Repository for Position entities
#[async_trait]
pub trait PositionRepository: Send + Sync {
    /// Insert a new position (version 0)
    async fn insert(&self, position: &Position) -> Result<(), StoreError>;

    /// Find a position by ID
    async fn find_by_id(&self, id: PositionId) -> Result<Option<Position>, StoreError>;

    /// Find all OPEN positions
    async fn find_open(&self) -> Result<Vec<Position>, StoreError>;

    /// Find every position, open and closed
    async fn find_all(&self) -> Result<Vec<Position>, StoreError>;

    /// Replace a position if its stored version equals `expected_version`.
    ///
    /// Returns the stored position (version bumped). Fails with
    /// `Immutable` if the stored position is already closed.
    async fn update(&self, position: &Position, expected_version: u64) -> Result<Position, StoreError>;

    /// Close every OPEN position with `reason`; returns the closed ids
    async fn close_all_open(&self, reason: CloseReason, at: DateTime<Utc>) -> Result<Vec<PositionId>, StoreError>;
}

/// Repository for Order entities
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Insert an order; fails with `Duplicate` if the client order id exists
    async fn insert(&self, order: &Order) -> Result<(), StoreError>;

    /// Overwrite an existing order
    async fn update(&self, order: &Order) -> Result<(), StoreError>;

    /// Find an order by ID
    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>, StoreError>;

    /// Find order by client order ID
    async fn find_by_client_id(&self, client_id: &str) -> Result<Option<Order>, StoreError>;

    /// Find orders by position ID, oldest first
    async fn find_by_position(&self, position_id: PositionId) -> Result<Vec<Order>, StoreError>;

    /// Find orders not yet FILLED or CANCELED
    async fn find_open(&self) -> Result<Vec<Order>, StoreError>;
}

/// Repository for Fill entities (append-only)
#[async_trait]
pub trait FillRepository: Send + Sync {
    /// Append a fill
    async fn append(&self, fill: &Fill) -> Result<(), StoreError>;

    /// Fills of one order, in execution order
    async fn find_by_order(&self, order_id: OrderId) -> Result<Vec<Fill>, StoreError>;
}

/// Repository for Opportunity entities
#[async_trait]
pub trait OpportunityRepository: Send + Sync {
    /// Insert a new opportunity
    async fn insert(&self, opportunity: &Opportunity) -> Result<(), StoreError>;

    /// Find an opportunity by ID
    async fn find_by_id(&self, id: OpportunityId) -> Result<Option<Opportunity>, StoreError>;

    /// Move `id` from `from` to `to`, recording an optional reason
    async fn transition(
        &self,
        id: OpportunityId,
        from: OpportunityStatus,
        to: OpportunityStatus,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Opportunity, StoreError>;
}

/// Repository for ProfitTakeRequest entities
#[async_trait]
pub trait ProfitTakeRepository: Send + Sync {
    /// Insert a request; fails with `Duplicate` if the position already has a PENDING one
    async fn insert(&self, request: &ProfitTakeRequest) -> Result<(), StoreError>;

    /// Find a request by ID
    async fn find_by_id(&self, id: ProfitTakeId) -> Result<Option<ProfitTakeRequest>, StoreError>;

    /// The PENDING request of a position, if any
    async fn find_pending_for_position(
        &self,
        position_id: PositionId,
    ) -> Result<Option<ProfitTakeRequest>, StoreError>;

    /// Every PENDING request
    async fn find_pending(&self) -> Result<Vec<ProfitTakeRequest>, StoreError>;

    /// Decide a PENDING request; conflicts if it is no longer pending
    async fn transition(
        &self,
        id: ProfitTakeId,
        to: ProfitTakeStatus,
        at: DateTime<Utc>,
    ) -> Result<ProfitTakeRequest, StoreError>;
}

/// Repository for RiskLimit configuration
#[async_trait]
pub trait RiskLimitRepository: Send + Sync {
    /// Add a limit
    async fn insert(&self, limit: &RiskLimit) -> Result<(), StoreError>;

    /// Active limits only
    async fn find_active(&self) -> Result<Vec<RiskLimit>, StoreError>;
}

/// Repository for IdempotencyRecord entities (write-once)
#[async_trait]
pub trait IdempotencyRepository: Send + Sync {
    /// Look up a key
    async fn find(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Store the record unless the key exists; returns the existing record if it does
    async fn put_if_absent(&self, record: &IdempotencyRecord) -> Result<Option<IdempotencyRecord>, StoreError>;
}

/// Combined store interface
pub trait Store: Send + Sync {
    /// Get position repository
    fn positions(&self) -> &dyn PositionRepository;

    /// Get order repository
    fn orders(&self) -> &dyn OrderRepository;

    /// Get fill repository
    fn fills(&self) -> &dyn FillRepository;

    /// Get opportunity repository
    fn opportunities(&self) -> &dyn OpportunityRepository;

    /// Get profit-take repository
    fn profit_takes(&self) -> &dyn ProfitTakeRepository;

    /// Get risk limit repository
    fn risk_limits(&self) -> &dyn RiskLimitRepository;

    /// Get idempotency repository
    fn idempotency(&self) -> &dyn IdempotencyRepository;
}
