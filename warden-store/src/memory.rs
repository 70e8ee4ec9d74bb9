//! In-memory store implementation
//!
//! Used for testing and development without a database.
//! Thread-safe using RwLock; every conditional write checks and replaces
//! under a single write lock, so it is atomic with respect to other writers.

use crate::error::StoreError;
use crate::repository::{
    FillRepository, IdempotencyRepository, OpportunityRepository, OrderRepository,
    PositionRepository, ProfitTakeRepository, RiskLimitRepository, Store,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use warden_domain::{
    CloseReason, Fill, IdempotencyRecord, Opportunity, OpportunityId, OpportunityStatus, Order,
    OrderId, Position, PositionId, ProfitTakeId, ProfitTakeRequest, ProfitTakeStatus, RiskLimit,
};

/// In-memory store
pub struct MemoryStore {
    positions: RwLock<HashMap<PositionId, Position>>,
    orders: RwLock<HashMap<OrderId, Order>>,
    fills: RwLock<Vec<Fill>>,
    opportunities: RwLock<HashMap<OpportunityId, Opportunity>>,
    profit_takes: RwLock<HashMap<ProfitTakeId, ProfitTakeRequest>>,
    risk_limits: RwLock<Vec<RiskLimit>>,
    idempotency: RwLock<HashMap<String, IdempotencyRecord>>,
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, StoreError> {
    lock.read().map_err(|_| StoreError::Database("lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, StoreError> {
    lock.write().map_err(|_| StoreError::Database("lock poisoned".to_string()))
}

impl MemoryStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            orders: RwLock::new(HashMap::new()),
            fills: RwLock::new(Vec::new()),
            opportunities: RwLock::new(HashMap::new()),
            profit_takes: RwLock::new(HashMap::new()),
            risk_limits: RwLock::new(Vec::new()),
            idempotency: RwLock::new(HashMap::new()),
        }
    }

    /// Get the number of positions
    pub fn position_count(&self) -> usize {
        self.positions.read().map(|p| p.len()).unwrap_or(0)
    }

    /// Get the number of orders
    pub fn order_count(&self) -> usize {
        self.orders.read().map(|o| o.len()).unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Position Repository Implementation
// =============================================================================

#[async_trait]
impl PositionRepository for MemoryStore {
    async fn insert(&self, position: &Position) -> Result<(), StoreError> {
        let mut positions = write(&self.positions)?;
        if positions.contains_key(&position.id) {
            return Err(StoreError::duplicate("position", position.id));
        }
        positions.insert(position.id, position.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: PositionId) -> Result<Option<Position>, StoreError> {
        Ok(read(&self.positions)?.get(&id).cloned())
    }

    async fn find_open(&self) -> Result<Vec<Position>, StoreError> {
        let mut open: Vec<Position> = read(&self.positions)?.values().filter(|p| p.is_open()).cloned().collect();
        open.sort_by_key(|p| p.opened_at);
        Ok(open)
    }

    async fn find_all(&self) -> Result<Vec<Position>, StoreError> {
        let mut all: Vec<Position> = read(&self.positions)?.values().cloned().collect();
        all.sort_by_key(|p| p.opened_at);
        Ok(all)
    }

    async fn update(&self, position: &Position, expected_version: u64) -> Result<Position, StoreError> {
        let mut positions = write(&self.positions)?;
        let stored = positions
            .get(&position.id)
            .ok_or_else(|| StoreError::not_found("position", position.id))?;

        if !stored.is_open() {
            return Err(StoreError::immutable("position", position.id));
        }
        if stored.version != expected_version {
            return Err(StoreError::conflict(
                "position",
                position.id,
                format!("expected version {}, found {}", expected_version, stored.version),
            ));
        }

        let mut updated = position.clone();
        updated.version = expected_version + 1;
        positions.insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn close_all_open(&self, reason: CloseReason, at: DateTime<Utc>) -> Result<Vec<PositionId>, StoreError> {
        let mut positions = write(&self.positions)?;
        let mut closed = Vec::new();

        for position in positions.values_mut().filter(|p| p.is_open()) {
            position.close(reason, None, at)?;
            position.version += 1;
            closed.push(position.id);
        }

        Ok(closed)
    }
}

// =============================================================================
// Order Repository Implementation
// =============================================================================

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn insert(&self, order: &Order) -> Result<(), StoreError> {
        let mut orders = write(&self.orders)?;
        if orders.values().any(|o| o.client_order_id == order.client_order_id) {
            return Err(StoreError::duplicate("order", &order.client_order_id));
        }
        orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn update(&self, order: &Order) -> Result<(), StoreError> {
        let mut orders = write(&self.orders)?;
        match orders.get_mut(&order.id) {
            Some(stored) => {
                *stored = order.clone();
                Ok(())
            },
            None => Err(StoreError::not_found("order", order.id)),
        }
    }

    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(read(&self.orders)?.get(&id).cloned())
    }

    async fn find_by_client_id(&self, client_id: &str) -> Result<Option<Order>, StoreError> {
        Ok(read(&self.orders)?.values().find(|o| o.client_order_id == client_id).cloned())
    }

    async fn find_by_position(&self, position_id: PositionId) -> Result<Vec<Order>, StoreError> {
        let mut found: Vec<Order> =
            read(&self.orders)?.values().filter(|o| o.position_id == position_id).cloned().collect();
        found.sort_by_key(|o| o.created_at);
        Ok(found)
    }

    async fn find_open(&self) -> Result<Vec<Order>, StoreError> {
        Ok(read(&self.orders)?.values().filter(|o| !o.status.is_terminal()).cloned().collect())
    }
}

// =============================================================================
// Fill Repository Implementation
// =============================================================================

#[async_trait]
impl FillRepository for MemoryStore {
    async fn append(&self, fill: &Fill) -> Result<(), StoreError> {
        write(&self.fills)?.push(fill.clone());
        Ok(())
    }

    async fn find_by_order(&self, order_id: OrderId) -> Result<Vec<Fill>, StoreError> {
        Ok(read(&self.fills)?.iter().filter(|f| f.order_id == order_id).cloned().collect())
    }
}

// =============================================================================
// Opportunity Repository Implementation
// =============================================================================

#[async_trait]
impl OpportunityRepository for MemoryStore {
    async fn insert(&self, opportunity: &Opportunity) -> Result<(), StoreError> {
        let mut opportunities = write(&self.opportunities)?;
        if opportunities.contains_key(&opportunity.id) {
            return Err(StoreError::duplicate("opportunity", opportunity.id));
        }
        opportunities.insert(opportunity.id, opportunity.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: OpportunityId) -> Result<Option<Opportunity>, StoreError> {
        Ok(read(&self.opportunities)?.get(&id).cloned())
    }

    async fn transition(
        &self,
        id: OpportunityId,
        from: OpportunityStatus,
        to: OpportunityStatus,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Opportunity, StoreError> {
        let mut opportunities = write(&self.opportunities)?;
        let stored = opportunities.get_mut(&id).ok_or_else(|| StoreError::not_found("opportunity", id))?;

        if stored.status != from {
            return Err(StoreError::conflict(
                "opportunity",
                id,
                format!("expected {:?}, found {:?}", from, stored.status),
            ));
        }

        stored.status = to;
        stored.rejection_reason = reason;
        stored.decided_at = Some(at);
        Ok(stored.clone())
    }
}

// =============================================================================
// Profit-Take Repository Implementation
// =============================================================================

#[async_trait]
impl ProfitTakeRepository for MemoryStore {
    async fn insert(&self, request: &ProfitTakeRequest) -> Result<(), StoreError> {
        let mut requests = write(&self.profit_takes)?;
        let has_pending = requests
            .values()
            .any(|r| r.position_id == request.position_id && r.status == ProfitTakeStatus::Pending);
        if has_pending {
            return Err(StoreError::duplicate("profit_take_request", request.position_id));
        }
        requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: ProfitTakeId) -> Result<Option<ProfitTakeRequest>, StoreError> {
        Ok(read(&self.profit_takes)?.get(&id).cloned())
    }

    async fn find_pending_for_position(
        &self,
        position_id: PositionId,
    ) -> Result<Option<ProfitTakeRequest>, StoreError> {
        Ok(read(&self.profit_takes)?
            .values()
            .find(|r| r.position_id == position_id && r.status == ProfitTakeStatus::Pending)
            .cloned())
    }

    async fn find_pending(&self) -> Result<Vec<ProfitTakeRequest>, StoreError> {
        Ok(read(&self.profit_takes)?
            .values()
            .filter(|r| r.status == ProfitTakeStatus::Pending)
            .cloned()
            .collect())
    }

    async fn transition(
        &self,
        id: ProfitTakeId,
        to: ProfitTakeStatus,
        at: DateTime<Utc>,
    ) -> Result<ProfitTakeRequest, StoreError> {
        let mut requests = write(&self.profit_takes)?;
        let stored = requests.get_mut(&id).ok_or_else(|| StoreError::not_found("profit_take_request", id))?;

        if stored.status != ProfitTakeStatus::Pending {
            return Err(StoreError::conflict(
                "profit_take_request",
                id,
                format!("already {:?}", stored.status),
            ));
        }

        stored.decide(to, at)?;
        Ok(stored.clone())
    }
}

// =============================================================================
// Risk Limit Repository Implementation
// =============================================================================

#[async_trait]
impl RiskLimitRepository for MemoryStore {
    async fn insert(&self, limit: &RiskLimit) -> Result<(), StoreError> {
        write(&self.risk_limits)?.push(limit.clone());
        Ok(())
    }

    async fn find_active(&self) -> Result<Vec<RiskLimit>, StoreError> {
        Ok(read(&self.risk_limits)?.iter().filter(|l| l.active).cloned().collect())
    }
}

// =============================================================================
// Idempotency Repository Implementation
// =============================================================================

#[async_trait]
impl IdempotencyRepository for MemoryStore {
    async fn find(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(read(&self.idempotency)?.get(key).cloned())
    }

    async fn put_if_absent(&self, record: &IdempotencyRecord) -> Result<Option<IdempotencyRecord>, StoreError> {
        let mut records = write(&self.idempotency)?;
        if let Some(existing) = records.get(&record.key) {
            return Ok(Some(existing.clone()));
        }
        records.insert(record.key.clone(), record.clone());
        Ok(None)
    }
}

// =============================================================================
// Store Implementation
// =============================================================================

impl Store for MemoryStore {
    fn positions(&self) -> &dyn PositionRepository {
        self
    }

    fn orders(&self) -> &dyn OrderRepository {
        self
    }

    fn fills(&self) -> &dyn FillRepository {
        self
    }

    fn opportunities(&self) -> &dyn OpportunityRepository {
        self
    }

    fn profit_takes(&self) -> &dyn ProfitTakeRepository {
        self
    }

    fn risk_limits(&self) -> &dyn RiskLimitRepository {
        self
    }

    fn idempotency(&self) -> &dyn IdempotencyRepository {
        self
    }
}

// =============================================================================
// Tests
// =============================================================================
