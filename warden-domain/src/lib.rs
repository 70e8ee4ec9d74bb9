//! Warden Domain Layer
//!
//! Pure domain logic with zero I/O dependencies.
//! Contains entities, value objects, the trailing-stop ratchet and risk sizing.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Public modules
pub mod entities;
pub mod risk;
pub mod trailing;
pub mod value_objects;

// Re-export commonly used types
pub use entities::{
    client_order_id, CloseReason, Fill, IdempotencyRecord, Opportunity, OpportunityId,
    OpportunityStatus, Order, OrderId, OrderPurpose, OrderStatus, OrderType, Position, PositionId,
    PositionStatus, ProfitTakeId, ProfitTakeRequest, ProfitTakeStatus, StopState,
};
pub use risk::{ExposureLeg, RiskCaps};
pub use trailing::TrailUpdate;
pub use value_objects::{
    CapType, DomainError, EntryPlan, OrderSide, Price, Quantity, RiskLimit, RiskScope, Side, Symbol,
};
