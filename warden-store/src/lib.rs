//! Warden Storage Layer
//!
//! Provides persistence for positions, orders, fills, opportunities,
//! profit-take requests, risk limits and idempotency keys.
//!
//! # Architecture
//!
//! - **Repository traits**: Define the storage interface (ports)
//! - **In-memory store**: Implementation for tests and single-process runs
//!
//! # Usage
//!
//! ```rust
//! use warden_store::{MemoryStore, Store};
//! use warden_domain::{EntryPlan, Position, Price, Quantity, Side, Symbol};
//! use rust_decimal_macros::dec;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = MemoryStore::new();
//!
//!     let plan = EntryPlan::new(
//!         Side::Long,
//!         Price::new(dec!(100)).unwrap(),
//!         Price::new(dec!(95)).unwrap(),
//!         Price::new(dec!(110)).unwrap(),
//!     )
//!     .unwrap();
//!     let position = Position::open(
//!         Symbol::new("AAPL").unwrap(),
//!         Side::Long,
//!         Quantity::new(dec!(1)).unwrap(),
//!         &plan,
//!         None,
//!         chrono::Utc::now(),
//!     );
//!     store.positions().insert(&position).await.unwrap();
//!
//!     let open = store.positions().find_open().await.unwrap();
//!     println!("Open positions: {}", open.len());
//! }
//! ```

#![warn(clippy::all)]

// Modules
mod error;
mod memory;
mod repository;

// Re-exports
pub use error::StoreError;
pub use memory::MemoryStore;
pub use repository::{
    FillRepository, IdempotencyRepository, OpportunityRepository, OrderRepository,
    PositionRepository, ProfitTakeRepository, RiskLimitRepository, Store,
};
