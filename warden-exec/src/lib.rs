//! Warden Execution Layer
//!
//! Broker-facing order placement with retry, fill tracking and audit.
//!
//! # Architecture
//!
//! ```text
//! Daemon service → OrderTracker → retry(BrokerPort) → Broker
//!                       │
//!                       ├── Store (orders, fills, entry position)
//!                       └── AuditLedger (before/after every broker call)
//! ```
//!
//! # Components
//!
//! - **Ports**: Traits for the broker and the narrative generator
//! - **Retry**: Bounded backoff for rate-limit / server errors
//! - **OrderTracker**: Idempotent placement and fill polling
//! - **Narrative**: Generator call with a templated fallback
//! - **Stub**: Test implementations for development
//!
//! # Example
//!
//! ```rust,ignore
//! use warden_exec::{OrderTracker, StubBroker, TrackerConfig};
//! use warden_eventlog::AuditLedger;
//! use warden_store::MemoryStore;
//! use std::sync::Arc;
//!
//! let broker = Arc::new(StubBroker::new());
//! let store = Arc::new(MemoryStore::new());
//! let tracker = OrderTracker::new(broker, store, AuditLedger::in_memory(), TrackerConfig::default());
//!
//! let order = tracker.place_and_track(request).await?;
//! ```

#![warn(clippy::all)]

pub mod error;
pub mod narrative;
pub mod order_tracker;
pub mod ports;
pub mod retry;
pub mod stub;

// Re-exports for convenience
pub use error::{ExecError, ExecResult};
pub use narrative::{fallback_narrative, narrate_or_fallback};
pub use order_tracker::{OrderTracker, PlaceOrder, TrackerConfig};
pub use ports::{
    BrokerOrderAck, BrokerOrderReport, BrokerOrderRequest, BrokerOrderStatus, BrokerPort,
    NarrativeContext, NarrativePort,
};
pub use retry::{retry, Backoff, RetryPolicy};
pub use stub::{FillScript, StubBroker, StubFailure, StubNarrator};
