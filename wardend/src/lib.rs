//! Warden Daemon Library
//!
//! Runtime for the trade-approval and position-reconciliation service.
//!
//! # Architecture
//!
//! ```text
//! API Server ──► ApprovalService ──► OrderTracker ──► Broker
//!     │                                   ▲
//!     ├──► Reconciler ──► Engine          │
//!     │        │  └──► PositionCloser ────┘
//!     │        └──► KillSwitch (portfolio breach)
//!     └──► Portfolio / ProfitTakes
//!
//! every state transition ──► AuditLedger (hash chain)
//! ```
//!
//! # Components
//!
//! - **Daemon**: API server plus the reconciliation scheduler
//! - **ApprovalService**: risk-capped, idempotent opportunity approval
//! - **Reconciler**: per-tick evaluation of open positions and portfolio limits
//! - **KillSwitch**: emergency cancel, liquidate and force-close
//! - **PositionCloser**: the single close path (audit, flatten)
//! - **Config**: Environment-based configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use wardend::{Config, Daemon};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let daemon = Daemon::new_stub(config).expect("Failed to build daemon");
//!     daemon.run().await.expect("Daemon error");
//! }
//! ```

#![warn(clippy::all)]

pub mod actor;
pub mod api;
pub mod approval;
pub mod closing;
pub mod config;
pub mod daemon;
pub mod error;
pub mod kill_switch;
pub mod metrics;
pub mod portfolio;
pub mod profit_take;
pub mod reconciler;
pub mod services;

// Re-exports for convenience
pub use actor::Actor;
pub use approval::{ApprovalOutcome, ProposeOpportunity};
pub use config::{ApiConfig, Config, Environment};
pub use daemon::Daemon;
pub use error::{DaemonError, DaemonResult};
pub use kill_switch::{KillSwitchReport, KillSwitchSource};
pub use reconciler::TickReport;
pub use services::Services;
