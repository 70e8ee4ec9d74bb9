//! Warden Broker Connectors
//!
//! Adapters for broker APIs (REST).
//! Normalizes broker-specific types to the execution layer's port types.

#![warn(clippy::all)]

// Public modules
pub mod alpaca_rest;

// Re-exports
pub use alpaca_rest::{AlpacaClient, AlpacaConfig, AlpacaError, AlpacaOrder, ALPACA_DATA_URL, ALPACA_PAPER_URL};
