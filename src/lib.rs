//! Satbridge - value bridge between Hive and a Lightning node
//!
//! Satbridge watches two event sources (the Hive block stream and a
//! Lightning node's invoice/payment/forward streams), normalizes everything
//! it sees into tracked operations, and runs them through a conversion
//! engine that posts balanced double-entry ledger records and schedules
//! outbound side-effects on the opposite side of the bridge.
//!
//! ## Services
//!
//! - **Hive watcher**: resumable block stream with bulk catch-up
//! - **Lightning watcher**: invoice, payment, and forward subscriptions
//! - **Router**: single consumer dispatching tracked operations
//! - **Engine**: the four conversion flows, fees, limits, gateway flags
//! - **Ledger**: append-only double-entry journal over MongoDB
//! - **Cache**: generation-invalidated balance cache over Redis
//! - **Rebalancer**: sub-minimum trade accumulator for the spot exchange
//! - **Notify**: out-of-band notification fan-out with rate limiting

pub mod config;
pub mod db;
pub mod engine;
pub mod hive;
pub mod ledger;
pub mod lightning;
pub mod logging;
pub mod money;
pub mod notify;
pub mod rebalance;
pub mod router;
pub mod types;

pub use config::Args;
pub use types::{BridgeError, Result};
