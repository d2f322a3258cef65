//! Conversion engine
//!
//! Business rules turning an ingested event on one side of the bridge
//! into ledger entries and an outbound action on the other side.

pub mod fees;
pub mod flows;
pub mod policy;

pub use flows::{
    BridgeAccounts, ConversionEngine, FixedQuote, Outcome, QuoteSource, RebalanceSink,
};
pub use policy::{Policy, PolicyStore, RateLimit};
