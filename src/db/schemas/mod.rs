//! Database schemas for satbridge
//!
//! Defines MongoDB document structures for tracked operations, ledger
//! entries, pending rebalances, error codes, rates, and watcher cursors.

mod cursor;
mod error_code;
mod ledger_entry;
mod metadata;
mod pending_rebalance;
mod rate;
mod tracked_op;

pub use cursor::{
    BlockMarker, LightningCursor, BLOCK_MARKERS_COLLECTION, WATCH_CURSORS_COLLECTION,
};
pub use error_code::{ErrorCodeDoc, ERROR_CODES_COLLECTION};
pub use ledger_entry::{
    Account, AccountType, LedgerEntry, LedgerKind, LEDGER_COLLECTION,
};
pub use metadata::Metadata;
pub use pending_rebalance::{
    PendingRebalance, RebalanceDirection, RebalanceResultDoc, PENDING_REBALANCES_COLLECTION,
    REBALANCE_RESULTS_COLLECTION,
};
pub use rate::{RatePoint, RATES_COLLECTION};
pub use tracked_op::{
    fresh_group_id, hive_group_id, ln_group_id, short_id, CustomMessagePayload, ForwardPayload,
    InvoicePayload, LimitOrderPayload, OpPayload, OpState, PaymentPayload, SourceKind, TrackedOp,
    TransferPayload, WitnessRewardPayload, TRACKED_OPS_COLLECTION,
};
