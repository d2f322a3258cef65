//! Crate-wide error type

use thiserror::Error;

/// Error type for all bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Document store failure
    #[error("Database error: {0}")]
    Database(String),

    /// A ledger entry with the same (group_id, ledger_type) already exists
    #[error("Duplicate ledger entry: {0}")]
    DuplicateEntry(String),

    /// A ledger invariant was violated; requires operator intervention
    #[error("Ledger invariant violated: {0}")]
    LedgerInvariant(String),

    /// Cache store failure (always degraded, never fatal)
    #[error("Cache error: {0}")]
    Cache(String),

    /// Hive JSON-RPC failure
    #[error("Hive RPC error: {0}")]
    HiveRpc(String),

    /// The watcher cannot continue from its resume point
    #[error("Source out of sync: {0}")]
    OutOfSync(String),

    /// Lightning node failure
    #[error("Lightning error: {0}")]
    Lightning(String),

    /// Exchange rejected or failed a request
    #[error("Exchange error: {0}")]
    Exchange(String),

    /// Trade is below the exchange minimum lot size or notional
    #[error("Exchange order below minimum: {0}")]
    ExchangeBelowMinimum(String),

    /// Business rule rejected the operation (no ledger entry posted)
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Transient infrastructure errors are retried with backoff and
    /// surfaced as warnings; everything else is handled by type.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::Database(_)
                | BridgeError::Cache(_)
                | BridgeError::HiveRpc(_)
                | BridgeError::Lightning(_)
                | BridgeError::Exchange(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
