//! Pending rebalance accumulator
//!
//! Tracks pending/unconverted amounts for one trading pair and direction.
//! Small conversions accumulate here until both the exchange's minimum
//! lot size and minimum notional value are cleared, then a single trade
//! drains the pool. Rows race between fire-and-forget tasks, so writes
//! use an optimistic version check.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for pending rebalances
pub const PENDING_REBALANCES_COLLECTION: &str = "pending_rebalances";
/// Collection name for executed trade results
pub const REBALANCE_RESULTS_COLLECTION: &str = "rebalance_results";

/// Direction of the rebalance trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceDirection {
    /// e.g. sell HIVE for BTC (customer converted Hive value to sats)
    SellBaseForQuote,
    /// e.g. buy HIVE with BTC (customer converted sats to Hive value)
    BuyBaseWithQuote,
}

impl RebalanceDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebalanceDirection::SellBaseForQuote => "sell_base_for_quote",
            RebalanceDirection::BuyBaseWithQuote => "buy_base_with_quote",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            RebalanceDirection::SellBaseForQuote => RebalanceDirection::BuyBaseWithQuote,
            RebalanceDirection::BuyBaseWithQuote => RebalanceDirection::SellBaseForQuote,
        }
    }
}

/// Per-(base, quote, direction, exchange) accumulator row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRebalance {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub base_asset: String,
    pub quote_asset: String,
    pub direction: RebalanceDirection,
    pub exchange: String,

    /// Accumulated base-asset quantity pending conversion
    pub pending_qty: Decimal,
    /// Estimated value in the quote asset
    pub pending_quote_value: Decimal,

    /// Exchange minimums, refreshed best-effort on each touch
    pub min_qty_threshold: Decimal,
    pub min_notional_threshold: Decimal,

    /// Accumulated transactions since the last execution
    pub transaction_count: i64,
    /// Group ids of accumulated conversions, for audit
    pub transaction_ids: Vec<String>,

    /// Lifetime execution history
    pub total_executed_qty: Decimal,
    pub execution_count: i64,

    /// Optimistic concurrency version; bumped on every save
    #[serde(default)]
    pub version: i64,
}

impl PendingRebalance {
    pub fn new(
        base_asset: &str,
        quote_asset: &str,
        direction: RebalanceDirection,
        exchange: &str,
    ) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            base_asset: base_asset.to_string(),
            quote_asset: quote_asset.to_string(),
            direction,
            exchange: exchange.to_string(),
            pending_qty: Decimal::ZERO,
            pending_quote_value: Decimal::ZERO,
            min_qty_threshold: Decimal::ZERO,
            min_notional_threshold: Decimal::ZERO,
            transaction_count: 0,
            transaction_ids: Vec::new(),
            total_executed_qty: Decimal::ZERO,
            execution_count: 0,
            version: 0,
        }
    }

    /// Filter matching this row's identity
    pub fn identity_filter(&self) -> Document {
        doc! {
            "base_asset": &self.base_asset,
            "quote_asset": &self.quote_asset,
            "direction": self.direction.as_str(),
            "exchange": &self.exchange,
        }
    }

    /// Add a pending amount to be converted
    pub fn add_pending(&mut self, qty: Decimal, quote_value: Decimal, group_id: &str) {
        self.pending_qty += qty;
        self.pending_quote_value += quote_value;
        self.transaction_count += 1;
        self.transaction_ids.push(group_id.to_string());
    }

    /// Check whether the accumulated amount meets both thresholds
    pub fn can_execute(&self) -> (bool, String) {
        if self.pending_qty <= Decimal::ZERO {
            return (false, "No pending quantity".to_string());
        }
        if self.pending_qty < self.min_qty_threshold {
            return (
                false,
                format!(
                    "Pending qty {} {} below minimum {}",
                    self.pending_qty, self.base_asset, self.min_qty_threshold
                ),
            );
        }
        if self.pending_quote_value < self.min_notional_threshold {
            return (
                false,
                format!(
                    "Pending notional {} {} below minimum {}",
                    self.pending_quote_value, self.quote_asset, self.min_notional_threshold
                ),
            );
        }
        (true, "OK".to_string())
    }

    /// Reset pending amounts after a successful execution, carrying any
    /// unfilled remainder forward with a proportional notional estimate.
    pub fn reset_after_execution(&mut self, executed_qty: Decimal) {
        self.total_executed_qty += executed_qty;
        self.execution_count += 1;

        let remainder = self.pending_qty - executed_qty;
        if remainder > Decimal::ZERO {
            self.pending_qty = remainder;
            if remainder + executed_qty > Decimal::ZERO {
                let ratio = remainder / (remainder + executed_qty);
                self.pending_quote_value *= ratio;
            }
        } else {
            self.pending_qty = Decimal::ZERO;
            self.pending_quote_value = Decimal::ZERO;
        }

        self.transaction_ids.clear();
        self.transaction_count = 0;
    }

    /// Zero the pool after its quantity was consumed offsetting the
    /// opposite direction in a net execution.
    pub fn consume_for_netting(&mut self) {
        self.pending_qty = Decimal::ZERO;
        self.pending_quote_value = Decimal::ZERO;
        self.transaction_ids.clear();
        self.transaction_count = 0;
    }

    pub fn symbol(&self) -> String {
        format!("{}{}", self.base_asset, self.quote_asset)
    }

    pub fn log_str(&self) -> String {
        let (ready, _) = self.can_execute();
        let status = if ready { "ready" } else { "pending" };
        format!(
            "PendingRebalance [{status}]: {} {} {} (~{} {}) on {}, {} txns accumulated",
            self.direction.as_str(),
            self.pending_qty,
            self.base_asset,
            self.pending_quote_value,
            self.quote_asset,
            self.exchange,
            self.transaction_count
        )
    }
}

impl IntoIndexes for PendingRebalance {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "base_asset": 1, "quote_asset": 1, "direction": 1, "exchange": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("pair_direction_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for PendingRebalance {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

/// Audit record for an executed rebalance trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceResultDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub exchange: String,
    pub symbol: String,
    pub direction: RebalanceDirection,
    pub executed_qty: Decimal,
    pub quote_received: Decimal,
    pub avg_price: Decimal,
    pub fee: Decimal,
    pub fee_asset: String,
    /// Group id the trade was keyed to in the ledger
    pub group_id: String,
    /// Conversions absorbed by this trade
    pub absorbed_group_ids: Vec<String>,
}

impl IntoIndexes for RebalanceResultDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "group_id": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("group_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for RebalanceResultDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
