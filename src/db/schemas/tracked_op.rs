//! Tracked operation envelope
//!
//! Every event crossing the ingestion boundary is normalized into a
//! `TrackedOp` identified by a stable group id. The same group id is
//! carried into any on-chain message the bridge sends, so reply events
//! reattach to the chain that caused them. The journal's unique index on
//! (group_id, source_kind) makes duplicate replay a no-op.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::money::Unit;
use crate::types::{BridgeError, Result};

/// Collection name for the event journal
pub const TRACKED_OPS_COLLECTION: &str = "tracked_ops";

/// Where a tracked operation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    HiveTransfer,
    HiveCustomMessage,
    HiveWitnessReward,
    HiveLimitOrder,
    LnInvoice,
    LnPayment,
    LnForward,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::HiveTransfer => "hive_transfer",
            SourceKind::HiveCustomMessage => "hive_custom_message",
            SourceKind::HiveWitnessReward => "hive_witness_reward",
            SourceKind::HiveLimitOrder => "hive_limit_order",
            SourceKind::LnInvoice => "ln_invoice",
            SourceKind::LnPayment => "ln_payment",
            SourceKind::LnForward => "ln_forward",
        }
    }
}

/// Processing state, advanced only by the router and the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpState {
    Ingested,
    Routed,
    Processed,
    Failed,
    Skipped,
}

impl OpState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpState::Ingested => "ingested",
            OpState::Routed => "routed",
            OpState::Processed => "processed",
            OpState::Failed => "failed",
            OpState::Skipped => "skipped",
        }
    }

    /// Transitions are monotonic: Ingested -> Routed -> terminal.
    /// Routed -> Ingested is the single exception, releasing a claim a
    /// cancelled worker could not finish.
    pub fn can_transition_to(&self, next: OpState) -> bool {
        matches!(
            (self, next),
            (OpState::Ingested, OpState::Routed)
                | (OpState::Routed, OpState::Processed)
                | (OpState::Routed, OpState::Failed)
                | (OpState::Routed, OpState::Skipped)
                | (OpState::Routed, OpState::Ingested)
        )
    }
}

/// On-chain transfer of HIVE or HBD
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferPayload {
    pub block_num: u64,
    pub trx_id: String,
    pub op_index: u32,
    pub from: String,
    pub to: String,
    /// Smallest units (1/1000 HIVE or HBD)
    pub amount: i64,
    pub unit: Unit,
    pub memo: String,
    /// Recurrent-transfer fills carry the schedule id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrence_id: Option<u64>,
}

/// Signed custom-json message carrying a bridge envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomMessagePayload {
    pub block_num: u64,
    pub trx_id: String,
    pub op_index: u32,
    /// The message's on-chain id (`<prefix>_transfer` or `<prefix>_notification`)
    pub message_id: String,
    /// Account that signed (first required posting auth)
    pub signer: String,
    pub from_account: String,
    #[serde(default)]
    pub to_account: String,
    #[serde(default)]
    pub msats: i64,
    #[serde(default)]
    pub memo: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_group_id: Option<String>,
    /// Informational messages are journaled but never acted on
    #[serde(default)]
    pub notification: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_message: Option<String>,
}

/// Witness block-production reward
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WitnessRewardPayload {
    pub block_num: u64,
    pub witness: String,
    /// Reward expressed in 1/1000 HIVE at the current vesting ratio
    pub amount: i64,
}

/// Internal-market limit order create or fill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitOrderPayload {
    pub block_num: u64,
    pub trx_id: String,
    pub op_index: u32,
    pub owner: String,
    pub order_id: u64,
    /// True for fills, false for order creation
    pub filled: bool,
    /// Amount leaving the owner (smallest units)
    pub pays_amount: i64,
    pub pays_unit: Unit,
    /// Amount received or asked for (smallest units)
    pub receives_amount: i64,
    pub receives_unit: Unit,
}

/// Lightning invoice state change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoicePayload {
    pub add_index: u64,
    #[serde(default)]
    pub settle_index: u64,
    pub payment_hash: String,
    pub value_msats: i64,
    /// open, settled, canceled, accepted
    pub state: String,
    #[serde(default)]
    pub memo: String,
}

/// Lightning payment state change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentPayload {
    pub payment_index: u64,
    pub payment_hash: String,
    pub value_msats: i64,
    #[serde(default)]
    pub fee_msats: i64,
    /// in_flight, succeeded, failed
    pub status: String,
    #[serde(default)]
    pub failure_reason: String,
}

/// Settled HTLC forward through the node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardPayload {
    pub timestamp_ns: u64,
    pub chan_id_in: u64,
    pub chan_id_out: u64,
    pub amt_in_msats: i64,
    pub amt_out_msats: i64,
    pub fee_msats: i64,
}

/// Source-specific payload, opaque to the envelope layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpPayload {
    HiveTransfer(TransferPayload),
    HiveCustomMessage(CustomMessagePayload),
    HiveWitnessReward(WitnessRewardPayload),
    HiveLimitOrder(LimitOrderPayload),
    LnInvoice(InvoicePayload),
    LnPayment(PaymentPayload),
    LnForward(ForwardPayload),
}

impl OpPayload {
    pub fn source_kind(&self) -> SourceKind {
        match self {
            OpPayload::HiveTransfer(_) => SourceKind::HiveTransfer,
            OpPayload::HiveCustomMessage(_) => SourceKind::HiveCustomMessage,
            OpPayload::HiveWitnessReward(_) => SourceKind::HiveWitnessReward,
            OpPayload::HiveLimitOrder(_) => SourceKind::HiveLimitOrder,
            OpPayload::LnInvoice(_) => SourceKind::LnInvoice,
            OpPayload::LnPayment(_) => SourceKind::LnPayment,
            OpPayload::LnForward(_) => SourceKind::LnForward,
        }
    }
}

/// Normalized event envelope persisted to the journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedOp {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    /// Stable id linking this event to every downstream effect
    pub group_id: String,

    /// Human-readable prefix of the group id
    pub short_id: String,

    pub source_kind: SourceKind,

    /// When the event happened at the source
    pub source_timestamp: bson::DateTime,

    /// When the watcher ingested it
    pub ingested_timestamp: bson::DateTime,

    pub state: OpState,

    pub payload: OpPayload,

    /// Links replies back to the operation that caused them
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_group_id: Option<String>,

    /// Handler wall-clock time, set when Processed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_time_ms: Option<i64>,

    /// Preserved error, set when Failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Reason, set when Skipped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl TrackedOp {
    pub fn new(
        group_id: String,
        source_timestamp: chrono::DateTime<chrono::Utc>,
        payload: OpPayload,
    ) -> Self {
        let short_id = short_id(&group_id);
        Self {
            _id: None,
            metadata: Metadata::new(),
            short_id,
            source_kind: payload.source_kind(),
            source_timestamp: bson::DateTime::from_chrono(source_timestamp),
            ingested_timestamp: bson::DateTime::now(),
            state: OpState::Ingested,
            payload,
            group_id,
            parent_group_id: None,
            process_time_ms: None,
            last_error: None,
            skip_reason: None,
        }
    }

    pub fn with_parent(mut self, parent_group_id: Option<String>) -> Self {
        self.parent_group_id = parent_group_id;
        self
    }

    /// Advance the state, enforcing monotonic transitions
    pub fn advance(&mut self, next: OpState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(BridgeError::LedgerInvariant(format!(
                "illegal state transition {} -> {} for {}",
                self.state.as_str(),
                next.as_str(),
                self.group_id
            )));
        }
        self.state = next;
        Ok(())
    }
}

/// Fresh group id for operations the bridge initiates
pub fn fresh_group_id() -> String {
    Uuid::new_v4().to_string()
}

/// Deterministic group id for a pure inbound Hive operation
pub fn hive_group_id(block_num: u64, trx_id: &str, op_index: u32) -> String {
    let natural = format!("{block_num}:{trx_id}:{op_index}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, natural.as_bytes()).to_string()
}

/// Deterministic group id for a pure inbound Lightning event
pub fn ln_group_id(payment_hash: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, payment_hash.as_bytes()).to_string()
}

/// Human-readable prefix of a group id
pub fn short_id(group_id: &str) -> String {
    group_id.chars().take(8).collect()
}

impl IntoIndexes for TrackedOp {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            // One journal row per source event
            (
                doc! { "group_id": 1, "source_kind": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("group_source_unique".to_string())
                        .build(),
                ),
            ),
            // Router claims Ingested rows in source-timestamp order
            (
                doc! { "state": 1, "source_timestamp": 1 },
                Some(
                    IndexOptions::builder()
                        .name("state_ts_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "parent_group_id": 1 },
                Some(
                    IndexOptions::builder()
                        .name("parent_group_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for TrackedOp {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn transfer_payload() -> OpPayload {
        OpPayload::HiveTransfer(TransferPayload {
            block_num: 1000,
            trx_id: "abc123".to_string(),
            op_index: 0,
            from: "alice".to_string(),
            to: "bridge-server".to_string(),
            amount: 25_000,
            unit: Unit::Hive,
            memo: "test".to_string(),
            recurrence_id: None,
        })
    }

    #[test]
    fn hive_group_id_is_deterministic() {
        let a = hive_group_id(1000, "abc123", 0);
        let b = hive_group_id(1000, "abc123", 0);
        let c = hive_group_id(1000, "abc123", 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn ln_group_id_matches_payment_hash() {
        let a = ln_group_id("deadbeef");
        let b = ln_group_id("deadbeef");
        assert_eq!(a, b);
        assert_ne!(a, ln_group_id("cafebabe"));
    }

    #[test]
    fn state_transitions_are_monotonic() {
        let mut op = TrackedOp::new(fresh_group_id(), Utc::now(), transfer_payload());
        assert!(op.advance(OpState::Processed).is_err());
        op.advance(OpState::Routed).unwrap();
        op.advance(OpState::Processed).unwrap();
        // Terminal states never move
        assert!(op.advance(OpState::Failed).is_err());
        assert!(op.advance(OpState::Routed).is_err());
    }

    #[test]
    fn routed_releases_back_to_ingested() {
        let mut op = TrackedOp::new(fresh_group_id(), Utc::now(), transfer_payload());
        op.advance(OpState::Routed).unwrap();
        op.advance(OpState::Ingested).unwrap();
        op.advance(OpState::Routed).unwrap();
        op.advance(OpState::Skipped).unwrap();
    }

    #[test]
    fn short_id_is_group_prefix() {
        let op = TrackedOp::new(fresh_group_id(), Utc::now(), transfer_payload());
        assert_eq!(op.short_id, op.group_id[..8]);
    }
}
