//! Lightning node seam
//!
//! Event types and the trait the watcher and engine program against.
//! Subscriptions resume by index: the protocol guarantees catch-up from
//! the last seen invoice add-index, payment index, and forward
//! timestamp, so reconnects lose nothing.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::time::Duration;

use crate::types::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceState {
    Open,
    Accepted,
    Settled,
    Canceled,
}

impl InvoiceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvoiceState::Settled | InvoiceState::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceState::Open => "open",
            InvoiceState::Accepted => "accepted",
            InvoiceState::Settled => "settled",
            InvoiceState::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LnInvoice {
    pub add_index: u64,
    pub settle_index: u64,
    pub payment_hash: String,
    pub value_msats: i64,
    pub state: InvoiceState,
    pub memo: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    InFlight,
    Succeeded,
    Failed,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::InFlight)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::InFlight => "in_flight",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LnPayment {
    pub payment_index: u64,
    pub payment_hash: String,
    pub value_msats: i64,
    pub fee_msats: i64,
    pub status: PaymentStatus,
    pub failure_reason: String,
}

#[derive(Debug, Clone)]
pub struct LnForward {
    pub timestamp_ns: u64,
    pub chan_id_in: u64,
    pub chan_id_out: u64,
    pub amt_in_msats: i64,
    pub amt_out_msats: i64,
    pub fee_msats: i64,
}

/// Decoded BOLT-11 payment request
#[derive(Debug, Clone)]
pub struct PayReq {
    pub destination: String,
    pub payment_hash: String,
    pub num_msats: i64,
    pub description: String,
    pub expiry_secs: i64,
}

#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub alias: String,
    pub identity_pubkey: String,
    pub synced_to_chain: bool,
}

/// The surface of the Lightning node the bridge consumes
#[async_trait]
pub trait LightningNode: Send + Sync {
    /// Invoice state changes from `add_index` (exclusive) onward
    async fn subscribe_invoices(&self, add_index: u64)
        -> Result<BoxStream<'static, Result<LnInvoice>>>;

    /// Outgoing payment state changes
    async fn track_payments(&self) -> Result<BoxStream<'static, Result<LnPayment>>>;

    /// Settled HTLC forwards from `start_time_ns` onward
    async fn subscribe_forwards(
        &self,
        start_time_ns: u64,
    ) -> Result<BoxStream<'static, Result<LnForward>>>;

    async fn decode_pay_req(&self, bolt11: &str) -> Result<PayReq>;

    /// Pay a BOLT-11 invoice, blocking until a terminal state
    async fn pay_invoice(
        &self,
        bolt11: &str,
        max_fee_msats: i64,
        timeout: Duration,
    ) -> Result<LnPayment>;

    /// Create an invoice; returns the BOLT-11 payment request
    async fn add_invoice(&self, value_msats: i64, memo: &str) -> Result<String>;

    async fn get_info(&self) -> Result<NodeInfo>;
}
