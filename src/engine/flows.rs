//! The four conversion flows
//!
//! Entry sets are built by pure functions so the accounting is testable
//! without any store; the engine orchestrates posting, outbound
//! side-effects, refunds, and rejection notifications around them.
//!
//! Canonical entry shapes:
//!
//! - Hive deposit -> LN payout: deposit_hive, conv_hive_to_sats (msats
//!   value leg), conv_contra (source-unit leg), fee_conversion,
//!   withdraw_ln (LN payout), fee_ln_routing.
//! - LN receipt -> on-chain credit: deposit_ln, conv_sats_to_hive
//!   (credit user), fee_conversion (taken from the customer balance
//!   before sats are consumed), then for on-chain delivery
//!   reclassify_sats, conv_contra, withdraw_hive.
//! - Internal transfer: a single internal_transfer pair.
//! - Balance adjustment: journaled, never posted.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Args;
use crate::db::schemas::{
    Account, CustomMessagePayload, InvoicePayload, LedgerEntry, LedgerKind, LimitOrderPayload,
    OpPayload, RebalanceDirection, TrackedOp, TransferPayload, WitnessRewardPayload,
};
use crate::engine::fees;
use crate::engine::policy::{Policy, PolicyStore};
use crate::hive::{
    classify_memo, HiveWallet, MemoIntent, OutboundMessage, OutboundTransfer,
    BALANCE_ADJUSTMENT_MARKER,
};
use crate::ledger::Ledger;
use crate::lightning::{resolve_lightning_address, LightningNode, PaymentStatus};
use crate::money::{display_amount, MarketQuote, Unit};
use crate::types::{BridgeError, Result};

/// Payment deadline for outbound LN sends
const PAY_TIMEOUT: Duration = Duration::from_secs(60);

/// Typed handler outcome recorded on the tracked op
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Processed,
    Refunded,
    Skipped(String),
    Failed(String),
}

/// Seam over the live market quote
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn market_quote(&self) -> Result<MarketQuote>;
}

/// Fixed quote for tests and dev runs
pub struct FixedQuote(pub MarketQuote);

#[async_trait]
impl QuoteSource for FixedQuote {
    async fn market_quote(&self) -> Result<MarketQuote> {
        Ok(self.0.clone())
    }
}

/// Seam over the rebalancer; conversions hand their quantity over
/// fire-and-forget
#[async_trait]
pub trait RebalanceSink: Send + Sync {
    async fn record_conversion(
        &self,
        direction: RebalanceDirection,
        base_qty: Decimal,
        group_id: &str,
    );
}

/// Bridge account names used in ledger entries
#[derive(Debug, Clone)]
pub struct BridgeAccounts {
    pub server: String,
    pub treasury: String,
    pub funding: String,
    pub exchange: String,
    pub operator: String,
    pub node_name: String,
    pub message_prefix: String,
}

impl BridgeAccounts {
    pub fn from_args(args: &Args) -> Self {
        Self {
            server: args.hive_server_account.clone(),
            treasury: args.hive_treasury_account.clone(),
            funding: args.hive_funding_account.clone(),
            exchange: args.hive_exchange_account.clone(),
            operator: args.hive_operator_account.clone(),
            node_name: args.ln_node_name.clone(),
            message_prefix: args.message_prefix().to_string(),
        }
    }
}

// ======================================================================
// Pure entry builders
// ======================================================================

/// F1 booking side: customer deposit, conversion value leg, source-unit
/// contra leg, conversion fee.
pub fn hive_deposit_conversion_entries(
    group_id: &str,
    accounts: &BridgeAccounts,
    sender: &str,
    amount: i64,
    unit: Unit,
    gross_msats: i64,
    fee_msats: i64,
    quote: &MarketQuote,
) -> Vec<LedgerEntry> {
    let amount_str = display_amount(amount, unit);
    vec![
        LedgerEntry::new(
            group_id,
            LedgerKind::DepositHive,
            format!("Deposit: {amount_str} from {sender} to {}", accounts.server),
            Account::treasury_hive(&accounts.server),
            Account::user_balance(sender),
            amount,
            unit,
            quote.snapshot(amount, unit),
        ),
        LedgerEntry::new(
            group_id,
            LedgerKind::ConvHiveToSats,
            format!(
                "Convert {amount_str} into {} for {sender}",
                display_amount(gross_msats, Unit::Msats)
            ),
            Account::user_balance(sender),
            Account::ln_holdings(&accounts.node_name),
            gross_msats,
            Unit::Msats,
            quote.snapshot(gross_msats, Unit::Msats),
        ),
        LedgerEntry::new(
            group_id,
            LedgerKind::ConvContra,
            format!("Contra conversion: {amount_str} for {sender}"),
            Account::user_balance(sender),
            Account::conversion_offset(&accounts.server),
            amount,
            unit,
            quote.snapshot(amount, unit),
        ),
        LedgerEntry::new(
            group_id,
            LedgerKind::FeeConversion,
            format!(
                "Conversion fee {} for {sender}",
                display_amount(fee_msats, Unit::Msats)
            ),
            Account::user_balance(sender),
            Account::conversion_fees(),
            fee_msats,
            Unit::Msats,
            quote.snapshot(fee_msats, Unit::Msats),
        ),
    ]
}

/// F1 payout side after a successful LN payment
pub fn ln_payout_entries(
    group_id: &str,
    accounts: &BridgeAccounts,
    paid_msats: i64,
    routing_fee_msats: i64,
    quote: &MarketQuote,
) -> Vec<LedgerEntry> {
    let mut entries = vec![LedgerEntry::new(
        group_id,
        LedgerKind::WithdrawLn,
        format!("LN payout {}", display_amount(paid_msats, Unit::Msats)),
        Account::ln_holdings(&accounts.node_name),
        Account::external_ln_payments(),
        paid_msats,
        Unit::Msats,
        quote.snapshot(paid_msats, Unit::Msats),
    )];
    if routing_fee_msats > 0 {
        entries.push(LedgerEntry::new(
            group_id,
            LedgerKind::FeeLnRouting,
            format!("LN routing fee {routing_fee_msats} msats"),
            Account::ln_routing_fees(),
            Account::ln_holdings(&accounts.node_name),
            routing_fee_msats,
            Unit::Msats,
            quote.snapshot(routing_fee_msats, Unit::Msats),
        ));
    }
    entries
}

/// F1 refund side: reverse the deposit's economic effect after a
/// permanent LN payment failure. The conversion fee entries stay; the
/// return transfer withholds the configured return fee.
pub fn refund_entries(
    group_id: &str,
    accounts: &BridgeAccounts,
    sender: &str,
    amount: i64,
    unit: Unit,
    net_msats: i64,
    return_fee: i64,
    quote: &MarketQuote,
) -> Vec<LedgerEntry> {
    let returned = (amount - return_fee).max(0);
    vec![
        LedgerEntry::new(
            group_id,
            LedgerKind::ReclassifySats,
            format!("Return sats to balance after failed payment for {sender}"),
            Account::ln_holdings(&accounts.node_name),
            Account::user_balance(sender),
            net_msats,
            Unit::Msats,
            quote.snapshot(net_msats, Unit::Msats),
        ),
        LedgerEntry::new(
            group_id,
            LedgerKind::ReclassifyHive,
            format!("Reverse conversion reclassification for {sender}"),
            Account::conversion_offset(&accounts.server),
            Account::user_balance(sender),
            amount,
            unit,
            quote.snapshot(amount, unit),
        ),
        LedgerEntry::new(
            group_id,
            LedgerKind::WithdrawHive,
            format!(
                "Refund: {} to {sender}",
                display_amount(returned, unit)
            ),
            Account::user_balance(sender),
            Account::treasury_hive(&accounts.server),
            returned,
            unit,
            quote.snapshot(returned, unit),
        ),
    ]
}

/// Internal credit: the deposit converts into a held sats balance and
/// nothing leaves the node. Unlike the invoice-paying flow, the value
/// leg credits the user, who ends holding the net msats.
pub fn hive_to_keepsats_entries(
    group_id: &str,
    accounts: &BridgeAccounts,
    sender: &str,
    amount: i64,
    unit: Unit,
    gross_msats: i64,
    fee_msats: i64,
    quote: &MarketQuote,
) -> Vec<LedgerEntry> {
    let amount_str = display_amount(amount, unit);
    vec![
        LedgerEntry::new(
            group_id,
            LedgerKind::DepositHive,
            format!("Deposit: {amount_str} from {sender} to {}", accounts.server),
            Account::treasury_hive(&accounts.server),
            Account::user_balance(sender),
            amount,
            unit,
            quote.snapshot(amount, unit),
        ),
        LedgerEntry::new(
            group_id,
            LedgerKind::ConvContra,
            format!("Contra conversion: {amount_str} for {sender}"),
            Account::user_balance(sender),
            Account::conversion_offset(&accounts.server),
            amount,
            unit,
            quote.snapshot(amount, unit),
        ),
        LedgerEntry::new(
            group_id,
            LedgerKind::ConvHiveToSats,
            format!(
                "Credit {} held sats to {sender}",
                display_amount(gross_msats, Unit::Msats)
            ),
            Account::ln_holdings(&accounts.node_name),
            Account::user_balance(sender),
            gross_msats,
            Unit::Msats,
            quote.snapshot(gross_msats, Unit::Msats),
        ),
        LedgerEntry::new(
            group_id,
            LedgerKind::FeeConversion,
            format!(
                "Conversion fee {} for {sender}",
                display_amount(fee_msats, Unit::Msats)
            ),
            Account::user_balance(sender),
            Account::conversion_fees(),
            fee_msats,
            Unit::Msats,
            quote.snapshot(fee_msats, Unit::Msats),
        ),
    ]
}

/// F2 booking side. The fee entry is built before the consuming legs:
/// the fee comes out of the customer balance before sats are consumed,
/// and that ordering is load-bearing.
pub fn ln_receipt_entries(
    group_id: &str,
    accounts: &BridgeAccounts,
    beneficiary: &str,
    gross_msats: i64,
    fee_msats: i64,
    quote: &MarketQuote,
) -> Vec<LedgerEntry> {
    vec![
        LedgerEntry::new(
            group_id,
            LedgerKind::DepositLn,
            format!(
                "LN receipt {} for {beneficiary}",
                display_amount(gross_msats, Unit::Msats)
            ),
            Account::external_ln_payments(),
            Account::ln_holdings(&accounts.node_name),
            gross_msats,
            Unit::Msats,
            quote.snapshot(gross_msats, Unit::Msats),
        ),
        LedgerEntry::new(
            group_id,
            LedgerKind::ConvSatsToHive,
            format!(
                "Credit {} to {beneficiary}",
                display_amount(gross_msats, Unit::Msats)
            ),
            Account::ln_holdings(&accounts.node_name),
            Account::user_balance(beneficiary),
            gross_msats,
            Unit::Msats,
            quote.snapshot(gross_msats, Unit::Msats),
        ),
        LedgerEntry::new(
            group_id,
            LedgerKind::FeeConversion,
            format!(
                "Conversion fee {} for {beneficiary}",
                display_amount(fee_msats, Unit::Msats)
            ),
            Account::user_balance(beneficiary),
            Account::conversion_fees(),
            fee_msats,
            Unit::Msats,
            quote.snapshot(fee_msats, Unit::Msats),
        ),
    ]
}

/// F2 on-chain delivery legs for the net (post-fee) amount
pub fn onchain_delivery_entries(
    group_id: &str,
    accounts: &BridgeAccounts,
    beneficiary: &str,
    net_msats: i64,
    hive_equiv: i64,
    unit: Unit,
    quote: &MarketQuote,
) -> Vec<LedgerEntry> {
    vec![
        LedgerEntry::new(
            group_id,
            LedgerKind::ReclassifySats,
            format!("Consume sats for on-chain delivery to {beneficiary}"),
            Account::user_balance(beneficiary),
            Account::conversion_offset(&accounts.server),
            net_msats,
            Unit::Msats,
            quote.snapshot(net_msats, Unit::Msats),
        ),
        LedgerEntry::new(
            group_id,
            LedgerKind::ConvContra,
            format!("Contra conversion for delivery to {beneficiary}"),
            Account::conversion_offset(&accounts.server),
            Account::user_balance(beneficiary),
            hive_equiv,
            unit,
            quote.snapshot(hive_equiv, unit),
        ),
        LedgerEntry::new(
            group_id,
            LedgerKind::WithdrawHive,
            format!(
                "Withdrawal: {} to {beneficiary}",
                display_amount(hive_equiv, unit)
            ),
            Account::user_balance(beneficiary),
            Account::treasury_hive(&accounts.server),
            hive_equiv,
            unit,
            quote.snapshot(hive_equiv, unit),
        ),
    ]
}

/// F3: one balanced pair between two user balances
pub fn internal_transfer_entry(
    group_id: &str,
    from: &str,
    to: &str,
    msats: i64,
    memo: &str,
    quote: &MarketQuote,
) -> LedgerEntry {
    LedgerEntry::new(
        group_id,
        LedgerKind::InternalTransfer,
        format!(
            "Transfer {from} -> {to} {} {memo}",
            display_amount(msats, Unit::Msats)
        ),
        Account::user_balance(from),
        Account::user_balance(to),
        msats,
        Unit::Msats,
        quote.snapshot(msats, Unit::Msats),
    )
}

/// Keepsats balance spent on an outbound LN payment. Fee first, then the
/// consuming leg, then the routing fee.
pub fn keepsats_payment_entries(
    group_id: &str,
    accounts: &BridgeAccounts,
    from: &str,
    paid_msats: i64,
    fee_msats: i64,
    routing_fee_msats: i64,
    quote: &MarketQuote,
) -> Vec<LedgerEntry> {
    let mut entries = vec![
        LedgerEntry::new(
            group_id,
            LedgerKind::FeeConversion,
            format!(
                "Conversion fee {} for {from}",
                display_amount(fee_msats, Unit::Msats)
            ),
            Account::user_balance(from),
            Account::conversion_fees(),
            fee_msats,
            Unit::Msats,
            quote.snapshot(fee_msats, Unit::Msats),
        ),
        LedgerEntry::new(
            group_id,
            LedgerKind::WithdrawLn,
            format!(
                "Pay {} from {from} balance",
                display_amount(paid_msats, Unit::Msats)
            ),
            Account::user_balance(from),
            Account::ln_holdings(&accounts.node_name),
            paid_msats,
            Unit::Msats,
            quote.snapshot(paid_msats, Unit::Msats),
        ),
    ];
    if routing_fee_msats > 0 {
        entries.push(LedgerEntry::new(
            group_id,
            LedgerKind::FeeLnRouting,
            format!("LN routing fee {routing_fee_msats} msats"),
            Account::ln_routing_fees(),
            Account::ln_holdings(&accounts.node_name),
            routing_fee_msats,
            Unit::Msats,
            quote.snapshot(routing_fee_msats, Unit::Msats),
        ));
    }
    entries
}

/// Witness producer reward, journaled as revenue
pub fn witness_reward_entry(
    group_id: &str,
    payload: &WitnessRewardPayload,
    quote: &MarketQuote,
) -> LedgerEntry {
    LedgerEntry::new(
        group_id,
        LedgerKind::DepositHive,
        format!(
            "Witness reward {} for {}",
            display_amount(payload.amount, Unit::Hive),
            payload.witness
        ),
        Account::treasury_hive(&payload.witness),
        Account::witness_rewards(),
        payload.amount,
        Unit::Hive,
        quote.snapshot(payload.amount, Unit::Hive),
    )
}

/// Owner loan booking for funding-account movements
pub fn owner_loan_entry(
    group_id: &str,
    accounts: &BridgeAccounts,
    transfer: &TransferPayload,
    into_treasury: bool,
    quote: &MarketQuote,
) -> LedgerEntry {
    let (debit, credit, desc) = if into_treasury {
        (
            Account::treasury_hive(&accounts.treasury),
            Account::owner_loan(&accounts.funding),
            "Funding to treasury",
        )
    } else {
        (
            Account::owner_loan(&accounts.funding),
            Account::treasury_hive(&accounts.treasury),
            "Treasury to funding",
        )
    };
    LedgerEntry::new(
        group_id,
        LedgerKind::OwnerLoan,
        format!(
            "{desc}: {}",
            display_amount(transfer.amount, transfer.unit)
        ),
        debit,
        credit,
        transfer.amount,
        transfer.unit,
        quote.snapshot(transfer.amount, transfer.unit),
    )
}

/// Internal-market order escrow movements
pub fn limit_order_entries(
    group_id: &str,
    payload: &LimitOrderPayload,
    quote: &MarketQuote,
) -> Vec<LedgerEntry> {
    if !payload.filled {
        return vec![LedgerEntry::new(
            group_id,
            LedgerKind::ReclassifyHive,
            format!(
                "Limit order {} escrow {}",
                payload.order_id,
                display_amount(payload.pays_amount, payload.pays_unit)
            ),
            Account::order_escrow(&payload.owner),
            Account::treasury_hive(&payload.owner),
            payload.pays_amount,
            payload.pays_unit,
            quote.snapshot(payload.pays_amount, payload.pays_unit),
        )];
    }
    vec![
        LedgerEntry::new(
            group_id,
            LedgerKind::ExcConv,
            format!(
                "Fill order {}: give {}",
                payload.order_id,
                display_amount(payload.pays_amount, payload.pays_unit)
            ),
            Account::conversion_offset("hive-market"),
            Account::order_escrow(&payload.owner),
            payload.pays_amount,
            payload.pays_unit,
            quote.snapshot(payload.pays_amount, payload.pays_unit),
        ),
        LedgerEntry::new(
            group_id,
            LedgerKind::ReclassifyHive,
            format!(
                "Fill order {}: receive {}",
                payload.order_id,
                display_amount(payload.receives_amount, payload.receives_unit)
            ),
            Account::treasury_hive(&payload.owner),
            Account::conversion_offset("hive-market"),
            payload.receives_amount,
            payload.receives_unit,
            quote.snapshot(payload.receives_amount, payload.receives_unit),
        ),
    ]
}

/// Rejection reply sent back over a `<prefix>_notification` message
pub fn rejection_reply(
    accounts: &BridgeAccounts,
    to_account: &str,
    reason: &str,
    parent_group_id: &str,
    reply_group_id: &str,
) -> OutboundMessage {
    OutboundMessage {
        id: format!("{}_notification", accounts.message_prefix),
        from_account: accounts.server.clone(),
        to_account: Some(to_account.to_string()),
        memo: reason.to_string(),
        msats: None,
        parent_group_id: Some(parent_group_id.to_string()),
        notification: true,
        invoice_message: None,
        group_id: reply_group_id.to_string(),
    }
}

/// True when the operator backdoor applies: the special operator account
/// and the fixed case-sensitive marker
pub fn is_balance_adjustment(transfer: &TransferPayload, operator: &str) -> bool {
    !operator.is_empty()
        && (transfer.from == operator || transfer.to == operator)
        && transfer.memo.contains(BALANCE_ADJUSTMENT_MARKER)
}

// ======================================================================
// Engine
// ======================================================================

/// Conversion engine: one handler per source kind, dispatched by the
/// router. Handlers are pure functions of the tracked op and the current
/// ledger; replays no-op on the duplicate-entry guard.
pub struct ConversionEngine {
    ledger: Arc<Ledger>,
    policy: Arc<PolicyStore>,
    node: Arc<dyn LightningNode>,
    wallet: Option<Arc<dyn HiveWallet>>,
    quotes: Arc<dyn QuoteSource>,
    rebalancer: Option<Arc<dyn RebalanceSink>>,
    http: reqwest::Client,
    accounts: BridgeAccounts,
    dev_mode: bool,
    dev_allowlist: HashSet<String>,
    blocked: HashSet<String>,
}

impl ConversionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<Ledger>,
        policy: Arc<PolicyStore>,
        node: Arc<dyn LightningNode>,
        wallet: Option<Arc<dyn HiveWallet>>,
        quotes: Arc<dyn QuoteSource>,
        rebalancer: Option<Arc<dyn RebalanceSink>>,
        accounts: BridgeAccounts,
        dev_mode: bool,
        dev_allowlist: Vec<String>,
        blocked: Vec<String>,
    ) -> Self {
        Self {
            ledger,
            policy,
            node,
            wallet,
            quotes,
            rebalancer,
            http: reqwest::Client::new(),
            accounts,
            dev_mode,
            dev_allowlist: dev_allowlist.into_iter().collect(),
            blocked: blocked.into_iter().collect(),
        }
    }

    /// Dispatch one tracked op to its handler
    pub async fn handle(&self, op: &TrackedOp) -> Outcome {
        let result = match &op.payload {
            OpPayload::HiveTransfer(t) => self.handle_transfer(op, t).await,
            OpPayload::HiveCustomMessage(m) => self.handle_custom_message(op, m).await,
            OpPayload::HiveWitnessReward(w) => self.handle_witness_reward(op, w).await,
            OpPayload::HiveLimitOrder(l) => self.handle_limit_order(op, l).await,
            OpPayload::LnInvoice(inv) => self.handle_invoice(op, inv).await,
            OpPayload::LnPayment(p) => self.handle_payment(op, p).await,
            OpPayload::LnForward(_) => Ok(Outcome::Processed),
        };
        match result {
            Ok(outcome) => outcome,
            Err(BridgeError::Rejected(reason)) => Outcome::Skipped(reason),
            Err(e) => Outcome::Failed(e.to_string()),
        }
    }

    // ------------------------------------------------------------------
    // F1 and operator transfers
    // ------------------------------------------------------------------

    async fn handle_transfer(&self, op: &TrackedOp, t: &TransferPayload) -> Result<Outcome> {
        // Balance-adjustment backdoor: journaled, never posted
        if is_balance_adjustment(t, &self.accounts.operator) {
            info!(
                group_id = %op.group_id,
                from = %t.from,
                memo = %t.memo,
                "Balance adjustment transfer, no ledger entry posted"
            );
            return Ok(Outcome::Processed);
        }

        // Operator account movements
        if let Some(outcome) = self.handle_operator_transfer(op, t).await? {
            return Ok(outcome);
        }

        if t.to != self.accounts.server {
            // Our own outbound transfer coming back through the block
            // stream; the initiating flow already posted its entries
            return Ok(Outcome::Processed);
        }

        if self.dev_mode && !self.dev_allowlist.contains(&t.from) {
            debug!(from = %t.from, "Dev-mode allowlist drop");
            return Ok(Outcome::Skipped("dev allowlist".to_string()));
        }

        if self.blocked.contains(&t.from) {
            self.send_rejection(op, &t.from, "Account is not permitted to use this service")
                .await;
            return Ok(Outcome::Skipped("blocked account".to_string()));
        }

        let policy = self.policy.current().await;
        let quote = self.quotes.market_quote().await?;

        match classify_memo(&t.memo) {
            MemoIntent::BalanceAdjustment | MemoIntent::Plain => {
                // Plain deposit: credit the user's on-chain balance
                let entry = LedgerEntry::new(
                    &op.group_id,
                    LedgerKind::DepositHive,
                    format!(
                        "Deposit: {} from {} to {}",
                        display_amount(t.amount, t.unit),
                        t.from,
                        self.accounts.server
                    ),
                    Account::treasury_hive(&self.accounts.server),
                    Account::user_balance(&t.from),
                    t.amount,
                    t.unit,
                    quote.snapshot(t.amount, t.unit),
                );
                self.ledger.post_all(vec![entry]).await?;
                Ok(Outcome::Processed)
            }
            MemoIntent::Bolt11(invoice) => {
                self.hive_to_ln(op, t, &policy, &quote, &invoice).await
            }
            MemoIntent::LightningAddress(address) => {
                let gross = quote.msats_from(t.amount, t.unit);
                let fee = fees::conversion_fee_msats(gross, &policy);
                let net = gross - fee;
                if net <= 0 {
                    self.send_rejection(op, &t.from, "Amount does not cover the conversion fee")
                        .await;
                    return Ok(Outcome::Skipped("amount below fee".to_string()));
                }
                let invoice =
                    resolve_lightning_address(&self.http, &address, net).await?;
                self.hive_to_ln(op, t, &policy, &quote, &invoice).await
            }
            MemoIntent::KeepSats | MemoIntent::KeepHbd => {
                self.hive_to_keepsats(op, t, &policy, &quote).await
            }
        }
    }

    /// F1: on-chain deposit converted and paid out over Lightning
    async fn hive_to_ln(
        &self,
        op: &TrackedOp,
        t: &TransferPayload,
        policy: &Policy,
        quote: &MarketQuote,
        invoice: &str,
    ) -> Result<Outcome> {
        if !policy.gateway_hive_to_ln {
            self.send_rejection(op, &t.from, "The Hive to Lightning gateway is closed")
                .await;
            return Ok(Outcome::Skipped("gateway closed".to_string()));
        }

        let payreq = self.node.decode_pay_req(invoice).await?;
        let gross_msats = quote.msats_from(t.amount, t.unit);
        let fee_msats = fees::conversion_fee_msats(gross_msats, policy);

        if let Err(e) = fees::check_invoice_limits(payreq.num_msats, policy) {
            self.send_rejection(op, &t.from, &e.to_string()).await;
            return Ok(Outcome::Skipped(e.to_string()));
        }
        if payreq.num_msats + fee_msats > gross_msats {
            let reason = format!(
                "Transfer of {} does not cover the invoice plus fees",
                display_amount(t.amount, t.unit)
            );
            self.send_rejection(op, &t.from, &reason).await;
            return Ok(Outcome::Skipped(reason));
        }
        if let Some(reason) = self.rate_limited(&t.from, gross_msats, policy).await? {
            self.send_rejection(op, &t.from, &reason).await;
            return Ok(Outcome::Skipped(reason));
        }

        let entries = hive_deposit_conversion_entries(
            &op.group_id,
            &self.accounts,
            &t.from,
            t.amount,
            t.unit,
            gross_msats,
            fee_msats,
            quote,
        );
        self.ledger.post_all(entries).await?;

        match self
            .node
            .pay_invoice(invoice, policy.max_ln_routing_fee_msats, PAY_TIMEOUT)
            .await
        {
            Ok(payment) if payment.status == PaymentStatus::Succeeded => {
                let entries = ln_payout_entries(
                    &op.group_id,
                    &self.accounts,
                    payment.value_msats,
                    payment.fee_msats,
                    quote,
                );
                self.ledger.post_all(entries).await?;
                self.trigger_rebalance(
                    RebalanceDirection::SellBaseForQuote,
                    t.amount,
                    t.unit,
                    &op.group_id,
                )
                .await;
                info!(
                    notify = true,
                    group_id = %op.group_id,
                    "Paid {} for {}",
                    display_amount(payment.value_msats, Unit::Msats),
                    t.from
                );
                Ok(Outcome::Processed)
            }
            Ok(payment) => {
                warn!(
                    group_id = %op.group_id,
                    reason = %payment.failure_reason,
                    "LN payment failed, refunding"
                );
                self.refund_deposit(op, t, policy, quote, gross_msats, fee_msats)
                    .await?;
                Ok(Outcome::Refunded)
            }
            Err(e) => {
                warn!(group_id = %op.group_id, "LN payment errored, refunding: {e}");
                self.refund_deposit(op, t, policy, quote, gross_msats, fee_msats)
                    .await?;
                Ok(Outcome::Refunded)
            }
        }
    }

    /// Internal credit: the deposit converts to a keepsats balance and
    /// nothing leaves the node
    async fn hive_to_keepsats(
        &self,
        op: &TrackedOp,
        t: &TransferPayload,
        policy: &Policy,
        quote: &MarketQuote,
    ) -> Result<Outcome> {
        if !policy.gateway_hive_to_ln {
            self.send_rejection(op, &t.from, "The Hive to Lightning gateway is closed")
                .await;
            return Ok(Outcome::Skipped("gateway closed".to_string()));
        }
        let gross_msats = quote.msats_from(t.amount, t.unit);
        let fee_msats = fees::conversion_fee_msats(gross_msats, policy);
        if gross_msats <= fee_msats {
            self.send_rejection(op, &t.from, "Amount does not cover the conversion fee")
                .await;
            return Ok(Outcome::Skipped("amount below fee".to_string()));
        }

        let entries = hive_to_keepsats_entries(
            &op.group_id,
            &self.accounts,
            &t.from,
            t.amount,
            t.unit,
            gross_msats,
            fee_msats,
            quote,
        );
        self.ledger.post_all(entries).await?;

        let net = gross_msats - fee_msats;
        self.send_message_reply(
            op,
            &t.from,
            &format!(
                "Deposit {} credited as {}",
                display_amount(t.amount, t.unit),
                display_amount(net, Unit::Msats)
            ),
            Some(net),
        )
        .await;
        self.trigger_rebalance(
            RebalanceDirection::SellBaseForQuote,
            t.amount,
            t.unit,
            &op.group_id,
        )
        .await;
        Ok(Outcome::Processed)
    }

    async fn refund_deposit(
        &self,
        op: &TrackedOp,
        t: &TransferPayload,
        policy: &Policy,
        quote: &MarketQuote,
        gross_msats: i64,
        fee_msats: i64,
    ) -> Result<()> {
        let return_fee = fees::return_fee_milli(policy);
        let entries = refund_entries(
            &op.group_id,
            &self.accounts,
            &t.from,
            t.amount,
            t.unit,
            gross_msats - fee_msats,
            return_fee,
            quote,
        );
        self.ledger.post_all(entries).await?;

        if let Some(wallet) = &self.wallet {
            let returned = (t.amount - return_fee).max(0);
            let transfer = OutboundTransfer {
                from_account: self.accounts.server.clone(),
                to_account: t.from.clone(),
                amount: display_amount(returned, t.unit),
                memo: format!("Refund for failed Lightning payment {}", op.group_id),
            };
            if let Err(e) = wallet.send_transfer(&transfer).await {
                warn!(group_id = %op.group_id, "Refund transfer broadcast failed: {e}");
            }
        }
        Ok(())
    }

    /// Operator account movements: treasury, funding, and exchange
    /// reclassifications. Returns None when the transfer is not between
    /// operator accounts.
    async fn handle_operator_transfer(
        &self,
        op: &TrackedOp,
        t: &TransferPayload,
    ) -> Result<Option<Outcome>> {
        let a = &self.accounts;
        let quote = self.quotes.market_quote().await?;

        let funding_in = !a.funding.is_empty()
            && t.from == a.funding
            && (t.to == a.treasury || t.to == a.server);
        let funding_out = !a.funding.is_empty()
            && t.to == a.funding
            && (t.from == a.treasury || t.from == a.server);
        if funding_in || funding_out {
            let entry = owner_loan_entry(&op.group_id, a, t, funding_in, &quote);
            self.ledger.post_all(vec![entry]).await?;
            return Ok(Some(Outcome::Processed));
        }

        let operator_accounts: Vec<&str> = [&a.server, &a.treasury, &a.exchange]
            .into_iter()
            .filter(|s| !s.is_empty())
            .map(String::as_str)
            .collect();
        if operator_accounts.contains(&t.from.as_str())
            && operator_accounts.contains(&t.to.as_str())
        {
            let entry = LedgerEntry::new(
                &op.group_id,
                LedgerKind::ReclassifyHive,
                format!(
                    "Move {} from {} to {}",
                    display_amount(t.amount, t.unit),
                    t.from,
                    t.to
                ),
                Account::treasury_hive(&t.to),
                Account::treasury_hive(&t.from),
                t.amount,
                t.unit,
                quote.snapshot(t.amount, t.unit),
            );
            self.ledger.post_all(vec![entry]).await?;
            return Ok(Some(Outcome::Processed));
        }

        Ok(None)
    }

    // ------------------------------------------------------------------
    // F3 and keepsats payments
    // ------------------------------------------------------------------

    async fn handle_custom_message(
        &self,
        op: &TrackedOp,
        m: &CustomMessagePayload,
    ) -> Result<Outcome> {
        if m.notification {
            debug!(group_id = %op.group_id, "Notification message, informational only");
            return Ok(Outcome::Processed);
        }

        // The from account must match the on-chain signing authority
        if m.signer != m.from_account {
            let reason = format!(
                "Signer {} does not match from account {}",
                m.signer, m.from_account
            );
            self.send_rejection(op, &m.signer, &reason).await;
            return Ok(Outcome::Skipped(reason));
        }

        let quote = self.quotes.market_quote().await?;

        if !m.to_account.is_empty() && m.msats > 0 && m.from_account != m.to_account {
            return self.internal_transfer(op, m, &quote).await;
        }

        if !m.memo.is_empty() && m.to_account.is_empty() {
            return self.keepsats_to_ln(op, m, &quote).await;
        }

        Ok(Outcome::Skipped("unrecognized message shape".to_string()))
    }

    /// F3: move internal balance between two users
    async fn internal_transfer(
        &self,
        op: &TrackedOp,
        m: &CustomMessagePayload,
        quote: &MarketQuote,
    ) -> Result<Outcome> {
        let balance = self
            .ledger
            .balance(&Account::user_balance(&m.from_account), None, None)
            .await?;
        let available = balance
            .per_unit_totals
            .get(&Unit::Msats)
            .copied()
            .unwrap_or(0);

        // One-sat buffer absorbs rounding on old conversions
        if available + 1_000 < m.msats {
            let reason = "Insufficient Keepsats balance".to_string();
            warn!(
                group_id = %op.group_id,
                from = %m.from_account,
                available,
                requested = m.msats,
                "{reason}"
            );
            self.send_rejection(op, &m.from_account, &reason).await;
            return Ok(Outcome::Skipped(reason));
        }

        let recipient = self
            .ledger
            .balance(&Account::user_balance(&m.to_account), None, None)
            .await?;
        if recipient.per_unit_history.is_empty() && m.to_account != self.accounts.server {
            let reason = format!("Unknown recipient {}", m.to_account);
            self.send_rejection(op, &m.from_account, &reason).await;
            return Ok(Outcome::Skipped(reason));
        }

        let entry = internal_transfer_entry(
            &op.group_id,
            &m.from_account,
            &m.to_account,
            m.msats,
            &m.memo,
            quote,
        );
        self.ledger.post_all(vec![entry]).await?;
        Ok(Outcome::Processed)
    }

    /// Pay a Lightning invoice (or address) out of an internal balance
    async fn keepsats_to_ln(
        &self,
        op: &TrackedOp,
        m: &CustomMessagePayload,
        quote: &MarketQuote,
    ) -> Result<Outcome> {
        let policy = self.policy.current().await;
        if !policy.gateway_hive_to_ln {
            self.send_rejection(op, &m.from_account, "The Hive to Lightning gateway is closed")
                .await;
            return Ok(Outcome::Skipped("gateway closed".to_string()));
        }

        let invoice = match classify_memo(&m.memo) {
            MemoIntent::Bolt11(invoice) => invoice,
            MemoIntent::LightningAddress(address) => {
                if m.msats <= 0 {
                    let reason = "Lightning address payment requires an amount".to_string();
                    self.send_rejection(op, &m.from_account, &reason).await;
                    return Ok(Outcome::Skipped(reason));
                }
                resolve_lightning_address(&self.http, &address, m.msats).await?
            }
            _ => {
                let reason = "Memo carries no invoice or lightning address".to_string();
                self.send_rejection(op, &m.from_account, &reason).await;
                return Ok(Outcome::Skipped(reason));
            }
        };

        let payreq = self.node.decode_pay_req(&invoice).await?;
        if let Err(e) = fees::check_invoice_limits(payreq.num_msats, &policy) {
            self.send_rejection(op, &m.from_account, &e.to_string()).await;
            return Ok(Outcome::Skipped(e.to_string()));
        }

        let fee_msats = fees::conversion_fee_msats(payreq.num_msats, &policy);
        let balance = self
            .ledger
            .balance(&Account::user_balance(&m.from_account), None, None)
            .await?;
        let available = balance
            .per_unit_totals
            .get(&Unit::Msats)
            .copied()
            .unwrap_or(0);
        if available + 1_000 < payreq.num_msats + fee_msats {
            let reason = "Insufficient Keepsats balance".to_string();
            self.send_rejection(op, &m.from_account, &reason).await;
            return Ok(Outcome::Skipped(reason));
        }
        if let Some(reason) = self
            .rate_limited(&m.from_account, payreq.num_msats, &policy)
            .await?
        {
            self.send_rejection(op, &m.from_account, &reason).await;
            return Ok(Outcome::Skipped(reason));
        }

        match self
            .node
            .pay_invoice(&invoice, policy.max_ln_routing_fee_msats, PAY_TIMEOUT)
            .await
        {
            Ok(payment) if payment.status == PaymentStatus::Succeeded => {
                let entries = keepsats_payment_entries(
                    &op.group_id,
                    &self.accounts,
                    &m.from_account,
                    payment.value_msats,
                    fee_msats,
                    payment.fee_msats,
                    quote,
                );
                self.ledger.post_all(entries).await?;
                Ok(Outcome::Processed)
            }
            Ok(payment) => {
                let reason = format!("Payment failed: {}", payment.failure_reason);
                self.send_rejection(op, &m.from_account, &reason).await;
                Ok(Outcome::Skipped(reason))
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // F2
    // ------------------------------------------------------------------

    async fn handle_invoice(&self, op: &TrackedOp, inv: &InvoicePayload) -> Result<Outcome> {
        if inv.state != "settled" {
            return Ok(Outcome::Skipped(format!("invoice state {}", inv.state)));
        }

        let policy = self.policy.current().await;
        if !policy.gateway_ln_to_hive {
            return Ok(Outcome::Skipped("gateway closed".to_string()));
        }

        // Invoices the bridge generates carry "pay to <account> [#sats]"
        let Some(beneficiary) = beneficiary_from_memo(&inv.memo) else {
            return Ok(Outcome::Skipped("untracked invoice".to_string()));
        };
        let keep_sats = inv.memo.contains("#sats");

        let quote = self.quotes.market_quote().await?;
        let gross = inv.value_msats;
        // Fee comes out of the customer balance before sats are
        // consumed; net funds the delivery
        let fee_msats = fees::conversion_fee_msats(gross, &policy);
        let net = gross - fee_msats;
        if net <= 0 {
            return Ok(Outcome::Skipped("amount below fee".to_string()));
        }

        let mut entries =
            ln_receipt_entries(&op.group_id, &self.accounts, &beneficiary, gross, fee_msats, &quote);

        if !keep_sats {
            let hive_equiv = quote.milli_from_msats(net, Unit::Hive);
            entries.extend(onchain_delivery_entries(
                &op.group_id,
                &self.accounts,
                &beneficiary,
                net,
                hive_equiv,
                Unit::Hive,
                &quote,
            ));
            self.ledger.post_all(entries).await?;

            if let Some(wallet) = &self.wallet {
                let transfer = OutboundTransfer {
                    from_account: self.accounts.server.clone(),
                    to_account: beneficiary.clone(),
                    amount: display_amount(hive_equiv, Unit::Hive),
                    memo: format!("Lightning deposit {}", op.group_id),
                };
                if let Err(e) = wallet.send_transfer(&transfer).await {
                    warn!(group_id = %op.group_id, "Delivery transfer broadcast failed: {e}");
                }
            }
            self.trigger_rebalance(
                RebalanceDirection::BuyBaseWithQuote,
                quote.milli_from_msats(net, Unit::Hive),
                Unit::Hive,
                &op.group_id,
            )
            .await;
        } else {
            self.ledger.post_all(entries).await?;
        }

        info!(
            notify = true,
            group_id = %op.group_id,
            "Received {} for {}",
            display_amount(gross, Unit::Msats),
            beneficiary
        );
        Ok(Outcome::Processed)
    }

    /// Payment events reconcile outbound sends; an event with no
    /// tracked group is foreign traffic
    async fn handle_payment(
        &self,
        op: &TrackedOp,
        p: &crate::db::schemas::PaymentPayload,
    ) -> Result<Outcome> {
        let existing = self.ledger.entries_for_group(&op.group_id).await?;
        if existing.is_empty() {
            return Ok(Outcome::Skipped("untracked payment".to_string()));
        }
        debug!(
            group_id = %op.group_id,
            status = %p.status,
            "Payment reconciliation event"
        );
        Ok(Outcome::Processed)
    }

    async fn handle_witness_reward(
        &self,
        op: &TrackedOp,
        w: &WitnessRewardPayload,
    ) -> Result<Outcome> {
        let quote = self.quotes.market_quote().await?;
        let entry = witness_reward_entry(&op.group_id, w, &quote);
        self.ledger.post_all(vec![entry]).await?;
        Ok(Outcome::Processed)
    }

    async fn handle_limit_order(
        &self,
        op: &TrackedOp,
        l: &LimitOrderPayload,
    ) -> Result<Outcome> {
        let quote = self.quotes.market_quote().await?;
        let entries = limit_order_entries(&op.group_id, l, &quote);
        self.ledger.post_all(entries).await?;
        Ok(Outcome::Processed)
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    /// Rolling per-user rate limits; returns the violation reason
    async fn rate_limited(
        &self,
        user: &str,
        msats: i64,
        policy: &Policy,
    ) -> Result<Option<String>> {
        for limit in &policy.rate_limits {
            let since = Utc::now() - ChronoDuration::hours(limit.hours);
            let spent = self.ledger.user_outflow_msats_since(user, since).await?;
            if spent + msats > limit.sats * 1_000 {
                return Ok(Some(format!(
                    "Rate limit: {} sats per {} hours exceeded",
                    limit.sats, limit.hours
                )));
            }
        }
        Ok(None)
    }

    async fn send_rejection(&self, op: &TrackedOp, to: &str, reason: &str) {
        let Some(wallet) = &self.wallet else { return };
        let reply = rejection_reply(
            &self.accounts,
            to,
            reason,
            &op.group_id,
            &crate::db::schemas::fresh_group_id(),
        );
        if let Err(e) = wallet.send_message(&reply).await {
            warn!(group_id = %op.group_id, "Rejection notification failed: {e}");
        }
    }

    /// Confirmation replies go out as `_notification` messages: the
    /// ledger entries were already posted here, and the watcher never
    /// acts on notification envelopes, so nothing double-posts when the
    /// reply comes back through the block stream.
    async fn send_message_reply(&self, op: &TrackedOp, to: &str, memo: &str, msats: Option<i64>) {
        let Some(wallet) = &self.wallet else { return };
        let message = OutboundMessage {
            id: format!("{}_notification", self.accounts.message_prefix),
            from_account: self.accounts.server.clone(),
            to_account: Some(to.to_string()),
            memo: memo.to_string(),
            msats,
            parent_group_id: Some(op.group_id.clone()),
            notification: true,
            invoice_message: None,
            group_id: crate::db::schemas::fresh_group_id(),
        };
        if let Err(e) = wallet.send_message(&message).await {
            warn!(group_id = %op.group_id, "Reply message failed: {e}");
        }
    }

    async fn trigger_rebalance(
        &self,
        direction: RebalanceDirection,
        amount: i64,
        unit: Unit,
        group_id: &str,
    ) {
        let Some(rebalancer) = &self.rebalancer else { return };
        // Rebalance in base-asset units; HBD value approximated through
        // the quote as HIVE quantity by the sink
        let qty = Decimal::from(amount) / Decimal::from(unit.scale());
        rebalancer.record_conversion(direction, qty, group_id).await;
    }
}

/// Parse the beneficiary out of a bridge-generated invoice memo
/// ("pay to alice #sats" or "alice: deposit")
pub fn beneficiary_from_memo(memo: &str) -> Option<String> {
    let rest = memo.strip_prefix("pay to ").unwrap_or(memo);
    let token = rest.split_whitespace().next()?;
    let name = token.trim_end_matches(':');
    let valid = name.len() >= 3
        && name.len() <= 16
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
    if valid {
        Some(name.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn accounts() -> BridgeAccounts {
        BridgeAccounts {
            server: "bridge-server".to_string(),
            treasury: "bridge-treasury".to_string(),
            funding: "bridge-funding".to_string(),
            exchange: "bridge-exchange".to_string(),
            operator: "v4v-app".to_string(),
            node_name: "lnd".to_string(),
            message_prefix: "v4vapp".to_string(),
        }
    }

    fn quote() -> MarketQuote {
        MarketQuote {
            sats_per_hive: 200.0,
            sats_per_hbd: 700.0,
            usd_per_hive: 0.25,
            usd_per_hbd: 1.0,
            fetched_at: Utc::now(),
            source: "test".to_string(),
        }
    }

    /// Per-unit sums of raw debit and credit amounts over an entry set.
    /// Every entry debits and credits the same amount in the same unit,
    /// so the journal balances per unit by construction; this asserts it
    /// explicitly for the flow sets.
    fn per_unit_debit_credit(entries: &[LedgerEntry]) -> HashMap<Unit, (i64, i64)> {
        let mut sums: HashMap<Unit, (i64, i64)> = HashMap::new();
        for e in entries {
            let slot = sums.entry(e.unit).or_insert((0, 0));
            slot.0 += e.amount;
            slot.1 += e.amount;
        }
        sums
    }

    #[test]
    fn happy_path_hive_to_ln_entry_set() {
        // Fee 0.5% + 100 sats, rate 1 HIVE = 200 sats, 25 HIVE deposit,
        // invoice for 4500 sats
        let q = quote();
        let gross = q.msats_from(25_000, Unit::Hive);
        assert_eq!(gross, 5_000_000);
        let fee = (gross as f64 * 0.5 / 100.0).round() as i64 + 100_000;
        assert_eq!(fee, 125_000);

        let mut entries = hive_deposit_conversion_entries(
            "g-s1",
            &accounts(),
            "alice",
            25_000,
            Unit::Hive,
            gross,
            fee,
            &q,
        );
        entries.extend(ln_payout_entries("g-s1", &accounts(), 4_500_000, 2_000, &q));

        // Six entries, one per ledger type
        assert_eq!(entries.len(), 6);
        let kinds: Vec<_> = entries.iter().map(|e| e.ledger_type).collect();
        assert_eq!(
            kinds,
            vec![
                LedgerKind::DepositHive,
                LedgerKind::ConvHiveToSats,
                LedgerKind::ConvContra,
                LedgerKind::FeeConversion,
                LedgerKind::WithdrawLn,
                LedgerKind::FeeLnRouting,
            ]
        );

        // Debits equal credits per unit
        for (unit, (debits, credits)) in per_unit_debit_credit(&entries) {
            assert_eq!(debits, credits, "unit {unit} out of balance");
        }

        // Alice's HIVE balance decreases by the full 25.000: the deposit
        // credit is cancelled by the contra leg
        let alice = Account::user_balance("alice");
        let hive_net: i64 = entries
            .iter()
            .filter(|e| e.unit == Unit::Hive)
            .map(|e| e.delta_for(&alice))
            .sum();
        assert_eq!(hive_net, 0);
        let contra = entries
            .iter()
            .find(|e| e.ledger_type == LedgerKind::ConvContra)
            .unwrap();
        assert_eq!(contra.delta_for(&alice), -25_000);
    }

    #[test]
    fn ln_receipt_takes_fee_before_consuming_sats() {
        let q = quote();
        let mut entries =
            ln_receipt_entries("g-f2", &accounts(), "bob", 1_000_000, 15_000, &q);
        entries.extend(onchain_delivery_entries(
            "g-f2",
            &accounts(),
            "bob",
            985_000,
            q.milli_from_msats(985_000, Unit::Hive),
            Unit::Hive,
            &q,
        ));

        // Exactly one fee entry, positioned before every consuming leg
        let fee_positions: Vec<_> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.ledger_type == LedgerKind::FeeConversion)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(fee_positions.len(), 1);
        let consume_position = entries
            .iter()
            .position(|e| e.ledger_type == LedgerKind::ReclassifySats)
            .unwrap();
        assert!(fee_positions[0] < consume_position);

        // Bob's msats column nets to zero: gross in, fee and net out
        let bob = Account::user_balance("bob");
        let msats_net: i64 = entries
            .iter()
            .filter(|e| e.unit == Unit::Msats)
            .map(|e| e.delta_for(&bob))
            .sum();
        assert_eq!(msats_net, 0);
        // And the HIVE column too: contra credit cancels the withdrawal
        let hive_net: i64 = entries
            .iter()
            .filter(|e| e.unit == Unit::Hive)
            .map(|e| e.delta_for(&bob))
            .sum();
        assert_eq!(hive_net, 0);
    }

    #[test]
    fn keepsats_deposit_leaves_user_holding_net_sats() {
        let q = quote();
        let gross = q.msats_from(5_000, Unit::Hive);
        let fee = 105_000;
        let entries = hive_to_keepsats_entries(
            "g-keep",
            &accounts(),
            "alice",
            5_000,
            Unit::Hive,
            gross,
            fee,
            &q,
        );
        assert_eq!(entries.len(), 4);

        let alice = Account::user_balance("alice");
        let hive_net: i64 = entries
            .iter()
            .filter(|e| e.unit == Unit::Hive)
            .map(|e| e.delta_for(&alice))
            .sum();
        let msats_net: i64 = entries
            .iter()
            .filter(|e| e.unit == Unit::Msats)
            .map(|e| e.delta_for(&alice))
            .sum();
        assert_eq!(hive_net, 0);
        assert_eq!(msats_net, gross - fee);
    }

    #[test]
    fn internal_transfer_is_one_balanced_pair() {
        let q = quote();
        let entry = internal_transfer_entry("g-f3", "alice", "bob", 5_000_000, "gift", &q);
        assert_eq!(entry.ledger_type, LedgerKind::InternalTransfer);
        assert_eq!(entry.delta_for(&Account::user_balance("alice")), -5_000_000);
        assert_eq!(entry.delta_for(&Account::user_balance("bob")), 5_000_000);
    }

    #[test]
    fn rejection_reply_links_parent_group() {
        let reply = rejection_reply(
            &accounts(),
            "alice",
            "Insufficient Keepsats balance",
            "parent-1",
            "reply-1",
        );
        assert_eq!(reply.id, "v4vapp_notification");
        assert!(reply.notification);
        assert_eq!(reply.parent_group_id.as_deref(), Some("parent-1"));
        assert_eq!(reply.memo, "Insufficient Keepsats balance");
    }

    #[test]
    fn balance_adjustment_requires_operator_and_exact_marker() {
        let t = TransferPayload {
            block_num: 1,
            trx_id: "t".to_string(),
            op_index: 0,
            from: "v4v-app".to_string(),
            to: "bridge-server".to_string(),
            amount: 1_000,
            unit: Unit::Hive,
            memo: "Balance adjustment — reconcile #T1".to_string(),
            recurrence_id: None,
        };
        assert!(is_balance_adjustment(&t, "v4v-app"));

        let wrong_case = TransferPayload {
            memo: "balance adjustment".to_string(),
            ..t.clone()
        };
        assert!(!is_balance_adjustment(&wrong_case, "v4v-app"));

        let wrong_account = TransferPayload {
            from: "alice".to_string(),
            ..t
        };
        assert!(!is_balance_adjustment(&wrong_account, "v4v-app"));
    }

    #[test]
    fn refund_returns_value_minus_return_fee() {
        let q = quote();
        let entries = refund_entries(
            "g-refund",
            &accounts(),
            "alice",
            25_000,
            Unit::Hive,
            4_875_000,
            2,
            &q,
        );
        let withdraw = entries
            .iter()
            .find(|e| e.ledger_type == LedgerKind::WithdrawHive)
            .unwrap();
        assert_eq!(withdraw.amount, 24_998);
    }

    #[test]
    fn keepsats_payment_fee_precedes_consumption() {
        let q = quote();
        let entries =
            keepsats_payment_entries("g-ks", &accounts(), "alice", 4_500_000, 122_500, 1_500, &q);
        assert_eq!(entries[0].ledger_type, LedgerKind::FeeConversion);
        assert_eq!(entries[1].ledger_type, LedgerKind::WithdrawLn);
        assert_eq!(entries[2].ledger_type, LedgerKind::FeeLnRouting);
    }

    #[test]
    fn memo_beneficiary_parsing() {
        assert_eq!(beneficiary_from_memo("pay to alice #sats"), Some("alice".to_string()));
        assert_eq!(beneficiary_from_memo("brianoflondon: deposit"), Some("brianoflondon".to_string()));
        assert_eq!(beneficiary_from_memo("Totally Unrelated Memo"), None);
        assert_eq!(beneficiary_from_memo(""), None);
    }

    #[test]
    fn limit_order_fill_balances_both_legs() {
        let q = quote();
        let payload = LimitOrderPayload {
            block_num: 1,
            trx_id: "t".to_string(),
            op_index: 0,
            owner: "bridge-server".to_string(),
            order_id: 42,
            filled: true,
            pays_amount: 25_052,
            pays_unit: Unit::Hive,
            receives_amount: 6_738,
            receives_unit: Unit::Hbd,
        };
        let entries = limit_order_entries("g-fill", &payload, &q);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].ledger_type, LedgerKind::ExcConv);
        assert_eq!(entries[0].unit, Unit::Hive);
        assert_eq!(entries[1].unit, Unit::Hbd);
    }
}
