//! Double-entry ledger row
//!
//! One balanced debit/credit pair posted under one group id and one
//! ledger type. Entries are immutable once saved; the unique index on
//! (group_id, ledger_type) is the idempotency guard for every flow.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::money::{RateSnapshot, Unit};
use crate::types::{BridgeError, Result};

/// Collection name for the ledger
pub const LEDGER_COLLECTION: &str = "ledger";

/// Double-entry account classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountType {
    Asset,
    Liability,
    Equity,
    Revenue,
    Expense,
}

impl AccountType {
    /// Debit-normal accounts grow when debited
    pub fn is_debit_normal(&self) -> bool {
        matches!(self, AccountType::Asset | AccountType::Expense)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Asset => "Asset",
            AccountType::Liability => "Liability",
            AccountType::Equity => "Equity",
            AccountType::Revenue => "Revenue",
            AccountType::Expense => "Expense",
        }
    }
}

/// A ledger account: (type, name, sub)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Account {
    pub account_type: AccountType,
    pub name: String,
    #[serde(default)]
    pub sub: String,
    /// Contra accounts carry the opposite normal balance
    #[serde(default)]
    pub contra: bool,
}

impl Account {
    pub fn new(account_type: AccountType, name: &str, sub: &str) -> Self {
        Self {
            account_type,
            name: name.to_string(),
            sub: sub.to_string(),
            contra: false,
        }
    }

    pub fn contra(mut self) -> Self {
        self.contra = true;
        self
    }

    // Well-known bridge accounts

    pub fn treasury_hive(sub: &str) -> Self {
        Self::new(AccountType::Asset, "Treasury Hive", sub)
    }

    pub fn user_balance(user: &str) -> Self {
        Self::new(AccountType::Liability, "User Balance", user)
    }

    pub fn ln_holdings(node: &str) -> Self {
        Self::new(AccountType::Asset, "LN Holdings", node)
    }

    pub fn external_ln_payments() -> Self {
        Self::new(AccountType::Asset, "External LN Payments", "").contra()
    }

    pub fn conversion_fees() -> Self {
        Self::new(AccountType::Revenue, "Conversion Fees", "")
    }

    pub fn ln_routing_fees() -> Self {
        Self::new(AccountType::Expense, "LN Routing Fees", "")
    }

    pub fn conversion_offset(sub: &str) -> Self {
        Self::new(AccountType::Asset, "Conversion Offset", sub).contra()
    }

    pub fn exchange_base(exchange: &str) -> Self {
        Self::new(AccountType::Asset, "Exchange Hive Holdings", exchange)
    }

    pub fn exchange_quote(exchange: &str) -> Self {
        Self::new(AccountType::Asset, "Exchange BTC Holdings", exchange)
    }

    pub fn exchange_fees() -> Self {
        Self::new(AccountType::Expense, "Exchange Fees", "")
    }

    pub fn owner_loan(sub: &str) -> Self {
        Self::new(AccountType::Liability, "Owner Loan", sub)
    }

    pub fn witness_rewards() -> Self {
        Self::new(AccountType::Revenue, "Witness Rewards", "")
    }

    pub fn order_escrow(owner: &str) -> Self {
        Self::new(AccountType::Asset, "Order Escrow", owner)
    }

    /// Mongo sub-document for filters on debit/credit fields
    pub fn as_filter(&self, side: &str) -> Document {
        let mut filter = Document::new();
        filter.insert(format!("{side}.account_type"), self.account_type.as_str());
        filter.insert(format!("{side}.name"), self.name.clone());
        filter.insert(format!("{side}.sub"), self.sub.clone());
        filter
    }
}

impl std::fmt::Display for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.sub.is_empty() {
            write!(f, "{}: {}", self.account_type.as_str(), self.name)
        } else {
            write!(f, "{}: {} / {}", self.account_type.as_str(), self.name, self.sub)
        }
    }
}

/// Ledger entry types. One business action may post several entries under
/// the same group id, each with a distinct type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    DepositHive,
    DepositLn,
    WithdrawHive,
    WithdrawLn,
    ConvHiveToSats,
    ConvSatsToHive,
    ConvContra,
    InternalTransfer,
    FeeConversion,
    FeeLnRouting,
    FeeExpense,
    ExcConv,
    ExcFee,
    OwnerLoan,
    ReclassifySats,
    ReclassifyHive,
    BalanceAdjustmentNoop,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::DepositHive => "deposit_hive",
            LedgerKind::DepositLn => "deposit_ln",
            LedgerKind::WithdrawHive => "withdraw_hive",
            LedgerKind::WithdrawLn => "withdraw_ln",
            LedgerKind::ConvHiveToSats => "conv_hive_to_sats",
            LedgerKind::ConvSatsToHive => "conv_sats_to_hive",
            LedgerKind::ConvContra => "conv_contra",
            LedgerKind::InternalTransfer => "internal_transfer",
            LedgerKind::FeeConversion => "fee_conversion",
            LedgerKind::FeeLnRouting => "fee_ln_routing",
            LedgerKind::FeeExpense => "fee_expense",
            LedgerKind::ExcConv => "exc_conv",
            LedgerKind::ExcFee => "exc_fee",
            LedgerKind::OwnerLoan => "owner_loan",
            LedgerKind::ReclassifySats => "reclassify_sats",
            LedgerKind::ReclassifyHive => "reclassify_hive",
            LedgerKind::BalanceAdjustmentNoop => "balance_adjustment_noop",
        }
    }
}

/// One balanced double-entry row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub group_id: String,
    pub short_id: String,
    pub ledger_type: LedgerKind,
    pub timestamp: bson::DateTime,
    pub description: String,

    pub debit: Account,
    pub credit: Account,

    /// Integer amount in the smallest unit of `unit`
    pub amount: i64,
    pub unit: Unit,

    /// Cross-rate snapshot frozen at post time
    pub conv: RateSnapshot,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl LedgerEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        group_id: &str,
        ledger_type: LedgerKind,
        description: String,
        debit: Account,
        credit: Account,
        amount: i64,
        unit: Unit,
        conv: RateSnapshot,
    ) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            short_id: super::tracked_op::short_id(group_id),
            group_id: group_id.to_string(),
            ledger_type,
            timestamp: bson::DateTime::now(),
            description,
            debit,
            credit,
            amount,
            unit,
            conv,
            notes: None,
        }
    }

    /// Validate the entry before posting
    pub fn validate(&self) -> Result<()> {
        if self.amount <= 0 {
            return Err(BridgeError::LedgerInvariant(format!(
                "non-positive amount {} for {} {}",
                self.amount,
                self.group_id,
                self.ledger_type.as_str()
            )));
        }
        if self.debit.name.is_empty() || self.credit.name.is_empty() {
            return Err(BridgeError::LedgerInvariant(format!(
                "unnamed account on {} {}",
                self.group_id,
                self.ledger_type.as_str()
            )));
        }
        Ok(())
    }

    /// Signed effect of this entry on `account`'s balance in `self.unit`.
    ///
    /// Debits grow debit-normal accounts; credits grow credit-normal
    /// accounts; contra flips the sign. Zero when the entry does not
    /// touch the account.
    pub fn delta_for(&self, account: &Account) -> i64 {
        let mut delta = 0;
        if accounts_match(&self.debit, account) {
            delta += side_sign(&self.debit, true) * self.amount;
        }
        if accounts_match(&self.credit, account) {
            delta += side_sign(&self.credit, false) * self.amount;
        }
        delta
    }

    pub fn log_str(&self) -> String {
        format!(
            "{} | {} | {} {} | {} -> {} | {}",
            self.short_id,
            self.ledger_type.as_str(),
            self.amount,
            self.unit,
            self.debit,
            self.credit,
            self.description
        )
    }
}

fn accounts_match(a: &Account, b: &Account) -> bool {
    a.account_type == b.account_type && a.name == b.name && a.sub == b.sub
}

fn side_sign(account: &Account, is_debit: bool) -> i64 {
    let mut normal_debit = account.account_type.is_debit_normal();
    if account.contra {
        normal_debit = !normal_debit;
    }
    if is_debit == normal_debit {
        1
    } else {
        -1
    }
}

impl IntoIndexes for LedgerEntry {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            // One entry per (group, type) slot
            (
                doc! { "group_id": 1, "ledger_type": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("group_type_unique".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "debit.account_type": 1, "debit.name": 1, "debit.sub": 1 },
                Some(
                    IndexOptions::builder()
                        .name("debit_account_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "credit.account_type": 1, "credit.name": 1, "credit.sub": 1 },
                Some(
                    IndexOptions::builder()
                        .name("credit_account_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "timestamp": 1 },
                Some(
                    IndexOptions::builder()
                        .name("timestamp_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for LedgerEntry {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
