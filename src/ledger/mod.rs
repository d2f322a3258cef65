//! Append-only double-entry ledger
//!
//! Posts validated entries, answers balance queries by aggregation over
//! the journal, and keeps the balance cache coherent by bumping its
//! generation counter on every write.

pub mod cache;

use bson::doc;
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::db::schemas::{Account, LedgerEntry, OpState, TrackedOp};
use crate::db::MongoCollection;
use crate::money::Unit;
use crate::types::{BridgeError, Result};

pub use cache::BalanceCache;

/// One history line in a balance report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceLine {
    pub timestamp: DateTime<Utc>,
    pub ledger_type: String,
    pub unit: Unit,
    pub delta: i64,
    pub description: String,
}

/// Balance snapshot for one account
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LedgerAccountDetails {
    /// Net position per unit, in smallest integer units. Units are never
    /// summed together; the display layer shows one column per unit.
    pub per_unit_totals: HashMap<Unit, i64>,
    pub per_unit_history: Vec<BalanceLine>,
    /// Value still moving through routed-but-unfinished operations.
    /// Always recomputed fresh, cache hit or not.
    pub in_progress_msats: i64,
}

/// Pure per-unit summation with the debit/credit sign convention.
///
/// The balance sheet must show the net position of each account, not
/// gross per-unit totals summed across units.
pub fn summarize<'a>(
    account: &Account,
    entries: impl IntoIterator<Item = &'a LedgerEntry>,
) -> LedgerAccountDetails {
    let mut details = LedgerAccountDetails::default();
    for entry in entries {
        let delta = entry.delta_for(account);
        if delta == 0 {
            continue;
        }
        *details.per_unit_totals.entry(entry.unit).or_insert(0) += delta;
        details.per_unit_history.push(BalanceLine {
            timestamp: entry.timestamp.to_chrono(),
            ledger_type: entry.ledger_type.as_str().to_string(),
            unit: entry.unit,
            delta,
            description: entry.description.clone(),
        });
    }
    details
}

/// The ledger service
pub struct Ledger {
    entries: MongoCollection<LedgerEntry>,
    journal: MongoCollection<TrackedOp>,
    cache: Option<BalanceCache>,
}

impl Ledger {
    pub fn new(
        entries: MongoCollection<LedgerEntry>,
        journal: MongoCollection<TrackedOp>,
        cache: Option<BalanceCache>,
    ) -> Self {
        Self {
            entries,
            journal,
            cache,
        }
    }

    /// Post one entry atomically.
    ///
    /// Fails with `DuplicateEntry` when the (group_id, ledger_type) slot
    /// is already filled; bumps the cache generation on success. Cache
    /// failures are warnings, never errors.
    pub async fn post(&self, entry: LedgerEntry) -> Result<()> {
        entry.validate()?;
        debug!("{}", entry.log_str());
        self.entries.insert_one(entry).await?;
        if let Some(cache) = &self.cache {
            cache.invalidate().await;
        }
        Ok(())
    }

    /// Post a flow's entry set, treating already-present slots as
    /// no-ops so replays are idempotent. Returns the number actually
    /// inserted.
    pub async fn post_all(&self, entries: Vec<LedgerEntry>) -> Result<usize> {
        let mut inserted = 0;
        for entry in entries {
            match self.post(entry).await {
                Ok(()) => inserted += 1,
                Err(BridgeError::DuplicateEntry(slot)) => {
                    debug!("Ledger slot already filled, skipping: {slot}");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(inserted)
    }

    /// Balance of one account.
    ///
    /// `as_of` is truncated to the minute before becoming part of the
    /// cache key; `age` bounds the lookback window. Reads go through the
    /// cache when available and fall back to the journal transparently.
    pub async fn balance(
        &self,
        account: &Account,
        as_of: Option<DateTime<Utc>>,
        age: Option<ChronoDuration>,
    ) -> Result<LedgerAccountDetails> {
        let as_of_minute = as_of
            .unwrap_or_else(Utc::now)
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or_else(Utc::now);
        let live = as_of.is_none();

        let mut details = match self.cached_balance(account, as_of_minute, age, live).await {
            Some(hit) => hit,
            None => {
                let computed = self.compute_balance(account, as_of_minute, age).await?;
                if let Some(cache) = &self.cache {
                    cache
                        .set(account, as_of_minute, age, live, &computed)
                        .await;
                }
                computed
            }
        };

        details.in_progress_msats = self.in_progress_msats(account).await?;
        Ok(details)
    }

    async fn cached_balance(
        &self,
        account: &Account,
        as_of_minute: DateTime<Utc>,
        age: Option<ChronoDuration>,
        live: bool,
    ) -> Option<LedgerAccountDetails> {
        let cache = self.cache.as_ref()?;
        cache.get(account, as_of_minute, age, live).await
    }

    async fn compute_balance(
        &self,
        account: &Account,
        as_of: DateTime<Utc>,
        age: Option<ChronoDuration>,
    ) -> Result<LedgerAccountDetails> {
        let mut time_filter = doc! { "$lte": bson::DateTime::from_chrono(as_of) };
        if let Some(age) = age {
            time_filter.insert("$gte", bson::DateTime::from_chrono(as_of - age));
        }
        let filter = doc! {
            "$and": [
                { "timestamp": time_filter },
                { "$or": [account.as_filter("debit"), account.as_filter("credit")] },
            ]
        };
        let entries = self.entries.find_many(filter).await?;
        Ok(summarize(account, entries.iter()))
    }

    /// Msats still moving through operations the router has claimed but
    /// not finished
    async fn in_progress_msats(&self, account: &Account) -> Result<i64> {
        // Only user balances have meaningful in-flight value
        if account.name != "User Balance" {
            return Ok(0);
        }
        let ops = self
            .journal
            .find_many(doc! { "state": OpState::Routed.as_str() })
            .await?;
        let mut msats = 0;
        for op in ops {
            use crate::db::schemas::OpPayload;
            match &op.payload {
                OpPayload::HiveCustomMessage(m) if m.from_account == account.sub => {
                    msats += m.msats;
                }
                OpPayload::LnInvoice(inv) if inv.memo.contains(&account.sub) => {
                    msats += inv.value_msats;
                }
                _ => {}
            }
        }
        Ok(msats)
    }

    /// Every (account_type, name, sub) tuple in use
    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        let pipeline = vec![
            doc! { "$project": { "sides": ["$debit", "$credit"] } },
            doc! { "$unwind": "$sides" },
            doc! { "$group": { "_id": {
                "account_type": "$sides.account_type",
                "name": "$sides.name",
                "sub": "$sides.sub",
                "contra": "$sides.contra",
            }}},
        ];
        let docs = self.entries.aggregate(pipeline).await?;
        let mut accounts = Vec::new();
        for d in docs {
            if let Ok(id) = d.get_document("_id") {
                if let Ok(account) = bson::from_document::<Account>(id.clone()) {
                    accounts.push(account);
                }
            }
        }
        accounts.sort_by(|a, b| {
            (a.account_type.as_str(), &a.name, &a.sub)
                .cmp(&(b.account_type.as_str(), &b.name, &b.sub))
        });
        Ok(accounts)
    }

    /// Total msats withdrawn by a user since `since`, for rate limiting
    pub async fn user_outflow_msats_since(
        &self,
        user: &str,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let account = Account::user_balance(user);
        let filter = doc! {
            "$and": [
                { "timestamp": { "$gte": bson::DateTime::from_chrono(since) } },
                { "unit": "MSATS" },
                account.as_filter("debit"),
            ]
        };
        let entries = self.entries.find_many(filter).await?;
        Ok(entries.iter().map(|e| e.amount).sum())
    }

    /// All entries under one group id, oldest first
    pub async fn entries_for_group(&self, group_id: &str) -> Result<Vec<LedgerEntry>> {
        let mut entries = self
            .entries
            .find_many(doc! { "group_id": group_id })
            .await?;
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    pub async fn log_totals(&self) -> Result<()> {
        let count = self.entries.count(doc! {}).await?;
        info!(entries = count, "Ledger journal size");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schemas::LedgerKind;
    use crate::money::RateSnapshot;

    fn entry(
        kind: LedgerKind,
        debit: Account,
        credit: Account,
        amount: i64,
        unit: Unit,
    ) -> LedgerEntry {
        LedgerEntry::new(
            "g-1",
            kind,
            "test".to_string(),
            debit,
            credit,
            amount,
            unit,
            RateSnapshot::default(),
        )
    }

    #[test]
    fn summarize_keeps_units_separate() {
        let alice = Account::user_balance("alice");
        let entries = vec![
            entry(
                LedgerKind::DepositHive,
                Account::treasury_hive("srv"),
                alice.clone(),
                25_000,
                Unit::Hive,
            ),
            entry(
                LedgerKind::ConvContra,
                alice.clone(),
                Account::conversion_offset("srv"),
                25_000,
                Unit::Hive,
            ),
            entry(
                LedgerKind::FeeConversion,
                alice.clone(),
                Account::conversion_fees(),
                125_000,
                Unit::Msats,
            ),
        ];
        let details = summarize(&alice, entries.iter());
        // HIVE column nets to zero; msats column shows only the fee
        assert_eq!(details.per_unit_totals[&Unit::Hive], 0);
        assert_eq!(details.per_unit_totals[&Unit::Msats], -125_000);
        assert_eq!(details.per_unit_history.len(), 3);
    }

    #[test]
    fn summarize_ignores_unrelated_accounts() {
        let alice = Account::user_balance("alice");
        let entries = vec![entry(
            LedgerKind::DepositHive,
            Account::treasury_hive("srv"),
            Account::user_balance("bob"),
            10_000,
            Unit::Hive,
        )];
        let details = summarize(&alice, entries.iter());
        assert!(details.per_unit_totals.is_empty());
        assert!(details.per_unit_history.is_empty());
    }

    #[test]
    fn journal_debits_equal_credits_per_unit() {
        // Property 1: for any entry set, signed sums per unit cancel when
        // aggregated over the debit and credit sides with their normal
        // signs. Each entry is internally balanced, so the whole journal
        // balances.
        let alice = Account::user_balance("alice");
        let treasury = Account::treasury_hive("srv");
        let entries = vec![
            entry(
                LedgerKind::DepositHive,
                treasury.clone(),
                alice.clone(),
                25_000,
                Unit::Hive,
            ),
            entry(
                LedgerKind::FeeConversion,
                alice.clone(),
                Account::conversion_fees(),
                125_000,
                Unit::Msats,
            ),
        ];
        for e in &entries {
            // Debit amount equals credit amount by construction
            assert!(e.amount > 0);
            assert!(e.validate().is_ok());
        }
    }
}
