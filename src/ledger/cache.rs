//! Generation-invalidated balance cache
//!
//! One integer generation counter lives in Redis. Every cached balance
//! key embeds the generation current at write time; a ledger write
//! increments the counter, instantly orphaning every older key with
//! O(1) cost. Orphans are never scanned or deleted, they TTL out.
//!
//! All operations are fault-tolerant: when Redis is unreachable the
//! caller falls back to direct ledger queries and the failure logs at
//! WARN, never as an error.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::db::schemas::Account;
use crate::ledger::LedgerAccountDetails;
use crate::types::{BridgeError, Result};

/// Redis key holding the current generation counter
pub const GENERATION_KEY: &str = "ledger:__generation__";

/// TTL for live queries (no explicit as_of)
const LIVE_TTL_SECS: u64 = 60;
/// TTL for historical queries
const HISTORICAL_TTL_SECS: u64 = 300;

/// Build the cache key for a query at a given generation.
///
/// `as_of` must already be truncated to the minute so near-simultaneous
/// "now" requests share a key.
pub fn make_cache_key(
    generation: i64,
    account: &Account,
    as_of_minute: DateTime<Utc>,
    age: Option<ChronoDuration>,
) -> String {
    let account_part = format!(
        "{}:{}:{}:{}",
        account.name,
        account.account_type.as_str(),
        account.sub,
        account.contra
    );
    let age_part = age
        .map(|a| a.num_seconds().to_string())
        .unwrap_or_else(|| "none".to_string());
    let raw = format!("{account_part}|{}|{age_part}", as_of_minute.to_rfc3339());

    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    let hash = hex::encode(hasher.finalize());
    format!("ledger:bal:v{generation}:{}", &hash[..16])
}

/// Redis-backed balance cache
#[derive(Clone)]
pub struct BalanceCache {
    conn: redis::aio::MultiplexedConnection,
}

impl BalanceCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| BridgeError::Cache(format!("redis open failed: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BridgeError::Cache(format!("redis connect failed: {e}")))?;
        Ok(Self { conn })
    }

    /// Current generation; 0 when unset or unreachable
    pub async fn generation(&self) -> i64 {
        let mut conn = self.conn.clone();
        match conn.get::<_, Option<i64>>(GENERATION_KEY).await {
            Ok(gen) => gen.unwrap_or(0),
            Err(e) => {
                debug!("Cache generation read failed: {e}");
                0
            }
        }
    }

    /// Increment the generation counter, orphaning every cached balance.
    /// Returns the new generation, or 0 on failure.
    pub async fn invalidate(&self) -> i64 {
        let mut conn = self.conn.clone();
        match conn.incr::<_, _, i64>(GENERATION_KEY, 1).await {
            Ok(new_gen) => {
                debug!(generation = new_gen, "Ledger cache invalidated");
                new_gen
            }
            Err(e) => {
                warn!("Failed to invalidate ledger cache: {e}");
                0
            }
        }
    }

    /// Cached balance, or None on miss or error
    pub async fn get(
        &self,
        account: &Account,
        as_of_minute: DateTime<Utc>,
        age: Option<ChronoDuration>,
        _live: bool,
    ) -> Option<LedgerAccountDetails> {
        let generation = self.generation().await;
        let key = make_cache_key(generation, account, as_of_minute, age);
        let mut conn = self.conn.clone();
        match conn.get::<_, Option<String>>(&key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(details) => {
                    debug!(key = %key, "Ledger cache hit");
                    Some(details)
                }
                Err(e) => {
                    warn!("Cached balance failed to decode: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                debug!("Ledger cache read failed: {e}");
                None
            }
        }
    }

    /// Store a balance under the current generation
    pub async fn set(
        &self,
        account: &Account,
        as_of_minute: DateTime<Utc>,
        age: Option<ChronoDuration>,
        live: bool,
        details: &LedgerAccountDetails,
    ) {
        let generation = self.generation().await;
        let key = make_cache_key(generation, account, as_of_minute, age);
        let ttl = if live { LIVE_TTL_SECS } else { HISTORICAL_TTL_SECS };
        let raw = match serde_json::to_string(details) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Balance encode failed: {e}");
                return;
            }
        };
        let mut conn = self.conn.clone();
        if let Err(e) = conn.set_ex::<_, _, ()>(&key, raw, ttl).await {
            warn!("Failed to set ledger cache: {e}");
        } else {
            debug!(key = %key, ttl, "Ledger cache set");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn account() -> Account {
        Account::user_balance("alice")
    }

    fn minute() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 2, 12, 30, 0).unwrap()
    }

    #[test]
    fn key_is_deterministic() {
        let a = make_cache_key(3, &account(), minute(), None);
        let b = make_cache_key(3, &account(), minute(), None);
        assert_eq!(a, b);
        assert!(a.starts_with("ledger:bal:v3:"));
    }

    #[test]
    fn generation_bump_changes_key() {
        // Cache freshness property: a write between two reads moves the
        // generation, so the second read uses a different key
        let before = make_cache_key(3, &account(), minute(), None);
        let after = make_cache_key(4, &account(), minute(), None);
        assert_ne!(before, after);
    }

    #[test]
    fn distinct_queries_get_distinct_keys() {
        let base = make_cache_key(1, &account(), minute(), None);
        let other_account = make_cache_key(1, &Account::user_balance("bob"), minute(), None);
        let other_age =
            make_cache_key(1, &account(), minute(), Some(ChronoDuration::hours(4)));
        let other_minute = make_cache_key(
            1,
            &account(),
            minute() + ChronoDuration::minutes(1),
            None,
        );
        assert_ne!(base, other_account);
        assert_ne!(base, other_age);
        assert_ne!(base, other_minute);
    }
}
