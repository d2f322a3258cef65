//! Live operator policy
//!
//! Policy arrives as a loosely typed JSON blob stored under a root key in
//! the server account's posting metadata on chain. It is validated into
//! this typed form at the boundary and cached for an hour; the engine
//! only ever consumes the typed form.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::hive::HiveRpc;
use crate::types::Result;

/// Root key in the account's posting metadata
pub const POLICY_ROOT_KEY: &str = "v4vapp_hiveconfig";

/// Policy refresh interval
const POLICY_TTL: Duration = Duration::from_secs(3600);

/// Per-user rolling rate limit: at most `sats` withdrawn per `hours`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub hours: i64,
    pub sats: i64,
}

/// Reference to an off-box dynamic fee override document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicFeesRef {
    pub account: String,
    pub permlink: String,
}

/// Operator-controllable knobs, typed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Fee withheld when returning a Hive transfer, in HIVE
    pub hive_return_fee: f64,
    /// Conversion fee, percent of gross
    pub conv_fee_percent: f64,
    /// Fixed conversion fee, sats
    pub conv_fee_sats: i64,
    /// Fee percent for streaming sats payouts
    pub streaming_fee_percent: f64,
    pub min_invoice_sats: i64,
    pub max_invoice_sats: i64,
    pub max_ln_routing_fee_msats: i64,
    pub gateway_hive_to_ln: bool,
    pub gateway_ln_to_hive: bool,
    /// Sorted ascending by hours on load
    pub rate_limits: Vec<RateLimit>,
    pub dynamic_fees: Option<DynamicFeesRef>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            hive_return_fee: 0.002,
            conv_fee_percent: 1.5,
            conv_fee_sats: 50,
            streaming_fee_percent: 3.0,
            min_invoice_sats: 250,
            max_invoice_sats: 100_000,
            max_ln_routing_fee_msats: 500_000,
            gateway_hive_to_ln: true,
            gateway_ln_to_hive: true,
            rate_limits: vec![
                RateLimit { hours: 4, sats: 400_000 },
                RateLimit { hours: 72, sats: 800_000 },
                RateLimit { hours: 168, sats: 1_200_000 },
            ],
            dynamic_fees: None,
        }
    }
}

impl Policy {
    /// Validate a raw metadata blob into a policy, falling back to
    /// defaults for missing or malformed keys
    pub fn from_metadata(metadata: &Value) -> Self {
        let Some(raw) = metadata.get(POLICY_ROOT_KEY) else {
            return Self::default();
        };
        let mut policy: Policy = match serde_json::from_value(raw.clone()) {
            Ok(p) => p,
            Err(e) => {
                warn!("Policy blob failed validation, using defaults: {e}");
                return Self::default();
            }
        };
        policy.normalize();
        policy
    }

    fn normalize(&mut self) {
        self.rate_limits.sort_by_key(|rl| rl.hours);
        if self.min_invoice_sats < 0 {
            self.min_invoice_sats = 0;
        }
        if self.max_invoice_sats < self.min_invoice_sats {
            self.max_invoice_sats = self.min_invoice_sats;
        }
    }

    pub fn max_rate_limit_hours(&self) -> i64 {
        self.rate_limits.iter().map(|rl| rl.hours).max().unwrap_or(0)
    }
}

/// Seam over the on-chain policy fetch
#[async_trait]
pub trait PolicyFetcher: Send + Sync {
    async fn fetch(&self) -> Result<Option<Policy>>;
}

/// Production fetcher reading the account's posting metadata
pub struct AccountMetadataFetcher {
    rpc: HiveRpc,
    account: String,
}

impl AccountMetadataFetcher {
    pub fn new(rpc: HiveRpc, account: &str) -> Self {
        Self {
            rpc,
            account: account.to_string(),
        }
    }
}

#[async_trait]
impl PolicyFetcher for AccountMetadataFetcher {
    async fn fetch(&self) -> Result<Option<Policy>> {
        let Some(metadata) = self.rpc.get_posting_metadata(&self.account).await? else {
            return Ok(None);
        };
        Ok(Some(Policy::from_metadata(&metadata)))
    }
}

/// Cached policy with a 1 h refresh
pub struct PolicyStore {
    fetcher: Arc<dyn PolicyFetcher>,
    cached: RwLock<(Policy, Option<Instant>)>,
}

impl PolicyStore {
    pub fn new(fetcher: Arc<dyn PolicyFetcher>) -> Self {
        Self {
            fetcher,
            cached: RwLock::new((Policy::default(), None)),
        }
    }

    /// Fixed policy for tests and dev runs without a policy account
    pub fn fixed(policy: Policy) -> Self {
        struct Fixed(Policy);
        #[async_trait]
        impl PolicyFetcher for Fixed {
            async fn fetch(&self) -> Result<Option<Policy>> {
                Ok(Some(self.0.clone()))
            }
        }
        let store = Self::new(Arc::new(Fixed(policy.clone())));
        *store.cached.write() = (policy, Some(Instant::now()));
        store
    }

    /// Current policy, refreshed when stale. Fetch failures keep the
    /// previous value; policy reads must never block a conversion.
    pub async fn current(&self) -> Policy {
        {
            let guard = self.cached.read();
            if let (policy, Some(at)) = &*guard {
                if at.elapsed() < POLICY_TTL {
                    return policy.clone();
                }
            }
        }
        match self.fetcher.fetch().await {
            Ok(Some(policy)) => {
                debug!("Policy refreshed from chain");
                *self.cached.write() = (policy.clone(), Some(Instant::now()));
                policy
            }
            Ok(None) => {
                warn!("No policy blob found on chain, using defaults");
                let policy = Policy::default();
                *self.cached.write() = (policy.clone(), Some(Instant::now()));
                policy
            }
            Err(e) => {
                warn!("Policy fetch failed, keeping cached values: {e}");
                self.cached.read().0.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_root_key_yields_defaults() {
        let policy = Policy::from_metadata(&json!({ "profile": {} }));
        assert_eq!(policy, Policy::default());
    }

    #[test]
    fn parses_and_sorts_blob() {
        let metadata = json!({
            "v4vapp_hiveconfig": {
                "conv_fee_percent": 0.5,
                "conv_fee_sats": 100,
                "min_invoice_sats": 100,
                "max_invoice_sats": 50000,
                "gateway_hive_to_ln": false,
                "rate_limits": [
                    { "hours": 72, "sats": 800000 },
                    { "hours": 4, "sats": 400000 }
                ]
            }
        });
        let policy = Policy::from_metadata(&metadata);
        assert_eq!(policy.conv_fee_percent, 0.5);
        assert_eq!(policy.conv_fee_sats, 100);
        assert!(!policy.gateway_hive_to_ln);
        // Defaults fill unspecified keys
        assert_eq!(policy.max_ln_routing_fee_msats, 500_000);
        // Sorted ascending by hours
        assert_eq!(policy.rate_limits[0].hours, 4);
        assert_eq!(policy.max_rate_limit_hours(), 72);
    }

    #[test]
    fn malformed_blob_falls_back_to_defaults() {
        let metadata = json!({ "v4vapp_hiveconfig": { "conv_fee_percent": "lots" } });
        assert_eq!(Policy::from_metadata(&metadata), Policy::default());
    }

    #[test]
    fn inverted_limits_are_clamped() {
        let metadata = json!({
            "v4vapp_hiveconfig": { "min_invoice_sats": 1000, "max_invoice_sats": 10 }
        });
        let policy = Policy::from_metadata(&metadata);
        assert_eq!(policy.max_invoice_sats, 1000);
    }

    #[test]
    fn dynamic_fees_reference_parses() {
        let metadata = json!({
            "v4vapp_hiveconfig": {
                "dynamic_fees": { "account": "v4vapp", "permlink": "fees-2025" }
            }
        });
        let policy = Policy::from_metadata(&metadata);
        let dynamic = policy.dynamic_fees.unwrap();
        assert_eq!(dynamic.account, "v4vapp");
        assert_eq!(dynamic.permlink, "fees-2025");
    }
}
