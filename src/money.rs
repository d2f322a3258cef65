//! Money units and rate snapshots
//!
//! All ledger amounts are integers in the smallest unit of their native
//! currency: millisatoshis for Lightning value, thousandths for HIVE and
//! HBD. Conversion to human units happens only at the display boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ledger currency unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    #[serde(rename = "HIVE")]
    Hive,
    #[serde(rename = "HBD")]
    Hbd,
    #[serde(rename = "MSATS")]
    Msats,
}

impl Unit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Unit::Hive => "HIVE",
            Unit::Hbd => "HBD",
            Unit::Msats => "MSATS",
        }
    }

    /// Smallest units per display unit (milli-HIVE, milli-HBD, msats/sat)
    pub fn scale(&self) -> i64 {
        1000
    }
}

impl std::fmt::Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Market quote used to value on-chain units in sats and USD.
///
/// Rates are per whole unit (sats per 1 HIVE), refreshed from the price
/// source and persisted to the `rates` time series on every fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketQuote {
    pub sats_per_hive: f64,
    pub sats_per_hbd: f64,
    pub usd_per_hive: f64,
    pub usd_per_hbd: f64,
    pub fetched_at: DateTime<Utc>,
    pub source: String,
}

impl MarketQuote {
    /// Gross msats equivalent of an on-chain amount at this quote.
    pub fn msats_from(&self, amount_milli: i64, unit: Unit) -> i64 {
        let rate = match unit {
            Unit::Hive => self.sats_per_hive,
            Unit::Hbd => self.sats_per_hbd,
            Unit::Msats => return amount_milli,
        };
        // amount_milli / 1000 whole units * rate sats/unit * 1000 msats/sat
        (amount_milli as f64 * rate).round() as i64
    }

    /// On-chain smallest units equivalent of an msats amount.
    pub fn milli_from_msats(&self, msats: i64, unit: Unit) -> i64 {
        let rate = match unit {
            Unit::Hive => self.sats_per_hive,
            Unit::Hbd => self.sats_per_hbd,
            Unit::Msats => return msats,
        };
        if rate <= 0.0 {
            return 0;
        }
        (msats as f64 / rate).round() as i64
    }

    /// Snapshot of an amount's value in every bridge currency, frozen at
    /// post time and stored with the ledger entry.
    pub fn snapshot(&self, amount: i64, unit: Unit) -> RateSnapshot {
        let msats = self.msats_from(amount, unit);
        let hive = if self.sats_per_hive > 0.0 {
            msats as f64 / 1000.0 / self.sats_per_hive
        } else {
            0.0
        };
        let hbd = if self.sats_per_hbd > 0.0 {
            msats as f64 / 1000.0 / self.sats_per_hbd
        } else {
            0.0
        };
        let usd = hive * self.usd_per_hive;
        RateSnapshot {
            hive,
            hbd,
            msats,
            usd,
            fetched_at: self.fetched_at,
            source: self.source.clone(),
        }
    }
}

/// Cross-currency value of one ledger amount at the moment of posting.
///
/// Frozen once the entry is saved; reports never re-mark these values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RateSnapshot {
    pub hive: f64,
    pub hbd: f64,
    pub msats: i64,
    pub usd: f64,
    #[serde(default = "default_fetched_at")]
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub source: String,
}

fn default_fetched_at() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Format a smallest-unit amount for humans ("25.000 HIVE", "4,500 sats").
pub fn display_amount(amount: i64, unit: Unit) -> String {
    match unit {
        Unit::Msats => format!("{} sats", amount / 1000),
        Unit::Hive | Unit::Hbd => {
            format!("{}.{:03} {}", amount / 1000, (amount % 1000).abs(), unit)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn hive_to_msats_round_trip() {
        let q = quote();
        // 25.000 HIVE at 200 sats/HIVE = 5_000 sats
        assert_eq!(q.msats_from(25_000, Unit::Hive), 5_000_000);
        assert_eq!(q.milli_from_msats(5_000_000, Unit::Hive), 25_000);
    }

    #[test]
    fn msats_pass_through() {
        let q = quote();
        assert_eq!(q.msats_from(1234, Unit::Msats), 1234);
    }

    #[test]
    fn snapshot_values() {
        let q = quote();
        let snap = q.snapshot(25_000, Unit::Hive);
        assert_eq!(snap.msats, 5_000_000);
        assert!((snap.hive - 25.0).abs() < 1e-9);
        assert!((snap.usd - 6.25).abs() < 1e-9);
    }

    #[test]
    fn display_formats() {
        assert_eq!(display_amount(25_000, Unit::Hive), "25.000 HIVE");
        assert_eq!(display_amount(4_500_000, Unit::Msats), "4500 sats");
        assert_eq!(display_amount(1_050, Unit::Hbd), "1.050 HBD");
    }
}
