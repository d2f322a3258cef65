//! Fee math and invoice limit checks
//!
//! All arithmetic is integer msats. Percent parameters are percentages
//! (0.5 means 0.5 %).

use crate::engine::policy::Policy;
use crate::types::{BridgeError, Result};

/// Conversion service fee: percent of gross plus a fixed sats component
pub fn conversion_fee_msats(gross_msats: i64, policy: &Policy) -> i64 {
    let percent_part = (gross_msats as f64 * policy.conv_fee_percent / 100.0).round() as i64;
    percent_part + policy.conv_fee_sats * 1_000
}

/// Streaming payout fee
pub fn streaming_fee_msats(gross_msats: i64, policy: &Policy) -> i64 {
    (gross_msats as f64 * policy.streaming_fee_percent / 100.0).round() as i64
}

/// Check an invoice amount against the configured min/max.
///
/// The minimum is inclusive: an amount exactly at `min_invoice_sats` is
/// accepted, one sat below is rejected.
pub fn check_invoice_limits(msats: i64, policy: &Policy) -> Result<()> {
    let sats = msats / 1_000;
    if sats < policy.min_invoice_sats {
        return Err(BridgeError::Rejected(format!(
            "{sats} sats is below the minimum invoice of {} sats",
            policy.min_invoice_sats
        )));
    }
    if sats > policy.max_invoice_sats {
        return Err(BridgeError::Rejected(format!(
            "{sats} sats exceeds the maximum invoice of {} sats",
            policy.max_invoice_sats
        )));
    }
    Ok(())
}

/// Check an estimated routing fee against the cap.
///
/// A fee exactly at the cap is attempted; exceeding it aborts before
/// any payment is made.
pub fn check_routing_fee(fee_msats: i64, policy: &Policy) -> Result<()> {
    if fee_msats > policy.max_ln_routing_fee_msats {
        return Err(BridgeError::Rejected(format!(
            "routing fee {fee_msats} msats exceeds cap {}",
            policy.max_ln_routing_fee_msats
        )));
    }
    Ok(())
}

/// Return-transfer fee in on-chain smallest units
pub fn return_fee_milli(policy: &Policy) -> i64 {
    (policy.hive_return_fee * 1000.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> Policy {
        Policy {
            conv_fee_percent: 0.5,
            conv_fee_sats: 100,
            min_invoice_sats: 250,
            max_invoice_sats: 100_000,
            max_ln_routing_fee_msats: 500_000,
            ..Policy::default()
        }
    }

    #[test]
    fn fee_is_percent_plus_fixed() {
        // 0.5% of 5000 sats + 100 sats = 125 sats
        assert_eq!(conversion_fee_msats(5_000_000, &policy()), 125_000);
    }

    #[test]
    fn streaming_fee_is_pure_percent() {
        let p = Policy {
            streaming_fee_percent: 3.0,
            ..Policy::default()
        };
        assert_eq!(streaming_fee_msats(1_000_000, &p), 30_000);
    }

    #[test]
    fn fee_rounds_percent_part() {
        // 0.5% of 333 sats = 1.665 sats -> 1665 msats rounds to 1665
        let fee = conversion_fee_msats(333_000, &policy());
        assert_eq!(fee, 1_665 + 100_000);
    }

    #[test]
    fn minimum_is_inclusive() {
        let p = policy();
        assert!(check_invoice_limits(250_000, &p).is_ok());
        assert!(check_invoice_limits(249_000, &p).is_err());
    }

    #[test]
    fn maximum_is_inclusive() {
        let p = policy();
        assert!(check_invoice_limits(100_000_000, &p).is_ok());
        assert!(check_invoice_limits(100_001_000, &p).is_err());
    }

    #[test]
    fn routing_fee_cap_boundary() {
        let p = policy();
        // Exactly at the cap is attempted
        assert!(check_routing_fee(500_000, &p).is_ok());
        // One msat over aborts
        assert!(check_routing_fee(500_001, &p).is_err());
    }

    #[test]
    fn return_fee_converts_to_milli() {
        let p = Policy {
            hive_return_fee: 0.002,
            ..Policy::default()
        };
        assert_eq!(return_fee_milli(&p), 2);
    }
}
