//! End-to-end scenario tests over the pure cores of the conversion
//! pipeline: entry building, accumulator math, memo routing, and the
//! notification rate limiter.

use chrono::Utc;
use rust_decimal_macros::dec;

use satbridge::db::schemas::{Account, LedgerKind, PendingRebalance, RebalanceDirection};
use satbridge::money::{MarketQuote, Unit};

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
fn s1_happy_path_hive_to_ln() {
    use satbridge::engine::flows::{
        hive_deposit_conversion_entries, ln_payout_entries, BridgeAccounts,
    };

    let accounts = BridgeAccounts {
        server: "bridge-server".to_string(),
        treasury: "bridge-treasury".to_string(),
        funding: String::new(),
        exchange: String::new(),
        operator: String::new(),
        node_name: "lnd".to_string(),
        message_prefix: "v4vapp".to_string(),
    };
    let q = quote();

    // 25.000 HIVE at 200 sats/HIVE, fee 0.5% + 100 sats
    let gross = q.msats_from(25_000, Unit::Hive);
    let fee = (gross as f64 * 0.005).round() as i64 + 100_000;

    let mut entries =
        hive_deposit_conversion_entries("s1", &accounts, "alice", 25_000, Unit::Hive, gross, fee, &q);
    entries.extend(ln_payout_entries("s1", &accounts, 4_500_000, 1_000, &q));

    assert_eq!(entries.len(), 6);

    // Every entry under the same group id, distinct ledger types
    let mut kinds: Vec<&str> = entries.iter().map(|e| e.ledger_type.as_str()).collect();
    kinds.sort_unstable();
    kinds.dedup();
    assert_eq!(kinds.len(), 6);
    assert!(entries.iter().all(|e| e.group_id == "s1"));

    // Per-unit sums of debits equal credits (each entry is internally
    // balanced, so the journal balances per unit)
    for e in &entries {
        assert!(e.validate().is_ok());
    }

    // Alice's HIVE position decreases by the full deposit
    let alice = Account::user_balance("alice");
    let hive_total: i64 = entries
        .iter()
        .filter(|e| e.unit == Unit::Hive)
        .map(|e| e.delta_for(&alice))
        .sum();
    assert_eq!(hive_total, 0);
}

#[test]
fn s3_rebalance_accumulation() {
    // Exchange minimums: 8 HIVE lot, 0.00001 BTC notional, price
    // 0.0002. The lot minimum sits above one 5-HIVE conversion so the
    // first touch accumulates and the second executes.
    let mut pool = PendingRebalance::new(
        "HIVE",
        "BTC",
        RebalanceDirection::SellBaseForQuote,
        "binance",
    );
    pool.min_qty_threshold = dec!(8);
    pool.min_notional_threshold = dec!(0.00001);

    // First conversion of 5 HIVE: below threshold, accumulates
    pool.add_pending(dec!(5), dec!(0.001), "conv-1");
    let (ready, _) = pool.can_execute();
    assert!(!ready);
    assert_eq!(pool.pending_qty, dec!(5));

    // Second conversion of 5 HIVE: threshold met
    pool.add_pending(dec!(5), dec!(0.001), "conv-2");
    let (ready, _) = pool.can_execute();
    assert!(ready);
    assert_eq!(pool.pending_qty, dec!(10));

    // Trade executes for the full 10 HIVE; pool resets to zero
    pool.reset_after_execution(dec!(10));
    assert_eq!(pool.pending_qty, dec!(0));
    assert_eq!(pool.pending_quote_value, dec!(0));
    assert_eq!(pool.execution_count, 1);
}

#[test]
fn s5_balance_adjustment_backdoor() {
    use satbridge::db::schemas::TransferPayload;
    use satbridge::engine::flows::is_balance_adjustment;

    let transfer = TransferPayload {
        block_num: 1,
        trx_id: "t1".to_string(),
        op_index: 0,
        from: "v4v-app".to_string(),
        to: "bridge-server".to_string(),
        amount: 10_000,
        unit: Unit::Hive,
        memo: "Balance adjustment — reconcile #T1".to_string(),
        recurrence_id: None,
    };
    assert!(is_balance_adjustment(&transfer, "v4v-app"));
}

#[test]
fn idempotent_replay_produces_identical_entries() {
    use satbridge::engine::flows::{hive_deposit_conversion_entries, BridgeAccounts};

    let accounts = BridgeAccounts {
        server: "bridge-server".to_string(),
        treasury: String::new(),
        funding: String::new(),
        exchange: String::new(),
        operator: String::new(),
        node_name: "lnd".to_string(),
        message_prefix: "v4vapp".to_string(),
    };
    let q = quote();
    let first =
        hive_deposit_conversion_entries("g", &accounts, "alice", 25_000, Unit::Hive, 5_000_000, 125_000, &q);
    let second =
        hive_deposit_conversion_entries("g", &accounts, "alice", 25_000, Unit::Hive, 5_000_000, 125_000, &q);

    // Same (group_id, ledger_type) slots with the same amounts: the
    // unique index makes a replay a no-op
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.group_id, b.group_id);
        assert_eq!(a.ledger_type, b.ledger_type);
        assert_eq!(a.amount, b.amount);
        assert_eq!(a.unit, b.unit);
    }
}

#[test]
fn conversion_pair_nets_per_unit_for_exchange_entries() {
    // Property 4: exc_conv-tagged debits equal exc_conv-tagged credits
    // per unit; single-unit balanced entries satisfy this directly
    use satbridge::db::schemas::{LedgerEntry, LimitOrderPayload};
    use satbridge::engine::flows::limit_order_entries;

    let payload = LimitOrderPayload {
        block_num: 1,
        trx_id: "t".to_string(),
        op_index: 0,
        owner: "bridge-server".to_string(),
        order_id: 7,
        filled: true,
        pays_amount: 25_000,
        pays_unit: Unit::Hive,
        receives_amount: 6_700,
        receives_unit: Unit::Hbd,
    };
    let entries: Vec<LedgerEntry> = limit_order_entries("g-net", &payload, &quote());
    for entry in entries.iter().filter(|e| e.ledger_type == LedgerKind::ExcConv) {
        // Debit amount equals credit amount in the entry's own unit
        assert!(entry.amount > 0);
        assert!(entry.validate().is_ok());
    }
}
