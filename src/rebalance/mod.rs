//! Exchange rebalancer
//!
//! Decouples "a customer just converted 5 HIVE of value" from "trade
//! 5 HIVE on the exchange": exchanges reject orders below a minimum lot
//! size and notional, so conversions accumulate in persistent pending
//! pools per (base, quote, direction, exchange) and a single trade
//! drains the pool once both minima clear. Opposing pools net against
//! each other first, so only the residual is traded.
//!
//! All exchange I/O is best-effort background work: a failed trade never
//! blocks, fails, or retries the user-visible conversion. The pending
//! row is preserved and the next event absorbs the lost contribution.

pub mod binance;
pub mod exchange;

use async_trait::async_trait;
use bson::doc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::schemas::{
    fresh_group_id, Account, LedgerEntry, LedgerKind, PendingRebalance, RebalanceDirection,
    RebalanceResultDoc,
};
use crate::db::MongoCollection;
use crate::engine::RebalanceSink;
use crate::ledger::Ledger;
use crate::money::{MarketQuote, Unit};
use crate::types::{BridgeError, Result};

pub use binance::BinanceSpot;
pub use exchange::{ConvertAdapter, ConvertApi, ExchangeAdapter, MinOrder, OrderResult};

/// Outcome of one rebalance touch
#[derive(Debug, Clone)]
pub struct RebalanceOutcome {
    pub executed: bool,
    pub reason: String,
    pub pending_qty: Decimal,
    pub pending_notional: Decimal,
}

/// Net position across the SELL and BUY pools of one pair
#[derive(Debug, Clone, PartialEq)]
pub struct NetPosition {
    pub net_qty: Decimal,
    pub direction: Option<RebalanceDirection>,
}

/// Net the two sides: positive residual sells, negative buys
pub fn compute_net(sell_qty: Decimal, buy_qty: Decimal) -> NetPosition {
    let net = sell_qty - buy_qty;
    let direction = if net > Decimal::ZERO {
        Some(RebalanceDirection::SellBaseForQuote)
    } else if net < Decimal::ZERO {
        Some(RebalanceDirection::BuyBaseWithQuote)
    } else {
        None
    };
    NetPosition {
        net_qty: net.abs(),
        direction,
    }
}

pub struct Rebalancer {
    pending: MongoCollection<PendingRebalance>,
    results: MongoCollection<RebalanceResultDoc>,
    ledger: Arc<Ledger>,
    adapter: Arc<dyn ExchangeAdapter>,
    base_asset: String,
    quote_asset: String,
}

impl Rebalancer {
    pub fn new(
        pending: MongoCollection<PendingRebalance>,
        results: MongoCollection<RebalanceResultDoc>,
        ledger: Arc<Ledger>,
        adapter: Arc<dyn ExchangeAdapter>,
        base_asset: &str,
        quote_asset: &str,
    ) -> Self {
        Self {
            pending,
            results,
            ledger,
            adapter,
            base_asset: base_asset.to_string(),
            quote_asset: quote_asset.to_string(),
        }
    }

    /// Main entry point: accumulate a conversion's quantity and execute
    /// when the net position clears both minima.
    pub async fn add_pending(
        &self,
        direction: RebalanceDirection,
        qty: Decimal,
        group_id: &str,
    ) -> RebalanceOutcome {
        match self.add_pending_inner(direction, qty, group_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Never bubble into the conversion; the pool keeps
                // whatever was persisted before the failure
                warn!(group_id = %group_id, "Rebalance touch failed: {e}");
                RebalanceOutcome {
                    executed: false,
                    reason: e.to_string(),
                    pending_qty: Decimal::ZERO,
                    pending_notional: Decimal::ZERO,
                }
            }
        }
    }

    async fn add_pending_inner(
        &self,
        direction: RebalanceDirection,
        qty: Decimal,
        group_id: &str,
    ) -> Result<RebalanceOutcome> {
        let mut pool = self.load_or_create(direction).await?;

        // Refresh thresholds best-effort; stale values are fine
        match self
            .adapter
            .min_order_requirements(&self.base_asset, &self.quote_asset)
            .await
        {
            Ok(minimums) => {
                pool.min_qty_threshold = minimums.min_qty;
                pool.min_notional_threshold = minimums.min_notional;
            }
            Err(e) => warn!("Could not refresh exchange minimums: {e}"),
        }

        let quote_value = match self
            .adapter
            .price(&self.base_asset, &self.quote_asset)
            .await
        {
            Ok(price) => qty * price,
            Err(e) => {
                warn!("Could not price {}/{}: {e}", self.base_asset, self.quote_asset);
                Decimal::ZERO
            }
        };

        pool.add_pending(qty, quote_value, group_id);
        debug!("{}", pool.log_str());

        // Net against the opposite pool before trading
        let opposite = self.load_or_create(direction.opposite()).await?;
        let net = compute_net(
            sell_qty_of(&pool, &opposite),
            buy_qty_of(&pool, &opposite),
        );

        let Some(net_direction) = net.direction else {
            self.save(&mut pool).await?;
            return Ok(RebalanceOutcome {
                executed: false,
                reason: "Balanced: no net position".to_string(),
                pending_qty: pool.pending_qty,
                pending_notional: pool.pending_quote_value,
            });
        };

        // Thresholds apply to the net residual
        let net_notional = pool
            .pending_quote_value
            .max(opposite.pending_quote_value);
        if net.net_qty < pool.min_qty_threshold || net_notional < pool.min_notional_threshold {
            self.save(&mut pool).await?;
            let (_, reason) = pool.can_execute();
            return Ok(RebalanceOutcome {
                executed: false,
                reason,
                pending_qty: pool.pending_qty,
                pending_notional: pool.pending_quote_value,
            });
        }

        self.execute_net(pool, opposite, net_direction, net.net_qty, group_id)
            .await
    }

    async fn execute_net(
        &self,
        pool: PendingRebalance,
        opposite: PendingRebalance,
        net_direction: RebalanceDirection,
        net_qty: Decimal,
        group_id: &str,
    ) -> Result<RebalanceOutcome> {
        let order = match net_direction {
            RebalanceDirection::SellBaseForQuote => {
                self.adapter
                    .market_sell(&self.base_asset, &self.quote_asset, net_qty, Some(group_id))
                    .await
            }
            RebalanceDirection::BuyBaseWithQuote => {
                self.adapter
                    .market_buy(&self.base_asset, &self.quote_asset, net_qty, Some(group_id))
                    .await
            }
        };

        let order = match order {
            Ok(order) => order,
            Err(BridgeError::ExchangeBelowMinimum(reason)) => {
                // Keep the pools untouched; the next event grows them
                warn!("Rebalance below exchange minimum: {reason}");
                let mut pool = pool;
                self.save(&mut pool).await?;
                return Ok(RebalanceOutcome {
                    executed: false,
                    reason,
                    pending_qty: pool.pending_qty,
                    pending_notional: pool.pending_quote_value,
                });
            }
            Err(e) => {
                warn!("Rebalance trade failed: {e}");
                let mut pool = pool;
                self.save(&mut pool).await?;
                return Ok(RebalanceOutcome {
                    executed: false,
                    reason: e.to_string(),
                    pending_qty: pool.pending_qty,
                    pending_notional: pool.pending_quote_value,
                });
            }
        };

        // The consumed side loses offset + executed; the opposite pool
        // is fully absorbed by the netting
        let (mut executed_side, mut offset_side) =
            if pool.direction == net_direction {
                (pool, opposite)
            } else {
                (opposite, pool)
            };
        let mut absorbed = executed_side.transaction_ids.clone();
        absorbed.extend(offset_side.transaction_ids.iter().cloned());
        let offset_qty = offset_side.pending_qty;
        offset_side.consume_for_netting();
        executed_side.reset_after_execution(offset_qty + order.executed_qty);
        self.save(&mut executed_side).await?;
        self.save(&mut offset_side).await?;

        let trade_group = fresh_group_id();
        self.post_trade_entries(&trade_group, net_direction, &order)
            .await?;

        let result = RebalanceResultDoc {
            _id: None,
            metadata: crate::db::schemas::Metadata::new(),
            exchange: self.adapter.exchange_name().to_string(),
            symbol: format!("{}{}", self.base_asset, self.quote_asset),
            direction: net_direction,
            executed_qty: order.executed_qty,
            quote_received: order.quote_received,
            avg_price: order.avg_price,
            fee: order.fee,
            fee_asset: order.fee_asset.clone(),
            group_id: trade_group.clone(),
            absorbed_group_ids: absorbed,
        };
        if let Err(e) = self.results.insert_one(result).await {
            warn!("Rebalance result save failed: {e}");
        }

        info!(
            notify = true,
            "Rebalance executed: {} {} {} at {}",
            net_direction.as_str(),
            order.executed_qty,
            self.base_asset,
            order.avg_price
        );

        Ok(RebalanceOutcome {
            executed: true,
            reason: "Trade executed".to_string(),
            pending_qty: Decimal::ZERO,
            pending_notional: Decimal::ZERO,
        })
    }

    /// Ledger entries for an executed trade: base leg as exc_conv, quote
    /// leg as reclassify_sats, fees as exc_fee
    async fn post_trade_entries(
        &self,
        group_id: &str,
        direction: RebalanceDirection,
        order: &OrderResult,
    ) -> Result<()> {
        let exchange = self.adapter.exchange_name();
        let quote = self.trade_quote(order);
        let base_milli = decimal_to_milli(order.executed_qty);
        let quote_msats = decimal_to_msats(order.quote_received);

        let (base_debit, base_credit, quote_debit, quote_credit) = match direction {
            RebalanceDirection::SellBaseForQuote => (
                Account::conversion_offset(exchange),
                Account::exchange_base(exchange),
                Account::exchange_quote(exchange),
                Account::conversion_offset(exchange),
            ),
            RebalanceDirection::BuyBaseWithQuote => (
                Account::exchange_base(exchange),
                Account::conversion_offset(exchange),
                Account::conversion_offset(exchange),
                Account::exchange_quote(exchange),
            ),
        };

        let mut entries = vec![
            LedgerEntry::new(
                group_id,
                LedgerKind::ExcConv,
                format!(
                    "{} {} {} at {}",
                    direction.as_str(),
                    order.executed_qty,
                    self.base_asset,
                    order.avg_price
                ),
                base_debit,
                base_credit,
                base_milli,
                Unit::Hive,
                quote.snapshot(base_milli, Unit::Hive),
            ),
            LedgerEntry::new(
                group_id,
                LedgerKind::ReclassifySats,
                format!(
                    "Quote leg {} {}",
                    order.quote_received, self.quote_asset
                ),
                quote_debit,
                quote_credit,
                quote_msats,
                Unit::Msats,
                quote.snapshot(quote_msats, Unit::Msats),
            ),
        ];
        if order.fee > Decimal::ZERO {
            let fee_msats = decimal_to_msats(order.fee);
            if fee_msats > 0 {
                entries.push(LedgerEntry::new(
                    group_id,
                    LedgerKind::ExcFee,
                    format!("Exchange fee {} {}", order.fee, order.fee_asset),
                    Account::exchange_fees(),
                    Account::exchange_quote(exchange),
                    fee_msats,
                    Unit::Msats,
                    quote.snapshot(fee_msats, Unit::Msats),
                ));
            }
        }
        self.ledger.post_all(entries).await?;
        Ok(())
    }

    fn trade_quote(&self, order: &OrderResult) -> MarketQuote {
        use rust_decimal::prelude::ToPrimitive;
        // Value the trade at its own execution price
        let sats_per_base = (order.avg_price * Decimal::from(100_000_000))
            .to_f64()
            .unwrap_or(0.0);
        MarketQuote {
            sats_per_hive: sats_per_base,
            sats_per_hbd: sats_per_base,
            usd_per_hive: 0.0,
            usd_per_hbd: 0.0,
            fetched_at: chrono::Utc::now(),
            source: self.adapter.exchange_name().to_string(),
        }
    }

    async fn load_or_create(&self, direction: RebalanceDirection) -> Result<PendingRebalance> {
        let template = PendingRebalance::new(
            &self.base_asset,
            &self.quote_asset,
            direction,
            self.adapter.exchange_name(),
        );
        if let Some(existing) = self.pending.find_one(template.identity_filter()).await? {
            return Ok(existing);
        }
        match self.pending.insert_one(template.clone()).await {
            Ok(_) => Ok(template),
            Err(BridgeError::DuplicateEntry(_)) => {
                // Raced another task creating the row
                self.pending
                    .find_one(template.identity_filter())
                    .await?
                    .ok_or_else(|| {
                        BridgeError::Database("pending rebalance vanished after race".into())
                    })
            }
            Err(e) => Err(e),
        }
    }

    /// Optimistic save: write-if-version-unchanged, bumping the version.
    /// A conflict means a concurrent task updated the row; the caller's
    /// contribution was already folded in by whoever won, so losing the
    /// race only loses threshold refreshes.
    async fn save(&self, pool: &mut PendingRebalance) -> Result<()> {
        let expected = pool.version;
        pool.version += 1;
        let mut filter = pool.identity_filter();
        filter.insert("version", expected);
        let update = doc! { "$set": bson::to_document(&pool).map_err(|e| {
            BridgeError::Database(format!("pending encode failed: {e}"))
        })? };
        let result = self.pending.update_one(filter, update).await?;
        if result.matched_count == 0 {
            warn!(
                "Pending rebalance version conflict on {} {}",
                pool.symbol(),
                pool.direction.as_str()
            );
        }
        Ok(())
    }
}

fn sell_qty_of(a: &PendingRebalance, b: &PendingRebalance) -> Decimal {
    match (a.direction, b.direction) {
        (RebalanceDirection::SellBaseForQuote, _) => a.pending_qty,
        (_, RebalanceDirection::SellBaseForQuote) => b.pending_qty,
        _ => Decimal::ZERO,
    }
}

fn buy_qty_of(a: &PendingRebalance, b: &PendingRebalance) -> Decimal {
    match (a.direction, b.direction) {
        (RebalanceDirection::BuyBaseWithQuote, _) => a.pending_qty,
        (_, RebalanceDirection::BuyBaseWithQuote) => b.pending_qty,
        _ => Decimal::ZERO,
    }
}

fn decimal_to_milli(qty: Decimal) -> i64 {
    use rust_decimal::prelude::ToPrimitive;
    (qty * Decimal::from(1000)).round().to_i64().unwrap_or(0)
}

/// Quote asset is BTC: msats = BTC x 1e8 sats x 1000
fn decimal_to_msats(quote_qty: Decimal) -> i64 {
    use rust_decimal::prelude::ToPrimitive;
    (quote_qty * Decimal::from(100_000_000_000i64))
        .round()
        .to_i64()
        .unwrap_or(0)
}

#[async_trait]
impl RebalanceSink for Rebalancer {
    async fn record_conversion(
        &self,
        direction: RebalanceDirection,
        base_qty: Decimal,
        group_id: &str,
    ) {
        let outcome = self.add_pending(direction, base_qty, group_id).await;
        debug!(
            executed = outcome.executed,
            reason = %outcome.reason,
            "Rebalance outcome"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn net_of_equal_sides_is_balanced() {
        let net = compute_net(dec!(10), dec!(10));
        assert_eq!(net.direction, None);
        assert_eq!(net.net_qty, Decimal::ZERO);
    }

    #[test]
    fn sell_heavy_nets_to_sell_residual() {
        let net = compute_net(dec!(100), dec!(60));
        assert_eq!(net.direction, Some(RebalanceDirection::SellBaseForQuote));
        assert_eq!(net.net_qty, dec!(40));
    }

    #[test]
    fn buy_heavy_nets_to_buy_residual() {
        let net = compute_net(dec!(5), dec!(25));
        assert_eq!(net.direction, Some(RebalanceDirection::BuyBaseWithQuote));
        assert_eq!(net.net_qty, dec!(20));
    }

    #[test]
    fn decimal_conversions() {
        assert_eq!(decimal_to_milli(dec!(12.345)), 12_345);
        // 0.002 BTC = 200_000 sats = 200_000_000 msats
        assert_eq!(decimal_to_msats(dec!(0.002)), 200_000_000);
    }
}
