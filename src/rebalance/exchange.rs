//! Exchange adapter seam
//!
//! Spot exchanges expose either a direct market-order API or a
//! quote-then-accept convert API. Both satisfy `ExchangeAdapter`; the
//! convert style wraps its three-step sequence behind the same market
//! calls, with fees embedded in the quoted ratio.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::time::Duration;

use crate::types::{BridgeError, Result};

/// Deadline for exchange REST calls
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(15);

/// Minimum order requirements for a pair
#[derive(Debug, Clone, Default)]
pub struct MinOrder {
    /// Minimum base-asset lot size
    pub min_qty: Decimal,
    /// Minimum order value in the quote asset
    pub min_notional: Decimal,
}

/// Result of an executed market order
#[derive(Debug, Clone)]
pub struct OrderResult {
    pub executed_qty: Decimal,
    pub quote_received: Decimal,
    pub avg_price: Decimal,
    pub fee: Decimal,
    pub fee_asset: String,
}

/// The exchange surface the rebalancer consumes
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn exchange_name(&self) -> &str;

    async fn market_sell(
        &self,
        base: &str,
        quote: &str,
        qty: Decimal,
        client_id: Option<&str>,
    ) -> Result<OrderResult>;

    async fn market_buy(
        &self,
        base: &str,
        quote: &str,
        qty: Decimal,
        client_id: Option<&str>,
    ) -> Result<OrderResult>;

    async fn balance(&self, asset: &str) -> Result<Decimal>;

    async fn min_order_requirements(&self, base: &str, quote: &str) -> Result<MinOrder>;

    async fn price(&self, base: &str, quote: &str) -> Result<Decimal>;
}

/// The quote-then-accept convert surface some exchanges offer instead of
/// market orders. Quotes are typically valid for about ten seconds; the
/// fee is embedded in the quoted ratio.
#[async_trait]
pub trait ConvertApi: Send + Sync {
    fn exchange_name(&self) -> &str;

    /// Request a quote to convert `qty` of `from` into `to`; returns
    /// (quote_id, ratio)
    async fn request_quote(&self, from: &str, to: &str, qty: Decimal)
        -> Result<(String, Decimal)>;

    async fn accept_quote(&self, quote_id: &str) -> Result<()>;

    /// Poll until the conversion settles; returns the received quantity
    async fn poll_status(&self, quote_id: &str) -> Result<Decimal>;

    async fn balance(&self, asset: &str) -> Result<Decimal>;

    async fn min_convert_qty(&self, from: &str, to: &str) -> Result<MinOrder>;

    async fn price(&self, base: &str, quote: &str) -> Result<Decimal>;
}

/// Adapter presenting a convert API as a market-order exchange
pub struct ConvertAdapter<C> {
    api: C,
}

impl<C: ConvertApi> ConvertAdapter<C> {
    pub fn new(api: C) -> Self {
        Self { api }
    }

    async fn convert(&self, from: &str, to: &str, qty: Decimal) -> Result<OrderResult> {
        let (quote_id, ratio) = self.api.request_quote(from, to, qty).await?;
        self.api.accept_quote(&quote_id).await?;
        let received = self.api.poll_status(&quote_id).await?;
        if ratio <= Decimal::ZERO {
            return Err(BridgeError::Exchange(format!(
                "convert quote {quote_id} carried a zero ratio"
            )));
        }
        Ok(OrderResult {
            executed_qty: qty,
            quote_received: received,
            avg_price: ratio,
            // Fee is embedded in the ratio, not reported separately
            fee: Decimal::ZERO,
            fee_asset: to.to_string(),
        })
    }
}

#[async_trait]
impl<C: ConvertApi> ExchangeAdapter for ConvertAdapter<C> {
    fn exchange_name(&self) -> &str {
        self.api.exchange_name()
    }

    async fn market_sell(
        &self,
        base: &str,
        quote: &str,
        qty: Decimal,
        _client_id: Option<&str>,
    ) -> Result<OrderResult> {
        self.convert(base, quote, qty).await
    }

    async fn market_buy(
        &self,
        base: &str,
        quote: &str,
        qty: Decimal,
        _client_id: Option<&str>,
    ) -> Result<OrderResult> {
        // Buying base with quote: convert in the opposite direction,
        // then express the result in base terms
        let price = self.api.price(base, quote).await?;
        let quote_qty = qty * price;
        let (quote_id, _ratio) = self.api.request_quote(quote, base, quote_qty).await?;
        self.api.accept_quote(&quote_id).await?;
        let received_base = self.api.poll_status(&quote_id).await?;
        Ok(OrderResult {
            executed_qty: received_base,
            quote_received: quote_qty,
            avg_price: price,
            fee: Decimal::ZERO,
            fee_asset: quote.to_string(),
        })
    }

    async fn balance(&self, asset: &str) -> Result<Decimal> {
        self.api.balance(asset).await
    }

    async fn min_order_requirements(&self, base: &str, quote: &str) -> Result<MinOrder> {
        self.api.min_convert_qty(base, quote).await
    }

    async fn price(&self, base: &str, quote: &str) -> Result<Decimal> {
        self.api.price(base, quote).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    struct MockConvert {
        accepted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ConvertApi for MockConvert {
        fn exchange_name(&self) -> &str {
            "mock-convert"
        }

        async fn request_quote(
            &self,
            _from: &str,
            _to: &str,
            qty: Decimal,
        ) -> Result<(String, Decimal)> {
            Ok((format!("q-{qty}"), dec!(0.0002)))
        }

        async fn accept_quote(&self, quote_id: &str) -> Result<()> {
            self.accepted.lock().push(quote_id.to_string());
            Ok(())
        }

        async fn poll_status(&self, _quote_id: &str) -> Result<Decimal> {
            Ok(dec!(0.002))
        }

        async fn balance(&self, _asset: &str) -> Result<Decimal> {
            Ok(dec!(100))
        }

        async fn min_convert_qty(&self, _from: &str, _to: &str) -> Result<MinOrder> {
            Ok(MinOrder {
                min_qty: dec!(1),
                min_notional: dec!(0.00001),
            })
        }

        async fn price(&self, _base: &str, _quote: &str) -> Result<Decimal> {
            Ok(dec!(0.0002))
        }
    }

    #[tokio::test]
    async fn convert_adapter_runs_the_three_step_sequence() {
        let adapter = ConvertAdapter::new(MockConvert {
            accepted: Mutex::new(Vec::new()),
        });
        let result = adapter
            .market_sell("HIVE", "BTC", dec!(10), Some("g-1"))
            .await
            .unwrap();
        assert_eq!(result.executed_qty, dec!(10));
        assert_eq!(result.quote_received, dec!(0.002));
        assert_eq!(result.avg_price, dec!(0.0002));
        // Fee embedded in the ratio
        assert_eq!(result.fee, Decimal::ZERO);
        assert_eq!(adapter.api.accepted.lock().len(), 1);
    }
}
