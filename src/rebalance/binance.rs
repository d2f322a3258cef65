//! Binance spot adapter
//!
//! Market orders with HMAC-signed requests, minimum-order filters from
//! exchangeInfo, and ticker prices. Also implements the engine's quote
//! source by composing the HIVE/BTC and HBD/BTC tickers.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::engine::QuoteSource;
use crate::money::MarketQuote;
use crate::rebalance::exchange::{ExchangeAdapter, MinOrder, OrderResult, EXCHANGE_TIMEOUT};
use crate::types::{BridgeError, Result};

type HmacSha256 = Hmac<Sha256>;

pub struct BinanceSpot {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl BinanceSpot {
    pub fn new(base_url: &str, api_key: &str, api_secret: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(EXCHANGE_TIMEOUT)
            .build()
            .map_err(|e| BridgeError::Exchange(format!("client build failed: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        })
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
    }

    async fn public_get(&self, path: &str) -> Result<Value> {
        let resp = self
            .http
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .map_err(|e| BridgeError::Exchange(format!("GET {path} failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(BridgeError::Exchange(format!(
                "GET {path} returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| BridgeError::Exchange(format!("GET {path} bad body: {e}")))
    }

    async fn signed_post(&self, path: &str, query: &str) -> Result<Value> {
        let query = format!("{query}&timestamp={}", Self::timestamp_ms());
        let signature = self.sign(&query);
        let url = format!("{}{path}?{query}&signature={signature}", self.base_url);
        let resp = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| BridgeError::Exchange(format!("POST {path} failed: {e}")))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| BridgeError::Exchange(format!("POST {path} bad body: {e}")))?;
        if !status.is_success() {
            let code = body.get("code").and_then(Value::as_i64).unwrap_or(0);
            let msg = body
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            // NOTIONAL / LOT_SIZE filter failures
            if code == -1013 {
                return Err(BridgeError::ExchangeBelowMinimum(msg.to_string()));
            }
            return Err(BridgeError::Exchange(format!(
                "POST {path} returned {status}: {code} {msg}"
            )));
        }
        Ok(body)
    }

    async fn market_order(
        &self,
        symbol: &str,
        side: &str,
        qty: Decimal,
        client_id: Option<&str>,
    ) -> Result<OrderResult> {
        let mut query = format!("symbol={symbol}&side={side}&type=MARKET&quantity={qty}");
        if let Some(id) = client_id {
            // Client order ids are capped at 36 chars
            let id: String = id.chars().take(36).collect();
            query.push_str(&format!("&newClientOrderId={id}"));
        }
        let body = self.signed_post("/api/v3/order", &query).await?;
        parse_order_result(&body)
    }
}

fn decimal_field(v: &Value, key: &str) -> Decimal {
    v.get(key)
        .and_then(Value::as_str)
        .and_then(|s| Decimal::from_str(s).ok())
        .unwrap_or(Decimal::ZERO)
}

fn parse_order_result(body: &Value) -> Result<OrderResult> {
    let executed_qty = decimal_field(body, "executedQty");
    let quote_received = decimal_field(body, "cummulativeQuoteQty");
    if executed_qty <= Decimal::ZERO {
        return Err(BridgeError::Exchange("order filled nothing".to_string()));
    }
    let avg_price = quote_received / executed_qty;

    let mut fee = Decimal::ZERO;
    let mut fee_asset = String::new();
    if let Some(fills) = body.get("fills").and_then(Value::as_array) {
        for fill in fills {
            fee += decimal_field(fill, "commission");
            if fee_asset.is_empty() {
                fee_asset = fill
                    .get("commissionAsset")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
            }
        }
    }

    Ok(OrderResult {
        executed_qty,
        quote_received,
        avg_price,
        fee,
        fee_asset,
    })
}

fn parse_min_order(info: &Value, symbol: &str) -> MinOrder {
    let mut min = MinOrder::default();
    let Some(symbols) = info.get("symbols").and_then(Value::as_array) else {
        return min;
    };
    let Some(entry) = symbols
        .iter()
        .find(|s| s.get("symbol").and_then(Value::as_str) == Some(symbol))
    else {
        return min;
    };
    let Some(filters) = entry.get("filters").and_then(Value::as_array) else {
        return min;
    };
    for filter in filters {
        match filter.get("filterType").and_then(Value::as_str) {
            Some("LOT_SIZE") => min.min_qty = decimal_field(filter, "minQty"),
            Some("NOTIONAL") | Some("MIN_NOTIONAL") => {
                min.min_notional = decimal_field(filter, "minNotional")
            }
            _ => {}
        }
    }
    min
}

#[async_trait]
impl ExchangeAdapter for BinanceSpot {
    fn exchange_name(&self) -> &str {
        "binance"
    }

    async fn market_sell(
        &self,
        base: &str,
        quote: &str,
        qty: Decimal,
        client_id: Option<&str>,
    ) -> Result<OrderResult> {
        self.market_order(&format!("{base}{quote}"), "SELL", qty, client_id)
            .await
    }

    async fn market_buy(
        &self,
        base: &str,
        quote: &str,
        qty: Decimal,
        client_id: Option<&str>,
    ) -> Result<OrderResult> {
        self.market_order(&format!("{base}{quote}"), "BUY", qty, client_id)
            .await
    }

    async fn balance(&self, asset: &str) -> Result<Decimal> {
        let body = self.signed_post("/api/v3/account", "").await?;
        let balances = body
            .get("balances")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(balances
            .iter()
            .find(|b| b.get("asset").and_then(Value::as_str) == Some(asset))
            .map(|b| decimal_field(b, "free"))
            .unwrap_or(Decimal::ZERO))
    }

    async fn min_order_requirements(&self, base: &str, quote: &str) -> Result<MinOrder> {
        let symbol = format!("{base}{quote}");
        let info = self
            .public_get(&format!("/api/v3/exchangeInfo?symbol={symbol}"))
            .await?;
        Ok(parse_min_order(&info, &symbol))
    }

    async fn price(&self, base: &str, quote: &str) -> Result<Decimal> {
        let body = self
            .public_get(&format!("/api/v3/ticker/price?symbol={base}{quote}"))
            .await?;
        let price = decimal_field(&body, "price");
        if price <= Decimal::ZERO {
            return Err(BridgeError::Exchange(format!(
                "no price for {base}{quote}"
            )));
        }
        Ok(price)
    }
}

#[async_trait]
impl QuoteSource for BinanceSpot {
    async fn market_quote(&self) -> Result<MarketQuote> {
        let hive_btc = self.price("HIVE", "BTC").await?;
        let btc_usd = self.price("BTC", "USDT").await?;
        // HBD targets a dollar; value it through BTC/USDT
        let sats_per_hive = (hive_btc * Decimal::from(100_000_000))
            .to_f64()
            .unwrap_or(0.0);
        let usd_per_hive = (hive_btc * btc_usd).to_f64().unwrap_or(0.0);
        let sats_per_hbd = if btc_usd > Decimal::ZERO {
            (Decimal::from(100_000_000) / btc_usd).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };
        Ok(MarketQuote {
            sats_per_hive,
            sats_per_hbd,
            usd_per_hive,
            usd_per_hbd: 1.0,
            fetched_at: chrono::Utc::now(),
            source: "binance".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn parses_order_result_with_fills() {
        let body = json!({
            "executedQty": "10.000",
            "cummulativeQuoteQty": "0.00200000",
            "fills": [
                { "commission": "0.00000100", "commissionAsset": "BTC" },
                { "commission": "0.00000050", "commissionAsset": "BTC" }
            ]
        });
        let result = parse_order_result(&body).unwrap();
        assert_eq!(result.executed_qty, dec!(10));
        assert_eq!(result.quote_received, dec!(0.002));
        assert_eq!(result.fee, dec!(0.0000015));
        assert_eq!(result.fee_asset, "BTC");
        assert_eq!(result.avg_price, dec!(0.0002));
    }

    #[test]
    fn empty_fill_is_an_error() {
        let body = json!({ "executedQty": "0", "cummulativeQuoteQty": "0" });
        assert!(parse_order_result(&body).is_err());
    }

    #[test]
    fn parses_exchange_info_filters() {
        let info = json!({
            "symbols": [{
                "symbol": "HIVEBTC",
                "filters": [
                    { "filterType": "LOT_SIZE", "minQty": "1.00000000" },
                    { "filterType": "NOTIONAL", "minNotional": "0.00010000" }
                ]
            }]
        });
        let min = parse_min_order(&info, "HIVEBTC");
        assert_eq!(min.min_qty, dec!(1));
        assert_eq!(min.min_notional, dec!(0.0001));
    }

    #[test]
    fn missing_symbol_yields_zero_minimums() {
        let min = parse_min_order(&json!({ "symbols": [] }), "HIVEBTC");
        assert_eq!(min.min_qty, Decimal::ZERO);
    }
}
