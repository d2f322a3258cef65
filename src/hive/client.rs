//! Hive JSON-RPC client and outbound broadcast seam
//!
//! Reads go straight to a public API node over JSON-RPC. Outbound
//! broadcasts (transfers and custom-json messages) go through the
//! `HiveWallet` trait; the production implementation posts to a
//! co-located signing service, since transaction signing is delegated.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::types::{BridgeError, Result};

/// Deadline for every Hive RPC call
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON-RPC client for a Hive API node
#[derive(Clone)]
pub struct HiveRpc {
    http: reqwest::Client,
    api_url: String,
}

impl HiveRpc {
    pub fn new(api_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .map_err(|e| BridgeError::HiveRpc(format!("client build failed: {e}")))?;
        Ok(Self {
            http,
            api_url: api_url.to_string(),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });
        let resp = self
            .http
            .post(&self.api_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::HiveRpc(format!("{method} request failed: {e}")))?;

        let value: Value = resp
            .json()
            .await
            .map_err(|e| BridgeError::HiveRpc(format!("{method} bad response: {e}")))?;

        if let Some(err) = value.get("error") {
            return Err(BridgeError::HiveRpc(format!("{method} error: {err}")));
        }
        value
            .get("result")
            .cloned()
            .ok_or_else(|| BridgeError::HiveRpc(format!("{method} missing result")))
    }

    /// Current head block number
    pub async fn head_block_num(&self) -> Result<u64> {
        let props = self
            .call("condenser_api.get_dynamic_global_properties", json!([]))
            .await?;
        props
            .get("head_block_number")
            .and_then(Value::as_u64)
            .ok_or_else(|| BridgeError::HiveRpc("missing head_block_number".to_string()))
    }

    /// Fetch a block; None when the block does not exist yet
    pub async fn get_block(&self, height: u64) -> Result<Option<Value>> {
        let block = self.call("condenser_api.get_block", json!([height])).await?;
        if block.is_null() {
            return Ok(None);
        }
        Ok(Some(block))
    }

    /// Virtual operations for a block (producer rewards, fill orders)
    pub async fn get_ops_in_block(&self, height: u64) -> Result<Vec<Value>> {
        let ops = self
            .call("condenser_api.get_ops_in_block", json!([height, true]))
            .await?;
        Ok(ops.as_array().cloned().unwrap_or_default())
    }

    /// Account's posting metadata JSON, parsed; None when absent
    pub async fn get_posting_metadata(&self, account: &str) -> Result<Option<Value>> {
        let accounts = self
            .call("condenser_api.get_accounts", json!([[account]]))
            .await?;
        let Some(acc) = accounts.as_array().and_then(|a| a.first()) else {
            return Ok(None);
        };
        let raw = acc
            .get("posting_json_metadata")
            .and_then(Value::as_str)
            .unwrap_or("");
        if raw.is_empty() {
            return Ok(None);
        }
        let parsed: Value = serde_json::from_str(raw).map_err(|e| {
            BridgeError::HiveRpc(format!("invalid posting metadata for {account}: {e}"))
        })?;
        Ok(Some(parsed))
    }
}

/// Outbound on-chain transfer request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundTransfer {
    pub from_account: String,
    pub to_account: String,
    /// Display amount like "24.998 HIVE"
    pub amount: String,
    pub memo: String,
}

/// Outbound custom-json envelope.
///
/// Two kinds, distinguished by the `id` suffix: `<prefix>_transfer`
/// moves value; `<prefix>_notification` is informational and never
/// acted on by the watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Full on-chain message id including the prefix
    pub id: String,
    pub from_account: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_account: Option<String>,
    pub memo: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msats: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_group_id: Option<String>,
    /// Set on `<prefix>_notification` messages
    #[serde(default)]
    pub notification: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_message: Option<String>,
    /// Group id embedded so the reply event reattaches to its chain
    pub group_id: String,
}

/// Seam for signed outbound broadcasts
#[async_trait]
pub trait HiveWallet: Send + Sync {
    /// Broadcast an on-chain transfer; returns the transaction id
    async fn send_transfer(&self, transfer: &OutboundTransfer) -> Result<String>;

    /// Broadcast a custom-json message; returns the transaction id
    async fn send_message(&self, message: &OutboundMessage) -> Result<String>;
}

/// Wallet implementation backed by the co-located signing service
#[derive(Clone)]
pub struct SigningServiceWallet {
    http: reqwest::Client,
    wallet_url: String,
}

impl SigningServiceWallet {
    pub fn new(wallet_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .map_err(|e| BridgeError::HiveRpc(format!("client build failed: {e}")))?;
        Ok(Self {
            http,
            wallet_url: wallet_url.to_string(),
        })
    }

    async fn post(&self, path: &str, body: &Value) -> Result<String> {
        let url = format!("{}/{path}", self.wallet_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| BridgeError::HiveRpc(format!("wallet {path} failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(BridgeError::HiveRpc(format!(
                "wallet {path} returned {}",
                resp.status()
            )));
        }
        let value: Value = resp
            .json()
            .await
            .map_err(|e| BridgeError::HiveRpc(format!("wallet {path} bad response: {e}")))?;
        let trx_id = value
            .get("trx_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        debug!(trx_id = %trx_id, "Wallet broadcast accepted");
        Ok(trx_id)
    }
}

#[async_trait]
impl HiveWallet for SigningServiceWallet {
    async fn send_transfer(&self, transfer: &OutboundTransfer) -> Result<String> {
        let body = serde_json::to_value(transfer)
            .map_err(|e| BridgeError::HiveRpc(format!("transfer encode failed: {e}")))?;
        self.post("broadcast/transfer", &body).await
    }

    async fn send_message(&self, message: &OutboundMessage) -> Result<String> {
        let body = serde_json::to_value(message)
            .map_err(|e| BridgeError::HiveRpc(format!("message encode failed: {e}")))?;
        self.post("broadcast/custom_json", &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_message_round_trips() {
        let msg = OutboundMessage {
            id: "v4vapp_notification".to_string(),
            from_account: "bridge-server".to_string(),
            to_account: Some("alice".to_string()),
            memo: "Insufficient Keepsats balance".to_string(),
            msats: Some(5_000_000),
            parent_group_id: Some("abcd-1234".to_string()),
            notification: true,
            invoice_message: None,
            group_id: "efgh-5678".to_string(),
        };
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: OutboundMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, msg.id);
        assert_eq!(decoded.parent_group_id, msg.parent_group_id);
        assert_eq!(decoded.msats, msg.msats);
        assert!(decoded.notification);
    }

    #[test]
    fn transfer_encodes_display_amount() {
        let t = OutboundTransfer {
            from_account: "bridge-server".to_string(),
            to_account: "alice".to_string(),
            amount: "24.998 HIVE".to_string(),
            memo: "refund".to_string(),
        };
        let v = serde_json::to_value(&t).unwrap();
        assert_eq!(v["amount"], "24.998 HIVE");
    }
}
