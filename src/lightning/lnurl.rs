//! Lightning-address resolution
//!
//! Turns `user@host` into a BOLT-11 invoice via the host's well-known
//! LNURL-pay endpoint, validating the requested amount against the
//! endpoint's sendable range.

use serde::Deserialize;
use std::time::Duration;

use crate::types::{BridgeError, Result};

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct PayParams {
    callback: String,
    #[serde(rename = "minSendable")]
    min_sendable: i64,
    #[serde(rename = "maxSendable")]
    max_sendable: i64,
}

#[derive(Debug, Deserialize)]
struct PayCallback {
    pr: Option<String>,
    #[serde(default)]
    reason: String,
}

/// Split a lightning address into (user, host)
pub fn parse_lightning_address(address: &str) -> Result<(String, String)> {
    let Some((user, host)) = address.split_once('@') else {
        return Err(BridgeError::Rejected(format!(
            "not a lightning address: {address}"
        )));
    };
    if user.is_empty() || !host.contains('.') {
        return Err(BridgeError::Rejected(format!(
            "not a lightning address: {address}"
        )));
    }
    Ok((user.to_string(), host.to_string()))
}

/// Resolve an address to a BOLT-11 invoice for `msats`
pub async fn resolve_lightning_address(
    http: &reqwest::Client,
    address: &str,
    msats: i64,
) -> Result<String> {
    let (user, host) = parse_lightning_address(address)?;
    let params_url = format!("https://{host}/.well-known/lnurlp/{user}");

    let params: PayParams = http
        .get(&params_url)
        .timeout(RESOLVE_TIMEOUT)
        .send()
        .await
        .map_err(|e| BridgeError::Lightning(format!("lnurl fetch failed for {address}: {e}")))?
        .json()
        .await
        .map_err(|e| BridgeError::Lightning(format!("lnurl params invalid for {address}: {e}")))?;

    if msats < params.min_sendable || msats > params.max_sendable {
        return Err(BridgeError::Rejected(format!(
            "{address} accepts {}..{} msats, requested {msats}",
            params.min_sendable, params.max_sendable
        )));
    }

    let sep = if params.callback.contains('?') { '&' } else { '?' };
    let callback_url = format!("{}{sep}amount={msats}", params.callback);
    let reply: PayCallback = http
        .get(&callback_url)
        .timeout(RESOLVE_TIMEOUT)
        .send()
        .await
        .map_err(|e| BridgeError::Lightning(format!("lnurl callback failed for {address}: {e}")))?
        .json()
        .await
        .map_err(|e| {
            BridgeError::Lightning(format!("lnurl callback invalid for {address}: {e}"))
        })?;

    reply.pr.ok_or_else(|| {
        BridgeError::Lightning(format!(
            "lnurl callback for {address} returned no invoice: {}",
            reply.reason
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_address() {
        let (user, host) = parse_lightning_address("alice@getalby.com").unwrap();
        assert_eq!(user, "alice");
        assert_eq!(host, "getalby.com");
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(parse_lightning_address("alice").is_err());
        assert!(parse_lightning_address("@host.com").is_err());
        assert!(parse_lightning_address("alice@nohost").is_err());
    }
}
