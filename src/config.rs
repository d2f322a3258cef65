//! Configuration for satbridge
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use uuid::Uuid;

/// On-chain message id prefix in production mode
pub const MESSAGE_PREFIX: &str = "v4vapp";
/// On-chain message id prefix in development mode
pub const MESSAGE_PREFIX_DEV: &str = "v4vapp_dev";

/// Satbridge - value bridge between Hive and a Lightning node
#[derive(Parser, Debug, Clone)]
#[command(name = "satbridge")]
#[command(about = "Bidirectional value bridge between Hive and a Lightning node")]
pub struct Args {
    /// Unique node identifier for this bridge instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Enable development mode (dev message prefix, account allow-list,
    /// stretched store timeouts)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "satbridge")]
    pub mongodb_db: String,

    /// Redis URL for the balance cache (optional; cache degrades to
    /// direct ledger reads when absent or unreachable)
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Hive API node URL
    #[arg(long, env = "HIVE_API_URL", default_value = "https://api.hive.blog")]
    pub hive_api_url: String,

    /// URL of the co-located Hive signing service for outbound broadcasts
    #[arg(long, env = "HIVE_WALLET_URL")]
    pub hive_wallet_url: Option<String>,

    /// Hive server account (receives deposits, sends replies)
    #[arg(long, env = "HIVE_SERVER_ACCOUNT")]
    pub hive_server_account: String,

    /// Hive treasury account
    #[arg(long, env = "HIVE_TREASURY_ACCOUNT", default_value = "")]
    pub hive_treasury_account: String,

    /// Hive funding (owner loan) account
    #[arg(long, env = "HIVE_FUNDING_ACCOUNT", default_value = "")]
    pub hive_funding_account: String,

    /// Hive account used for exchange deposits/withdrawals
    #[arg(long, env = "HIVE_EXCHANGE_ACCOUNT", default_value = "")]
    pub hive_exchange_account: String,

    /// Operator account whose "Balance adjustment" transfers bypass the ledger
    #[arg(long, env = "HIVE_OPERATOR_ACCOUNT", default_value = "")]
    pub hive_operator_account: String,

    /// Account whose posting metadata carries the live policy blob
    /// (defaults to the server account)
    #[arg(long, env = "POLICY_ACCOUNT")]
    pub policy_account: Option<String>,

    /// Witness account whose producer rewards are journaled
    #[arg(long, env = "WATCHED_WITNESS")]
    pub watched_witness: Option<String>,

    /// Start streaming from this block height instead of the persisted marker
    #[arg(long, env = "HIVE_START_BLOCK")]
    pub hive_start_block: Option<u64>,

    /// LND REST gateway URL
    #[arg(long, env = "LND_REST_URL", default_value = "https://localhost:8080")]
    pub lnd_rest_url: String,

    /// Hex-encoded admin macaroon for the LND REST gateway
    #[arg(long, env = "LND_MACAROON_HEX", default_value = "")]
    pub lnd_macaroon_hex: String,

    /// Friendly name of the Lightning node (ledger sub-account)
    #[arg(long, env = "LN_NODE_NAME", default_value = "lnd")]
    pub ln_node_name: String,

    /// Exchange name for the rebalancer
    #[arg(long, env = "EXCHANGE_NAME", default_value = "binance")]
    pub exchange_name: String,

    /// Exchange REST API base URL
    #[arg(long, env = "EXCHANGE_API_URL", default_value = "https://api.binance.com")]
    pub exchange_api_url: String,

    /// Exchange API key (rebalancer is disabled when unset)
    #[arg(long, env = "EXCHANGE_API_KEY")]
    pub exchange_api_key: Option<String>,

    /// Exchange API secret
    #[arg(long, env = "EXCHANGE_API_SECRET")]
    pub exchange_api_secret: Option<String>,

    /// Quote asset for rebalance trades
    #[arg(long, env = "EXCHANGE_QUOTE_ASSET", default_value = "BTC")]
    pub exchange_quote_asset: String,

    /// Telegram bot token for notifications (optional)
    #[arg(long, env = "TELEGRAM_BOT_TOKEN")]
    pub telegram_bot_token: Option<String>,

    /// Telegram chat id for notifications
    #[arg(long, env = "TELEGRAM_CHAT_ID")]
    pub telegram_chat_id: Option<i64>,

    /// Comma-separated component names silenced from notifications
    #[arg(long, env = "NOTIFY_SILENCE", default_value = "")]
    pub notify_silence: String,

    /// Comma-separated accounts allowed in development mode
    #[arg(long, env = "DEV_ALLOWLIST", default_value = "")]
    pub dev_allowlist: String,

    /// Comma-separated accounts blocked from using the bridge
    #[arg(long, env = "BLOCKED_ACCOUNTS", default_value = "")]
    pub blocked_accounts: String,

    /// Re-alert interval for repeated error codes, in seconds
    #[arg(long, env = "ERROR_REALERT_SECS", default_value = "3600")]
    pub error_realert_secs: u64,
}

impl Args {
    /// Message id prefix for outbound custom-json envelopes
    pub fn message_prefix(&self) -> &'static str {
        if self.dev_mode {
            MESSAGE_PREFIX_DEV
        } else {
            MESSAGE_PREFIX
        }
    }

    /// Custom-json ids the Hive watcher tracks
    pub fn tracked_message_ids(&self) -> Vec<String> {
        let prefix = self.message_prefix();
        vec![format!("{prefix}_transfer"), format!("{prefix}_notification")]
    }

    /// Account whose metadata carries the policy blob
    pub fn policy_account(&self) -> &str {
        self.policy_account
            .as_deref()
            .unwrap_or(&self.hive_server_account)
    }

    /// Accounts whose operations the Hive watcher extracts
    pub fn watched_accounts(&self) -> Vec<String> {
        let mut accounts = vec![self.hive_server_account.clone()];
        for acc in [
            &self.hive_treasury_account,
            &self.hive_funding_account,
            &self.hive_exchange_account,
            &self.hive_operator_account,
        ] {
            if !acc.is_empty() {
                accounts.push(acc.clone());
            }
        }
        accounts
    }

    /// Document-store operation timeout: 10 s in production, 10 min in dev
    pub fn store_timeout(&self) -> std::time::Duration {
        if self.dev_mode {
            std::time::Duration::from_secs(600)
        } else {
            std::time::Duration::from_secs(10)
        }
    }

    fn split_list(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn dev_allowlist(&self) -> Vec<String> {
        Self::split_list(&self.dev_allowlist)
    }

    pub fn blocked_accounts(&self) -> Vec<String> {
        Self::split_list(&self.blocked_accounts)
    }

    pub fn silenced_components(&self) -> Vec<String> {
        Self::split_list(&self.notify_silence)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.hive_server_account.is_empty() {
            return Err("HIVE_SERVER_ACCOUNT is required".to_string());
        }
        if !self.dev_mode && self.lnd_macaroon_hex.is_empty() {
            return Err("LND_MACAROON_HEX is required in production mode".to_string());
        }
        if self.exchange_api_key.is_some() != self.exchange_api_secret.is_some() {
            return Err(
                "EXCHANGE_API_KEY and EXCHANGE_API_SECRET must be set together".to_string(),
            );
        }
        if self.telegram_bot_token.is_some() && self.telegram_chat_id.is_none() {
            return Err("TELEGRAM_CHAT_ID is required with TELEGRAM_BOT_TOKEN".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args::parse_from(["satbridge", "--hive-server-account", "bridge-server", "--dev-mode"])
    }

    #[test]
    fn message_prefix_follows_dev_mode() {
        let mut args = base_args();
        assert_eq!(args.message_prefix(), "v4vapp_dev");
        args.dev_mode = false;
        assert_eq!(args.message_prefix(), "v4vapp");
    }

    #[test]
    fn tracked_ids_use_prefix() {
        let args = base_args();
        assert_eq!(
            args.tracked_message_ids(),
            vec!["v4vapp_dev_transfer", "v4vapp_dev_notification"]
        );
    }

    #[test]
    fn list_splitting_ignores_blanks() {
        let mut args = base_args();
        args.dev_allowlist = "alice, bob,,carol ".to_string();
        assert_eq!(args.dev_allowlist(), vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn validate_requires_paired_exchange_keys() {
        let mut args = base_args();
        args.exchange_api_key = Some("key".to_string());
        assert!(args.validate().is_err());
        args.exchange_api_secret = Some("secret".to_string());
        assert!(args.validate().is_ok());
    }
}
