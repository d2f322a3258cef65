//! Telegram Bot API transport

use serde_json::{json, Value};
use std::time::Duration;

use crate::notify::{NotificationTransport, TransportError};

/// Connect / read deadlines for the Bot API
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

pub struct TelegramBot {
    http: reqwest::Client,
    name: String,
    token: String,
    chat_id: i64,
}

impl TelegramBot {
    pub fn new(name: &str, token: &str, chat_id: i64) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .build()
            .map_err(|e| TransportError {
                message: format!("client build failed: {e}"),
                transient: false,
                retry_after: None,
            })?;
        Ok(Self {
            http,
            name: name.to_string(),
            token: token.to_string(),
            chat_id,
        })
    }
}

#[async_trait::async_trait]
impl NotificationTransport for TelegramBot {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, text: &str) -> Result<(), TransportError> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let resp = self
            .http
            .post(&url)
            .json(&json!({ "chat_id": self.chat_id, "text": text }))
            .send()
            .await
            .map_err(|e| TransportError {
                message: format!("send failed: {e}"),
                transient: true,
                retry_after: None,
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let body: Value = resp.json().await.unwrap_or_default();
        // 429 carries an explicit retry window
        let retry_after = body
            .get("parameters")
            .and_then(|p| p.get("retry_after"))
            .and_then(Value::as_u64)
            .map(Duration::from_secs);
        let description = body
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");

        Err(TransportError {
            message: format!("Telegram returned {status}: {description}"),
            transient: status.as_u16() == 429 || status.is_server_error(),
            retry_after,
        })
    }
}
