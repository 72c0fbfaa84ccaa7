use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use tracing::{debug, warn};

use crate::model::Delivery;

const BOT_API_BASE: &str = "https://api.telegram.org/";

/// Outbound chat delivery seam; the dispatcher and digest job only see this.
#[async_trait]
pub trait ChatSender: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<Delivery>;
}

/// Bot API client. A missing token disables the channel rather than erroring,
/// so a deployment without a bot still runs every other channel.
#[derive(Clone)]
pub struct BotClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl fmt::Debug for BotClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl BotClient {
    pub fn new(token: Option<String>) -> Self {
        let base_url = Url::parse(BOT_API_BASE).expect("valid default bot API URL");
        Self::with_base_url(token, base_url)
    }

    pub fn with_base_url(token: Option<String>, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("campus-ops/0.1")
            .no_proxy()
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            token,
        }
    }

    /// The Bot API puts the token in the URL path, not a header. Built by
    /// string concatenation: tokens contain a colon, which `Url::join` would
    /// misread as a scheme separator.
    pub fn build_send_request(&self, token: &str, chat_id: i64, text: &str) -> Result<reqwest::Request> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let endpoint = format!("{base}/bot{token}/sendMessage");
        self.http
            .post(endpoint)
            .json(&json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "Markdown",
            }))
            .build()
            .context("failed to build bot request")
    }
}

#[derive(Deserialize)]
struct BotApiResponse {
    ok: bool,
    description: Option<String>,
}

#[async_trait]
impl ChatSender for BotClient {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<Delivery> {
        let Some(token) = self.token.as_deref() else {
            warn!(chat_id, "bot token not configured; skipping chat send");
            return Ok(Delivery::Skipped);
        };

        let request = self.build_send_request(token, chat_id, text)?;
        debug!(chat_id, "sending bot message");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach bot API")?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("bot API error {}: {}", status, body));
        }

        let payload: BotApiResponse = res.json().await.context("invalid bot API response")?;
        if !payload.ok {
            return Err(anyhow!(
                "bot API rejected message: {}",
                payload.description.unwrap_or_default()
            ));
        }
        Ok(Delivery::Sent)
    }
}
