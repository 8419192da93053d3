//! Telegram Bot API client
//!
//! Used for remote-control polling and risk notifications.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{HttpConfig, TelegramConfig};
use crate::error::{Result, TradebotError};
use crate::risk::{DailyLossEvent, DailyLossNotifier};

pub const PARSE_MODE_MARKDOWN_V2: &str = "MarkdownV2";

const MARKDOWN_V2_SPECIALS: &str = "_*[]()~`>#+-=|{}.!\\";

/// Escape text for Telegram MarkdownV2.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for ch in text.chars() {
        if MARKDOWN_V2_SPECIALS.contains(ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'a str>,
}

#[derive(Clone)]
pub struct TelegramClient {
    client: Client,
    api_base: String,
    bot_token: String,
}

impl TelegramClient {
    pub fn new(api_base: &str, bot_token: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent("tradebot-telegram/0.1")
            .timeout(timeout)
            .build()
            .map_err(|e| {
                TradebotError::Internal(format!("failed to build Telegram HTTP client: {}", e))
            })?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.trim().to_string(),
        })
    }

    /// Client for a configured bot, `None` when no token is set.
    pub fn from_config(cfg: &TelegramConfig, http: &HttpConfig) -> Option<Self> {
        let token = cfg.bot_token.as_deref().map(str::trim).filter(|t| !t.is_empty())?;
        // long-poll requests need headroom over the poll timeout
        let timeout = Duration::from_secs(http.timeout_secs.max(cfg.poll_timeout_secs + 5));
        match Self::new(&cfg.api_base_url, token, timeout) {
            Ok(client) => Some(client),
            Err(e) => {
                warn!("Telegram client unavailable: {}", e);
                None
            }
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    /// `getUpdates`; `offset` is omitted when `None`.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
        limit: u32,
    ) -> Result<Vec<Value>> {
        let mut query = vec![
            ("timeout", timeout_secs.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(offset) = offset {
            query.push(("offset", offset.to_string()));
        }

        let resp = self
            .client
            .get(self.method_url("getUpdates"))
            .query(&query)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TradebotError::RemoteControl(format!(
                "getUpdates HTTP {}: {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            )));
        }

        let data: Value = resp.json().await?;
        if !data.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            return Err(TradebotError::RemoteControl(format!(
                "getUpdates returned ok=false: {}",
                data.get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
            )));
        }
        Ok(data
            .get("result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// `sendMessage`; retried once as plain text when Telegram cannot parse
    /// the markup.
    pub async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        parse_mode: Option<&str>,
    ) -> Result<()> {
        let (status, body) = self.post_message(chat_id, text, parse_mode).await?;
        if status == 200 {
            debug!("Telegram message sent to {}", chat_id);
            return Ok(());
        }
        warn!("Telegram message failed ({}): {}", status, body);

        if status == 400 && parse_mode.is_some() && body.to_lowercase().contains("can't parse entities") {
            let (status, body) = self.post_message(chat_id, text, None).await?;
            if status == 200 {
                return Ok(());
            }
            return Err(TradebotError::RemoteControl(format!(
                "Telegram fallback message failed ({}): {}",
                status, body
            )));
        }
        Err(TradebotError::RemoteControl(format!(
            "Telegram message failed ({}): {}",
            status, body
        )))
    }

    async fn post_message(
        &self,
        chat_id: &str,
        text: &str,
        parse_mode: Option<&str>,
    ) -> Result<(u16, String)> {
        let resp = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&SendMessage {
                chat_id,
                text,
                parse_mode,
            })
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Ok((status, body))
    }
}

/// Sends the daily-loss alert to the operator chat.
pub struct TelegramDailyLossNotifier {
    client: TelegramClient,
    chat_id: String,
}

impl TelegramDailyLossNotifier {
    pub fn new(client: TelegramClient, chat_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            client,
            chat_id: chat_id.into(),
        })
    }

    /// `None` unless both the bot token and chat id are configured.
    pub fn from_config(cfg: &TelegramConfig, http: &HttpConfig) -> Option<Arc<Self>> {
        let chat_id = cfg.chat_id.as_deref().map(str::trim).filter(|c| !c.is_empty())?;
        let client = TelegramClient::from_config(cfg, http)?;
        info!("Telegram daily loss notifications enabled");
        Some(Self::new(client, chat_id))
    }

    pub fn format_alert(event: &DailyLossEvent) -> String {
        format!(
            "🚨 *Daily loss limit triggered*\n\n\
             *Loss:* `{}%`\n\
             *Limit:* `\\-{}%`\n\
             *Start equity:* `${}`\n\
             *Current equity:* `${}`\n\n\
             Kill\\-Switch is active\\. New entries are blocked; stop\\-loss and take\\-profit still run\\.\n\
             Send `/resume` after review, or `/reset_daily` to start a new window\\.",
            escape_markdown(&format!("{:.2}", event.loss_pct)),
            escape_markdown(&format!("{:.2}", event.limit_pct)),
            escape_markdown(&format!("{:.2}", event.start_equity)),
            escape_markdown(&format!("{:.2}", event.current_equity)),
        )
    }
}

#[async_trait]
impl DailyLossNotifier for TelegramDailyLossNotifier {
    async fn notify_daily_loss(&self, event: &DailyLossEvent) -> Result<()> {
        self.client
            .send_message(
                &self.chat_id,
                &Self::format_alert(event),
                Some(PARSE_MODE_MARKDOWN_V2),
            )
            .await
    }
}
