use async_trait::async_trait;
use chrono::DateTime;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{http_client, Candle, MarketDataBackend, MarketDataClient};
use crate::error::{Result, TradebotError};

/// Binance USDⓈ-M futures public klines.
pub struct BinanceMarketDataClient {
    client: reqwest::Client,
    base_url: String,
}

impl BinanceMarketDataClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout, "tradebot-market-data/0.1")?,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
        })
    }

    fn parse_row(row: &[Value]) -> Option<Candle> {
        if row.len() < 6 {
            return None;
        }
        let num = |v: &Value| match v {
            Value::String(s) => s.parse::<f64>().ok(),
            other => other.as_f64(),
        };
        Some(Candle {
            open_time: DateTime::from_timestamp_millis(row[0].as_i64()?)?,
            open: num(&row[1])?,
            high: num(&row[2])?,
            low: num(&row[3])?,
            close: num(&row[4])?,
            volume: num(&row[5])?,
        })
    }

    /// `{"code": -1121, "msg": "Invalid symbol."}` becomes an exchange error
    /// carrying the message so callers can classify it.
    fn api_error(status: u16, body: &str) -> TradebotError {
        let parsed: Option<Value> = serde_json::from_str(body).ok();
        let msg = parsed
            .as_ref()
            .and_then(|v| v.get("msg"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| body.chars().take(200).collect());
        let code = parsed
            .as_ref()
            .and_then(|v| v.get("code"))
            .and_then(Value::as_i64);
        match code {
            Some(code) => TradebotError::Exchange(format!(
                "Binance API error (HTTP {}, code {}): {}",
                status, code, msg
            )),
            None => TradebotError::Exchange(format!("Binance API error (HTTP {}): {}", status, msg)),
        }
    }
}

#[async_trait]
impl MarketDataClient for BinanceMarketDataClient {
    fn backend(&self) -> MarketDataBackend {
        MarketDataBackend::Binance
    }

    async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let url = format!("{}/fapi/v1/klines", self.base_url);
        let limit = limit.clamp(1, 1500).to_string();
        let resp = self
            .client
            .get(&url)
            .query(&[("symbol", symbol), ("interval", interval), ("limit", &limit)])
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 429 || status.as_u16() == 418 {
            return Err(TradebotError::RateLimited(format!(
                "Binance klines HTTP {}",
                status.as_u16()
            )));
        }
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(Self::api_error(status.as_u16(), &body));
        }

        let rows: Vec<Vec<Value>> = serde_json::from_str(&body)?;
        let candles: Vec<Candle> = rows.iter().filter_map(|r| Self::parse_row(r)).collect();
        debug!("Fetched {} klines for {} ({})", candles.len(), symbol, interval);
        Ok(candles)
    }
}
