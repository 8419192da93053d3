use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::{http_client, Candle, MarketDataBackend, MarketDataClient};
use crate::config::interval_seconds;
use crate::error::{Result, TradebotError};

/// Backpack public market data. Binance-style symbols are mapped onto the
/// USDC perpetual contracts.
pub struct BackpackMarketDataClient {
    client: reqwest::Client,
    base_url: String,
}

impl BackpackMarketDataClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = base_url.trim().trim_end_matches('/');
        let base = if base.is_empty() {
            "https://api.backpack.exchange"
        } else {
            base
        };
        Ok(Self {
            client: http_client(timeout, "tradebot-market-data/0.1")?,
            base_url: base.to_string(),
        })
    }

    /// `BTCUSDT` -> `BTC_USDC_PERP`; names that already contain `_` are kept.
    pub fn normalize_symbol(symbol: &str) -> String {
        let raw = symbol.trim().to_ascii_uppercase();
        if raw.is_empty() || raw.contains('_') {
            return raw;
        }
        match raw.strip_suffix("USDT") {
            Some(base) if !base.is_empty() => format!("{}_USDC_PERP", base),
            _ => raw,
        }
    }

    /// Mark price entry for one contract, `None` when the exchange does not
    /// list it. Transport failures are errors.
    pub async fn mark_price_entry(&self, symbol: &str) -> Result<Option<Value>> {
        let normalized = Self::normalize_symbol(symbol);
        let url = format!("{}/api/v1/markPrices", self.base_url);
        let mut req = self.client.get(&url);
        if !normalized.is_empty() {
            req = req.query(&[("symbol", normalized.as_str())]);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        if status.is_client_error() && status.as_u16() != 429 {
            debug!("Backpack markPrices HTTP {} for {}: {}", status.as_u16(), normalized, body);
            return Ok(None);
        }
        if !status.is_success() {
            return Err(TradebotError::Exchange(format!(
                "Backpack markPrices HTTP {}: {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            )));
        }

        let data: Value = serde_json::from_str(&body)?;
        Ok(match data {
            Value::Object(_) => Some(data),
            Value::Array(items) => items.into_iter().find(|item| {
                item.is_object()
                    && (normalized.is_empty()
                        || item.get("symbol").and_then(Value::as_str) == Some(normalized.as_str()))
            }),
            _ => None,
        })
    }

    /// Whether the contract exists, with the normalised name that was looked up.
    pub async fn symbol_exists(&self, symbol: &str) -> Result<(bool, String)> {
        let normalized = Self::normalize_symbol(symbol);
        let entry = self.mark_price_entry(symbol).await?;
        Ok((entry.is_some(), normalized))
    }

    pub async fn mark_price(&self, symbol: &str) -> Result<Option<f64>> {
        Ok(self
            .mark_price_entry(symbol)
            .await?
            .and_then(|e| e.get("markPrice").and_then(number)))
    }

    fn parse_item(item: &Value) -> Option<Candle> {
        Some(Candle {
            open_time: item.get("start").and_then(parse_time)?,
            open: item.get("open").and_then(number)?,
            high: item.get("high").and_then(number)?,
            low: item.get("low").and_then(number)?,
            close: item.get("close").and_then(number)?,
            volume: item.get("volume").and_then(number).unwrap_or(0.0),
        })
    }
}

fn number(v: &Value) -> Option<f64> {
    match v {
        Value::String(s) => s.trim().parse().ok(),
        other => other.as_f64(),
    }
}

fn parse_time(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::Number(n) => {
            let raw = n.as_i64()?;
            // seconds vs milliseconds
            if raw > 10_000_000_000 {
                DateTime::from_timestamp_millis(raw)
            } else {
                DateTime::from_timestamp(raw, 0)
            }
        }
        Value::String(s) => {
            let s = s.trim();
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
                        .ok()
                        .map(|naive| naive.and_utc())
                })
        }
        _ => None,
    }
}

#[async_trait]
impl MarketDataClient for BackpackMarketDataClient {
    fn backend(&self) -> MarketDataBackend {
        MarketDataBackend::Backpack
    }

    async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let normalized = Self::normalize_symbol(symbol);
        let bar_secs = interval_seconds(interval).unwrap_or(60) as i64;
        let start = Utc::now().timestamp() - i64::from(limit.max(1)) * bar_secs;

        let url = format!("{}/api/v1/klines", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("symbol", normalized.clone()),
                ("interval", interval.to_string()),
                ("startTime", start.to_string()),
            ])
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            warn!(
                "Backpack klines HTTP {} for {}: {}",
                status.as_u16(),
                normalized,
                body.chars().take(200).collect::<String>()
            );
            return Err(TradebotError::MarketDataUnavailable(format!(
                "Backpack klines HTTP {} for {}",
                status.as_u16(),
                normalized
            )));
        }

        let data: Value = serde_json::from_str(&body)?;
        let candles: Vec<Candle> = data
            .as_array()
            .map(|items| items.iter().filter_map(Self::parse_item).collect())
            .unwrap_or_default();
        debug!("Fetched {} klines for {} ({})", candles.len(), normalized, interval);
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_binance_notation() {
        assert_eq!(BackpackMarketDataClient::normalize_symbol("btcusdt"), "BTC_USDC_PERP");
        assert_eq!(BackpackMarketDataClient::normalize_symbol("SOL_USDC_PERP"), "SOL_USDC_PERP");
        assert_eq!(BackpackMarketDataClient::normalize_symbol("USDT"), "USDT");
        assert_eq!(BackpackMarketDataClient::normalize_symbol("ETHBTC"), "ETHBTC");
    }

    #[test]
    fn parses_kline_objects() {
        let item = json!({
            "start": "2025-05-06 12:00:00",
            "end": "2025-05-06 12:15:00",
            "open": "3000.1",
            "high": "3010",
            "low": "2990.5",
            "close": "3005",
            "volume": "12.5"
        });
        let candle = BackpackMarketDataClient::parse_item(&item).expect("item should parse");
        assert_eq!(candle.high, 3010.0);
        assert_eq!(candle.volume, 12.5);
        assert_eq!(candle.open_time.to_rfc3339(), "2025-05-06T12:00:00+00:00");
    }

    #[test]
    fn numeric_start_accepts_seconds_and_millis() {
        let secs = parse_time(&json!(1_700_000_000)).expect("seconds");
        let millis = parse_time(&json!(1_700_000_000_000i64)).expect("millis");
        assert_eq!(secs, millis);
    }
}
