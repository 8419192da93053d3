//! Public market data (candles and mark prices) per backend.

mod backpack;
mod binance;

pub use backpack::BackpackMarketDataClient;
pub use binance::BinanceMarketDataClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, HttpConfig, RuntimeOverrides};
use crate::error::{Result, TradebotError};

/// A single candlestick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketDataBackend {
    Binance,
    Backpack,
}

impl MarketDataBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Backpack => "backpack",
        }
    }
}

impl fmt::Display for MarketDataBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketDataBackend {
    type Err = TradebotError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "binance" => Ok(Self::Binance),
            "backpack" => Ok(Self::Backpack),
            other => Err(TradebotError::Validation(format!(
                "unknown market data backend '{}'; expected binance|backpack",
                other
            ))),
        }
    }
}

/// Candle source for the trading loop. Symbols use Binance notation
/// (`BTCUSDT`); each backend maps them to its own contract names.
#[async_trait]
pub trait MarketDataClient: Send + Sync {
    fn backend(&self) -> MarketDataBackend;

    async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>>;
}

/// Binance-style symbol for a coin.
pub fn coin_symbol(coin: &str) -> String {
    format!("{}USDT", coin.trim().to_ascii_uppercase())
}

fn http_client(timeout: Duration, agent: &str) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(agent)
        .timeout(timeout)
        .build()
        .map_err(|e| TradebotError::Internal(format!("failed to build market data client: {}", e)))
}

/// Market data client for the effective `MARKET_DATA_BACKEND`.
pub fn build_market_data_client(
    cfg: &AppConfig,
    overrides: &RuntimeOverrides,
) -> Result<Arc<dyn MarketDataClient>> {
    let backend: MarketDataBackend = overrides.effective_market_data_backend(cfg).parse()?;
    build_market_data_client_for(backend, cfg)
}

pub fn build_market_data_client_for(
    backend: MarketDataBackend,
    cfg: &AppConfig,
) -> Result<Arc<dyn MarketDataClient>> {
    let http = &cfg.http;
    Ok(match backend {
        MarketDataBackend::Binance => Arc::new(BinanceMarketDataClient::new(
            &cfg.market_data.binance_base_url,
            timeout(http),
        )?),
        MarketDataBackend::Backpack => Arc::new(BackpackMarketDataClient::new(
            &cfg.market_data.backpack_base_url,
            timeout(http),
        )?),
    })
}

fn timeout(http: &HttpConfig) -> Duration {
    Duration::from_secs(http.timeout_secs.max(1))
}
