use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::types::{CloseRequest, CloseResult, EntryRequest, EntryResult, TpslRequest, TpslResult};
use crate::error::{Result, TradebotError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    Paper,
    Hyperliquid,
    BinanceFutures,
    BackpackFutures,
}

impl Default for ExchangeKind {
    fn default() -> Self {
        Self::Paper
    }
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paper => "paper",
            Self::Hyperliquid => "hyperliquid",
            Self::BinanceFutures => "binance_futures",
            Self::BackpackFutures => "backpack_futures",
        }
    }
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "paper" | "sim" => Ok(Self::Paper),
            "hyperliquid" | "hl" => Ok(Self::Hyperliquid),
            "binance_futures" | "binanceusdm" => Ok(Self::BinanceFutures),
            "backpack_futures" => Ok(Self::BackpackFutures),
            _ => Err(
                "invalid trading backend; expected paper|hyperliquid|binance_futures|backpack_futures",
            ),
        }
    }
}

pub fn parse_exchange_kind(raw: &str) -> Result<ExchangeKind> {
    ExchangeKind::from_str(raw).map_err(|e| TradebotError::Validation(e.to_string()))
}

/// Unified order-execution interface, one implementation per backend.
///
/// `place_entry` and `close_position` never return `Err`: rejections,
/// connectivity failures and malformed responses are all reported through
/// the result's `errors` list.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn kind(&self) -> ExchangeKind;

    /// Whether orders reach a real exchange.
    fn is_live(&self) -> bool;

    /// Whether stop-loss/take-profit are held as native triggers on the
    /// exchange, making local SL/TP monitoring unnecessary.
    fn manages_protective_orders(&self) -> bool {
        false
    }

    async fn place_entry(&self, request: &EntryRequest) -> EntryResult;

    async fn close_position(&self, request: &CloseRequest) -> CloseResult;

    async fn update_tpsl(&self, _request: &TpslRequest) -> TpslResult {
        TpslResult::unsupported(self.kind())
    }
}
