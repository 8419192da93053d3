use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use super::ExchangeKind;
use crate::error::TradebotError;

/// Order statuses every backend treats as a failed order.
pub const FAILURE_STATUSES: &[&str] = &["rejected", "expired", "canceled", "cancelled", "error"];

pub fn is_failure_status(status: &str) -> bool {
    FAILURE_STATUSES.contains(&status.trim().to_ascii_lowercase().as_str())
}

/// Drop empty and repeated messages, keeping first-seen order.
pub fn dedup_errors(errors: Vec<String>) -> Vec<String> {
    let mut seen = Vec::with_capacity(errors.len());
    for e in errors {
        if !e.is_empty() && !seen.contains(&e) {
            seen.push(e);
        }
    }
    seen
}

/// Human-readable text for an adapter-internal error, without the category prefix.
pub fn error_text(err: &TradebotError) -> String {
    match err {
        TradebotError::Exchange(msg) | TradebotError::OrderRejected(msg) => msg.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    #[default]
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PositionSide {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "long" | "buy" => Ok(Self::Long),
            "short" | "sell" => Ok(Self::Short),
            other => Err(format!("invalid side '{}'; expected long|short", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liquidity {
    Maker,
    #[default]
    Taker,
}

impl Liquidity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Maker => "maker",
            Self::Taker => "taker",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryRequest {
    pub coin: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: Option<f64>,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub leverage: f64,
    pub liquidity: Liquidity,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloseRequest {
    pub coin: String,
    pub side: PositionSide,
    /// Amount to close. Binance and Backpack treat `None` like zero and
    /// return a successful "no position size to close" no-op; the Hyperliquid
    /// trader closes whatever it holds for the coin.
    pub size: Option<f64>,
    pub fallback_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TpslRequest {
    pub coin: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub new_sl: Option<f64>,
    pub new_tp: Option<f64>,
}

/// Normalised outcome of an entry attempt.
///
/// `success == false` always carries at least one error string.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryResult {
    pub success: bool,
    pub backend: ExchangeKind,
    pub errors: Vec<String>,
    pub entry_oid: Option<String>,
    pub tp_oid: Option<String>,
    pub sl_oid: Option<String>,
    pub raw: Value,
    pub extra: Map<String, Value>,
}

impl EntryResult {
    /// Resolve the final outcome. Any error makes the result a failure and a
    /// failure without errors gets `fallback`.
    pub fn resolve(
        backend: ExchangeKind,
        accepted: bool,
        errors: Vec<String>,
        fallback: &str,
        raw: Value,
    ) -> Self {
        let (success, errors) = settle(accepted, errors, fallback);
        Self {
            success,
            backend,
            errors,
            entry_oid: None,
            tp_oid: None,
            sl_oid: None,
            raw,
            extra: Map::new(),
        }
    }

    pub fn failed(backend: ExchangeKind, error: impl Into<String>) -> Self {
        Self::resolve(backend, false, vec![error.into()], "", Value::Null)
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloseResult {
    pub success: bool,
    pub backend: ExchangeKind,
    pub errors: Vec<String>,
    pub close_oid: Option<String>,
    pub raw: Value,
    pub extra: Map<String, Value>,
}

impl CloseResult {
    pub fn resolve(
        backend: ExchangeKind,
        accepted: bool,
        errors: Vec<String>,
        fallback: &str,
        raw: Value,
    ) -> Self {
        let (success, errors) = settle(accepted, errors, fallback);
        Self {
            success,
            backend,
            errors,
            close_oid: None,
            raw,
            extra: Map::new(),
        }
    }

    pub fn failed(backend: ExchangeKind, error: impl Into<String>) -> Self {
        Self::resolve(backend, false, vec![error.into()], "", Value::Null)
    }

    /// Successful no-op used when there is nothing left to close.
    pub fn nothing_to_close(backend: ExchangeKind) -> Self {
        Self::resolve(backend, true, Vec::new(), "", Value::Null)
            .with_extra("reason", "no position size to close")
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    pub fn reason(&self) -> Option<&str> {
        self.extra.get("reason").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TpslResult {
    pub success: bool,
    pub backend: ExchangeKind,
    pub errors: Vec<String>,
    pub sl_order_id: Option<String>,
    pub tp_order_id: Option<String>,
    pub raw: Value,
}

impl TpslResult {
    pub fn unsupported(backend: ExchangeKind) -> Self {
        Self {
            success: false,
            backend,
            errors: vec![format!(
                "Updating TP/SL is not supported for backend '{}'",
                backend
            )],
            sl_order_id: None,
            tp_order_id: None,
            raw: Value::Null,
        }
    }
}

fn settle(accepted: bool, errors: Vec<String>, fallback: &str) -> (bool, Vec<String>) {
    let mut errors = dedup_errors(errors);
    let success = accepted && errors.is_empty();
    if !success && errors.is_empty() {
        let msg = if fallback.is_empty() {
            "order was not accepted".to_string()
        } else {
            fallback.to_string()
        };
        errors.push(msg);
    }
    (success, errors)
}

/// Pull an order id out of a JSON value that may be a number or a string.
pub fn oid_from(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
