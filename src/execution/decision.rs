//! Per-coin trading decisions produced by the decision source.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::exchange::{Liquidity, PositionSide};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Entry,
    Close,
    #[default]
    Hold,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Close => "close",
            Self::Hold => "hold",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "entry" => Self::Entry,
            "close" => Self::Close,
            _ => Self::Hold,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decision for one coin.
///
/// Numeric fields stay optional; planning decides the defaults so a single
/// malformed field does not discard the whole decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Decision {
    pub signal: Signal,
    pub side: PositionSide,
    pub leverage: Option<f64>,
    pub risk_usd: Option<f64>,
    pub stop_loss: Option<f64>,
    pub profit_target: Option<f64>,
    pub confidence: f64,
    pub justification: String,
    pub invalidation_condition: String,
    pub liquidity: Liquidity,
    pub fee_rate: Option<f64>,
}

fn number(value: Option<&Value>) -> Option<f64> {
    let parsed = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

impl Decision {
    /// Lenient conversion from a decision object; unknown signals become `hold`.
    pub fn from_value(value: &Value) -> Self {
        let field = |key: &str| value.get(key);
        Self {
            signal: field("signal")
                .and_then(Value::as_str)
                .map(Signal::parse)
                .unwrap_or_default(),
            side: field("side")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            leverage: number(field("leverage")),
            risk_usd: number(field("risk_usd")),
            stop_loss: number(field("stop_loss")),
            profit_target: number(field("profit_target")),
            confidence: number(field("confidence")).unwrap_or(0.0),
            justification: text(field("justification")),
            invalidation_condition: text(field("invalidation_condition")),
            liquidity: match field("liquidity").and_then(Value::as_str) {
                Some(l) if l.trim().eq_ignore_ascii_case("maker") => Liquidity::Maker,
                _ => Liquidity::Taker,
            },
            fee_rate: number(field("fee_rate")),
        }
    }

    /// A close decision carrying only a reason, as used by SL/TP exits and
    /// remote commands.
    pub fn close_with_reason(reason: &str) -> Self {
        Self {
            signal: Signal::Close,
            justification: reason.to_string(),
            ..Default::default()
        }
    }

    /// Decisions keyed by upper-case coin from `{"BTC": {...}, ...}`.
    pub fn map_from_value(value: &Value) -> BTreeMap<String, Decision> {
        value
            .as_object()
            .map(|obj| {
                obj.iter()
                    .filter(|(_, v)| v.is_object())
                    .map(|(coin, v)| (coin.trim().to_ascii_uppercase(), Self::from_value(v)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl<'de> Deserialize<'de> for Decision {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Value::deserialize(deserializer).map(|v| Self::from_value(&v))
    }
}
