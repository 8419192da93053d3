//! Account balance and open positions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::exchange::{ExchangeKind, Liquidity, PositionSide};

/// An open position as tracked locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Position {
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub profit_target: f64,
    pub stop_loss: f64,
    pub leverage: f64,
    pub confidence: f64,
    pub invalidation_condition: String,
    pub margin: f64,
    pub fees_paid: f64,
    pub fee_rate: f64,
    pub liquidity: Liquidity,
    pub risk_usd: f64,
    /// Backend that holds the live order, `None` for simulated fills
    pub live_backend: Option<ExchangeKind>,
    pub entry_oid: Option<String>,
    pub tp_oid: Option<String>,
    pub sl_oid: Option<String>,
    pub entry_justification: String,
    pub last_justification: String,
    pub opened_at: Option<DateTime<Utc>>,
}

impl Default for Position {
    fn default() -> Self {
        Self {
            side: PositionSide::Long,
            quantity: 0.0,
            entry_price: 0.0,
            profit_target: 0.0,
            stop_loss: 0.0,
            leverage: 1.0,
            confidence: 0.0,
            invalidation_condition: String::new(),
            margin: 0.0,
            fees_paid: 0.0,
            fee_rate: 0.0,
            liquidity: Liquidity::Taker,
            risk_usd: 0.0,
            live_backend: None,
            entry_oid: None,
            tp_oid: None,
            sl_oid: None,
            entry_justification: String::new(),
            last_justification: String::new(),
            opened_at: None,
        }
    }
}

impl Position {
    /// Gross PnL if the whole position were closed at `price`.
    pub fn pnl_at(&self, price: f64) -> f64 {
        match self.side {
            PositionSide::Long => (price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - price) * self.quantity,
        }
    }

    pub fn estimate_exit_fee(&self, price: f64) -> f64 {
        self.quantity * price * self.fee_rate
    }

    /// Stop-loss or take-profit level touched by a candle's range.
    ///
    /// The stop is checked first so a candle spanning both levels exits at
    /// the stop.
    pub fn protective_exit(&self, high: f64, low: f64) -> Option<(&'static str, f64)> {
        match self.side {
            PositionSide::Long => {
                if low <= self.stop_loss {
                    Some(("Stop loss hit", self.stop_loss))
                } else if high >= self.profit_target {
                    Some(("Take profit hit", self.profit_target))
                } else {
                    None
                }
            }
            PositionSide::Short => {
                if high >= self.stop_loss {
                    Some(("Stop loss hit", self.stop_loss))
                } else if low <= self.profit_target {
                    Some(("Take profit hit", self.profit_target))
                } else {
                    None
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Portfolio {
    pub balance: f64,
    pub positions: BTreeMap<String, Position>,
    pub iteration: u64,
}

impl Portfolio {
    pub fn new(balance: f64) -> Self {
        Self {
            balance,
            positions: BTreeMap::new(),
            iteration: 0,
        }
    }

    pub fn total_margin(&self) -> f64 {
        self.positions.values().map(|p| p.margin).sum()
    }

    /// Unrealised PnL across positions; coins without a price count as flat.
    pub fn unrealized_pnl(&self, prices: &HashMap<String, f64>) -> f64 {
        self.positions
            .iter()
            .filter_map(|(coin, pos)| prices.get(coin).map(|p| pos.pnl_at(*p)))
            .sum()
    }

    /// Balance plus margin and unrealised PnL of every open position.
    pub fn total_equity(&self, prices: &HashMap<String, f64>) -> f64 {
        self.balance + self.total_margin() + self.unrealized_pnl(prices)
    }
}
