//! Durable portfolio + risk-control state document.
//!
//! The document is replaced atomically (temp file + rename) so a reader never
//! sees a partial write. Loading never fails: anything unreadable falls back
//! to defaults and is logged.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::error::{Result, TradebotError};
use crate::execution::{Portfolio, Position};
use crate::risk::RiskControlState;

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedState {
    pub portfolio: Portfolio,
    pub risk_control: RiskControlState,
}

#[derive(Serialize)]
struct StateDocument<'a> {
    balance: f64,
    positions: &'a BTreeMap<String, Position>,
    iteration: u64,
    updated_at: DateTime<Utc>,
    risk_control: &'a RiskControlState,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    start_capital: f64,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, start_capital: f64) -> Self {
        Self {
            path: path.into(),
            start_capital,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn defaults(&self) -> LoadedState {
        LoadedState {
            portfolio: Portfolio::new(self.start_capital),
            risk_control: RiskControlState::default(),
        }
    }

    pub async fn load(&self) -> LoadedState {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "No saved state at {}, starting with ${:.2}",
                    self.path.display(),
                    self.start_capital
                );
                return self.defaults();
            }
            Err(e) => {
                error!("Failed to read state file {}: {}", self.path.display(), e);
                return self.defaults();
            }
        };

        match serde_json::from_str::<Value>(&raw) {
            Ok(value) if value.is_object() => self.from_document(&value),
            Ok(_) => {
                error!(
                    "State file {} is not a JSON object; using defaults",
                    self.path.display()
                );
                self.defaults()
            }
            Err(e) => {
                error!(
                    "State file {} is corrupt ({}); using defaults",
                    self.path.display(),
                    e
                );
                self.defaults()
            }
        }
    }

    fn from_document(&self, doc: &Value) -> LoadedState {
        let balance = doc
            .get("balance")
            .and_then(Value::as_f64)
            .filter(|b| b.is_finite())
            .unwrap_or(self.start_capital);
        let iteration = doc.get("iteration").and_then(Value::as_u64).unwrap_or(0);

        let mut positions = BTreeMap::new();
        if let Some(entries) = doc.get("positions").and_then(Value::as_object) {
            for (coin, raw) in entries {
                match serde_json::from_value::<Position>(raw.clone()) {
                    Ok(pos) if pos.quantity > 0.0 => {
                        positions.insert(coin.to_uppercase(), pos);
                    }
                    Ok(_) => warn!("Dropping saved position {} with zero quantity", coin),
                    Err(e) => warn!("Dropping unreadable saved position {}: {}", coin, e),
                }
            }
        }

        let risk_control = doc
            .get("risk_control")
            .map(RiskControlState::from_value)
            .unwrap_or_default();

        info!(
            "Loaded state: balance=${:.2} positions={} iteration={} kill_switch_active={}",
            balance,
            positions.len(),
            iteration,
            risk_control.kill_switch_active
        );
        LoadedState {
            portfolio: Portfolio {
                balance,
                positions,
                iteration,
            },
            risk_control,
        }
    }

    pub async fn save(
        &self,
        portfolio: &Portfolio,
        risk_control: &RiskControlState,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(parent) = self.path.parent() else {
            return Err(TradebotError::Persistence("invalid state path".to_string()));
        };
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let doc = StateDocument {
            balance: portfolio.balance,
            positions: &portfolio.positions,
            iteration: portfolio.iteration,
            updated_at: now,
            risk_control,
        };
        let body = serde_json::to_string_pretty(&doc)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("State saved to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PositionSide;

    fn temp_path(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "tradebot_state_{}_{}",
            tag,
            Utc::now().timestamp_nanos_opt().unwrap_or(0)
        ));
        p.push("portfolio_state.json");
        p
    }

    #[tokio::test]
    async fn missing_file_yields_start_capital() {
        let store = StateStore::new(temp_path("missing"), 500.0);
        let loaded = store.load().await;
        assert_eq!(loaded.portfolio.balance, 500.0);
        assert!(loaded.portfolio.positions.is_empty());
        assert_eq!(loaded.risk_control, RiskControlState::default());
    }

    #[tokio::test]
    async fn save_then_load_keeps_positions_and_risk_state() {
        let path = temp_path("roundtrip");
        let store = StateStore::new(&path, 10_000.0);
        let now = Utc::now();

        let mut portfolio = Portfolio::new(9_000.0);
        portfolio.iteration = 7;
        portfolio.positions.insert(
            "BTC".to_string(),
            Position {
                side: PositionSide::Short,
                quantity: 0.5,
                entry_price: 60_000.0,
                margin: 3_000.0,
                ..Default::default()
            },
        );
        let mut risk = RiskControlState::default();
        risk.activate("telegram:/kill", now);

        store.save(&portfolio, &risk, now).await.expect("save should succeed");
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = store.load().await;
        assert_eq!(loaded.portfolio.balance, 9_000.0);
        assert_eq!(loaded.portfolio.iteration, 7);
        let pos = loaded.portfolio.positions.get("BTC").expect("position restored");
        assert_eq!(pos.side, PositionSide::Short);
        assert!(loaded.risk_control.kill_switch_active);
        assert_eq!(
            loaded.risk_control.kill_switch_reason.as_deref(),
            Some("telegram:/kill")
        );

        if let Some(dir) = path.parent() {
            let _ = tokio::fs::remove_dir_all(dir).await;
        }
    }

    #[tokio::test]
    async fn corrupt_file_falls_back_to_defaults() {
        let path = temp_path("corrupt");
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.expect("create dir");
        }
        tokio::fs::write(&path, "{not json").await.expect("write");

        let loaded = StateStore::new(&path, 1_000.0).load().await;
        assert_eq!(loaded.portfolio.balance, 1_000.0);
        assert!(!loaded.risk_control.kill_switch_active);

        if let Some(dir) = path.parent() {
            let _ = tokio::fs::remove_dir_all(dir).await;
        }
    }

    #[tokio::test]
    async fn partial_risk_record_uses_field_defaults() {
        let path = temp_path("partial");
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.expect("create dir");
        }
        let doc = serde_json::json!({
            "balance": 1234.5,
            "positions": { "eth": { "side": "long", "quantity": 2.0, "entry_price": 3000.0 },
                           "bad": "oops" },
            "risk_control": { "kill_switch_active": true, "daily_start_equity": -5.0, "daily_loss_pct": "x" },
            "extra": 1
        });
        tokio::fs::write(&path, doc.to_string()).await.expect("write");

        let loaded = StateStore::new(&path, 1_000.0).load().await;
        assert_eq!(loaded.portfolio.balance, 1234.5);
        assert_eq!(loaded.portfolio.positions.len(), 1);
        assert!(loaded.portfolio.positions.contains_key("ETH"));
        assert!(loaded.risk_control.kill_switch_active);
        assert_eq!(loaded.risk_control.daily_start_equity, None);
        assert_eq!(loaded.risk_control.daily_loss_pct, 0.0);

        if let Some(dir) = path.parent() {
            let _ = tokio::fs::remove_dir_all(dir).await;
        }
    }
}
