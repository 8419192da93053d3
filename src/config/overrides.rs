//! In-memory runtime configuration overrides.
//!
//! Values set here win over the startup configuration for the rest of the
//! process lifetime and are never written back to disk.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

use super::{
    interval_seconds, parse_bool_flag, AppConfig, RiskControlConfig, VALID_INTERVALS,
    VALID_MARKET_DATA_BACKENDS, VALID_TRADING_BACKENDS,
};

pub const LLM_TEMPERATURE_MIN: f64 = 0.0;
pub const LLM_TEMPERATURE_MAX: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OverrideKey {
    TradingBackend,
    MarketDataBackend,
    Interval,
    LlmTemperature,
    LoopEnabled,
    DailyLossLimitEnabled,
    DailyLossLimitPct,
}

pub const OVERRIDE_WHITELIST: &[OverrideKey] = &[
    OverrideKey::TradingBackend,
    OverrideKey::MarketDataBackend,
    OverrideKey::Interval,
    OverrideKey::LlmTemperature,
    OverrideKey::LoopEnabled,
    OverrideKey::DailyLossLimitEnabled,
    OverrideKey::DailyLossLimitPct,
];

impl OverrideKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TradingBackend => "TRADING_BACKEND",
            Self::MarketDataBackend => "MARKET_DATA_BACKEND",
            Self::Interval => "TRADEBOT_INTERVAL",
            Self::LlmTemperature => "TRADEBOT_LLM_TEMPERATURE",
            Self::LoopEnabled => "TRADEBOT_LOOP_ENABLED",
            Self::DailyLossLimitEnabled => "DAILY_LOSS_LIMIT_ENABLED",
            Self::DailyLossLimitPct => "DAILY_LOSS_LIMIT_PCT",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::TradingBackend => "Trading execution backend",
            Self::MarketDataBackend => "Market data source",
            Self::Interval => "Trading loop interval",
            Self::LlmTemperature => "Decision model sampling temperature",
            Self::LoopEnabled => "Whether the trading loop runs",
            Self::DailyLossLimitEnabled => "Daily loss limit enabled",
            Self::DailyLossLimitPct => "Daily loss limit threshold (%)",
        }
    }

    /// Validate and normalise a raw value for this key.
    pub fn normalize(&self, raw: &str) -> Result<String, String> {
        let value = raw.trim();
        match self {
            Self::TradingBackend => {
                one_of(self.as_str(), value, VALID_TRADING_BACKENDS)
            }
            Self::MarketDataBackend => {
                one_of(self.as_str(), value, VALID_MARKET_DATA_BACKENDS)
            }
            Self::Interval => one_of(self.as_str(), value, VALID_INTERVALS),
            Self::LlmTemperature => {
                let v: f64 = value.parse().map_err(|_| {
                    format!("Invalid {} '{}'; must be a number", self.as_str(), raw)
                })?;
                if !(LLM_TEMPERATURE_MIN..=LLM_TEMPERATURE_MAX).contains(&v) {
                    return Err(format!(
                        "{} {} out of range [{}, {}]",
                        self.as_str(),
                        v,
                        LLM_TEMPERATURE_MIN,
                        LLM_TEMPERATURE_MAX
                    ));
                }
                Ok(v.to_string())
            }
            Self::LoopEnabled | Self::DailyLossLimitEnabled => parse_bool_flag(value)
                .map(|b| b.to_string())
                .ok_or_else(|| {
                    format!(
                        "Invalid {} '{}'; must be one of: true, false, 1, 0, yes, no, on, off",
                        self.as_str(),
                        raw
                    )
                }),
            Self::DailyLossLimitPct => {
                let v: f64 = value.parse().map_err(|_| {
                    format!("Invalid {} '{}'; must be a number", self.as_str(), raw)
                })?;
                if !(0.0..=100.0).contains(&v) {
                    return Err(format!("{} {} out of range [0, 100]", self.as_str(), v));
                }
                Ok(v.to_string())
            }
        }
    }
}

fn one_of(key: &str, value: &str, allowed: &[&str]) -> Result<String, String> {
    let normalized = value.to_ascii_lowercase();
    if allowed.contains(&normalized.as_str()) {
        Ok(normalized)
    } else {
        Err(format!(
            "Invalid {} '{}'; must be one of: {}",
            key,
            value,
            allowed.join(", ")
        ))
    }
}

impl fmt::Display for OverrideKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OverrideKey {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let upper = raw.trim().to_ascii_uppercase();
        OVERRIDE_WHITELIST
            .iter()
            .copied()
            .find(|k| k.as_str() == upper)
            .ok_or_else(|| {
                format!(
                    "Key '{}' is not in the override whitelist. Allowed: {}",
                    raw.trim(),
                    OVERRIDE_WHITELIST
                        .iter()
                        .map(|k| k.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            })
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    values: BTreeMap<OverrideKey, String>,
}

impl RuntimeOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store an override. Returns the previous value, if any.
    pub fn set(&mut self, key: OverrideKey, raw: &str) -> Result<Option<String>, String> {
        let value = key.normalize(raw).map_err(|e| {
            warn!("Validation failed for {}={:?}: {}", key, raw, e);
            e
        })?;
        let old = self.values.insert(key, value.clone());
        info!("Runtime override set: {} = {} (was: {:?})", key, value, old);
        Ok(old)
    }

    pub fn get(&self, key: OverrideKey) -> Option<&str> {
        self.values.get(&key).map(String::as_str)
    }

    pub fn clear(&mut self, key: OverrideKey) -> bool {
        match self.values.remove(&key) {
            Some(old) => {
                info!("Runtime override cleared: {} (was: {})", key, old);
                true
            }
            None => false,
        }
    }

    pub fn clear_all(&mut self) -> usize {
        let count = self.values.len();
        if count > 0 {
            info!("Clearing all {} runtime overrides", count);
            self.values.clear();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (OverrideKey, &str)> {
        self.values.iter().map(|(k, v)| (*k, v.as_str()))
    }

    // A stored value that no longer validates is skipped and the next tier is used.
    fn valid(&self, key: OverrideKey) -> Option<String> {
        let raw = self.values.get(&key)?;
        match key.normalize(raw) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Ignoring invalid {} override: {}", key, e);
                None
            }
        }
    }

    pub fn effective_trading_backend(&self, cfg: &AppConfig) -> String {
        self.valid(OverrideKey::TradingBackend)
            .or_else(|| {
                let configured = cfg.execution.trading_backend.to_ascii_lowercase();
                VALID_TRADING_BACKENDS
                    .contains(&configured.as_str())
                    .then_some(configured)
            })
            .unwrap_or_else(|| "paper".to_string())
    }

    pub fn effective_market_data_backend(&self, cfg: &AppConfig) -> String {
        self.valid(OverrideKey::MarketDataBackend)
            .or_else(|| {
                let configured = cfg.market_data.backend.to_ascii_lowercase();
                VALID_MARKET_DATA_BACKENDS
                    .contains(&configured.as_str())
                    .then_some(configured)
            })
            .unwrap_or_else(|| "binance".to_string())
    }

    pub fn effective_interval(&self, cfg: &AppConfig) -> String {
        self.valid(OverrideKey::Interval)
            .or_else(|| {
                interval_seconds(&cfg.execution.interval)
                    .map(|_| cfg.execution.interval.to_ascii_lowercase())
            })
            .unwrap_or_else(|| super::DEFAULT_INTERVAL.to_string())
    }

    pub fn effective_interval_secs(&self, cfg: &AppConfig) -> u64 {
        interval_seconds(&self.effective_interval(cfg)).unwrap_or(900)
    }

    pub fn effective_llm_temperature(&self, cfg: &AppConfig) -> f64 {
        self.valid(OverrideKey::LlmTemperature)
            .and_then(|v| v.parse().ok())
            .unwrap_or(cfg.execution.llm_temperature)
    }

    pub fn effective_loop_enabled(&self, cfg: &AppConfig) -> bool {
        self.valid(OverrideKey::LoopEnabled)
            .and_then(|v| parse_bool_flag(&v))
            .unwrap_or(cfg.execution.loop_enabled)
    }

    /// Startup risk configuration with the daily-loss overrides applied.
    pub fn effective_risk(&self, base: &RiskControlConfig) -> RiskControlConfig {
        let mut risk = base.clone();
        if let Some(enabled) = self
            .valid(OverrideKey::DailyLossLimitEnabled)
            .and_then(|v| parse_bool_flag(&v))
        {
            risk.daily_loss_limit_enabled = enabled;
        }
        if let Some(pct) = self
            .valid(OverrideKey::DailyLossLimitPct)
            .and_then(|v| v.parse().ok())
        {
            risk.daily_loss_limit_pct = pct;
        }
        risk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_parse_case_insensitively_and_reject_unknown() {
        assert_eq!(
            "trading_backend".parse::<OverrideKey>().expect("key should parse"),
            OverrideKey::TradingBackend
        );
        let err = "BINANCE_API_KEY"
            .parse::<OverrideKey>()
            .expect_err("secrets are not overridable");
        assert!(err.contains("not in the override whitelist"));
    }

    #[test]
    fn set_validates_and_normalises() {
        let mut overrides = RuntimeOverrides::new();
        assert_eq!(
            overrides.set(OverrideKey::TradingBackend, " Binance_Futures "),
            Ok(None)
        );
        assert_eq!(overrides.get(OverrideKey::TradingBackend), Some("binance_futures"));

        let err = overrides
            .set(OverrideKey::Interval, "7m")
            .expect_err("7m is not a supported interval");
        assert!(err.contains("TRADEBOT_INTERVAL"));

        assert!(overrides.set(OverrideKey::LlmTemperature, "2.5").is_err());
        assert!(overrides.set(OverrideKey::DailyLossLimitPct, "101").is_err());
        assert_eq!(overrides.len(), 1);
    }

    #[test]
    fn override_beats_config_which_beats_default() {
        let mut cfg = AppConfig::default();
        let mut overrides = RuntimeOverrides::new();

        assert_eq!(overrides.effective_interval(&cfg), "15m");
        cfg.execution.interval = "1h".to_string();
        assert_eq!(overrides.effective_interval(&cfg), "1h");
        overrides
            .set(OverrideKey::Interval, "5m")
            .expect("5m is valid");
        assert_eq!(overrides.effective_interval(&cfg), "5m");
        assert_eq!(overrides.effective_interval_secs(&cfg), 300);

        cfg.execution.interval = "bogus".to_string();
        overrides.clear(OverrideKey::Interval);
        assert_eq!(overrides.effective_interval(&cfg), "15m");
    }

    #[test]
    fn loop_enabled_and_risk_overrides_apply() {
        let cfg = AppConfig::default();
        let mut overrides = RuntimeOverrides::new();
        assert!(overrides.effective_loop_enabled(&cfg));

        overrides
            .set(OverrideKey::LoopEnabled, "off")
            .expect("off is a valid flag");
        overrides
            .set(OverrideKey::DailyLossLimitPct, "3")
            .expect("3 is in range");
        assert!(!overrides.effective_loop_enabled(&cfg));

        let risk = overrides.effective_risk(&cfg.risk);
        assert_eq!(risk.daily_loss_limit_pct, 3.0);
        assert!(risk.daily_loss_limit_enabled);

        assert_eq!(overrides.clear_all(), 2);
        assert!(overrides.is_empty());
    }
}
