use serde::Deserialize;
use tracing::warn;

use super::parse_bool_flag;

pub const DEFAULT_DAILY_LOSS_LIMIT_PCT: f64 = 5.0;

/// Risk subsystem inputs, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RiskControlConfig {
    /// Master switch for the whole risk subsystem
    pub enabled: bool,
    /// Boot-time kill-switch override; `None` keeps the persisted value
    pub kill_switch: Option<bool>,
    pub daily_loss_limit_enabled: bool,
    /// Percentage drawdown (0-100) that trips the kill switch
    pub daily_loss_limit_pct: f64,
}

impl Default for RiskControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kill_switch: None,
            daily_loss_limit_enabled: true,
            daily_loss_limit_pct: DEFAULT_DAILY_LOSS_LIMIT_PCT,
        }
    }
}

impl RiskControlConfig {
    pub fn from_env() -> Self {
        Self::default().overlay_env(|key| std::env::var(key).ok())
    }

    /// Apply `RISK_CONTROL_ENABLED`, `KILL_SWITCH`, `DAILY_LOSS_LIMIT_ENABLED`
    /// and `DAILY_LOSS_LIMIT_PCT` on top of `self`.
    pub fn overlay_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        self.enabled = bool_or(lookup("RISK_CONTROL_ENABLED"), self.enabled, "RISK_CONTROL_ENABLED");
        self.daily_loss_limit_enabled = bool_or(
            lookup("DAILY_LOSS_LIMIT_ENABLED"),
            self.daily_loss_limit_enabled,
            "DAILY_LOSS_LIMIT_ENABLED",
        );

        if let Some(raw) = lookup("KILL_SWITCH") {
            match parse_bool_flag(&raw) {
                Some(v) => self.kill_switch = Some(v),
                None => warn!(
                    "Invalid KILL_SWITCH value '{}'; ignoring and keeping persisted state",
                    raw
                ),
            }
        }

        if let Some(raw) = lookup("DAILY_LOSS_LIMIT_PCT") {
            self.daily_loss_limit_pct = parse_pct(&raw);
        }

        self
    }
}

fn bool_or(raw: Option<String>, default: bool, name: &str) -> bool {
    match raw {
        None => default,
        Some(raw) => parse_bool_flag(&raw).unwrap_or_else(|| {
            warn!("Invalid {} value '{}'; using {}", name, raw, default);
            default
        }),
    }
}

/// Parse a percentage in [0, 100], falling back to the default with a warning.
pub(crate) fn parse_pct(raw: &str) -> f64 {
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() && (0.0..=100.0).contains(&v) => v,
        Ok(v) => {
            warn!(
                "DAILY_LOSS_LIMIT_PCT {} out of range [0, 100]; using default {}",
                v, DEFAULT_DAILY_LOSS_LIMIT_PCT
            );
            DEFAULT_DAILY_LOSS_LIMIT_PCT
        }
        Err(_) => {
            warn!(
                "Invalid DAILY_LOSS_LIMIT_PCT '{}'; using default {}",
                raw, DEFAULT_DAILY_LOSS_LIMIT_PCT
            );
            DEFAULT_DAILY_LOSS_LIMIT_PCT
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(pairs: &[(&str, &str)]) -> RiskControlConfig {
        RiskControlConfig::default().overlay_env(|key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        })
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let cfg = resolve(&[]);
        assert!(cfg.enabled);
        assert_eq!(cfg.kill_switch, None);
        assert!(cfg.daily_loss_limit_enabled);
        assert_eq!(cfg.daily_loss_limit_pct, 5.0);
    }

    #[test]
    fn kill_switch_override_is_tri_state() {
        assert_eq!(resolve(&[("KILL_SWITCH", "true")]).kill_switch, Some(true));
        assert_eq!(resolve(&[("KILL_SWITCH", "off")]).kill_switch, Some(false));
        assert_eq!(resolve(&[("KILL_SWITCH", "banana")]).kill_switch, None);
    }

    #[test]
    fn invalid_booleans_fall_back_to_defaults() {
        let cfg = resolve(&[
            ("RISK_CONTROL_ENABLED", "perhaps"),
            ("DAILY_LOSS_LIMIT_ENABLED", "0"),
        ]);
        assert!(cfg.enabled);
        assert!(!cfg.daily_loss_limit_enabled);
    }

    #[test]
    fn loss_limit_pct_is_range_checked() {
        assert_eq!(resolve(&[("DAILY_LOSS_LIMIT_PCT", "8.5")]).daily_loss_limit_pct, 8.5);
        assert_eq!(resolve(&[("DAILY_LOSS_LIMIT_PCT", "0")]).daily_loss_limit_pct, 0.0);
        assert_eq!(resolve(&[("DAILY_LOSS_LIMIT_PCT", "150")]).daily_loss_limit_pct, 5.0);
        assert_eq!(resolve(&[("DAILY_LOSS_LIMIT_PCT", "-1")]).daily_loss_limit_pct, 5.0);
        assert_eq!(resolve(&[("DAILY_LOSS_LIMIT_PCT", "abc")]).daily_loss_limit_pct, 5.0);
    }
}
