//! Durable kill-switch and daily-loss state.
//!
//! All transitions live here as plain methods so they can be tested without
//! I/O; `RiskGate` layers logging, notification and journaling on top.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "serde_json::Value")]
pub struct RiskControlState {
    pub kill_switch_active: bool,
    pub kill_switch_reason: Option<String>,
    /// Most recent activation; kept across deactivation for audit.
    pub kill_switch_triggered_at: Option<DateTime<Utc>>,
    /// Always strictly positive when set.
    pub daily_start_equity: Option<f64>,
    pub daily_start_date: Option<NaiveDate>,
    /// Signed change vs. the daily baseline, in percent (negative = loss).
    pub daily_loss_pct: f64,
    pub daily_loss_triggered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeactivateOutcome {
    Deactivated,
    AlreadyInactive,
    /// The daily loss limit fired today and `force` was not set.
    BlockedByDailyLoss,
}

impl RiskControlState {
    /// Build a state from a possibly partial or older-schema JSON record.
    ///
    /// Missing or wrongly-typed fields fall back to their defaults; a
    /// non-object value yields the default state.
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::default();
        };

        let text = |key: &str| {
            obj.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
        };

        Self {
            kill_switch_active: obj
                .get("kill_switch_active")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            kill_switch_reason: text("kill_switch_reason").map(str::to_string),
            kill_switch_triggered_at: text("kill_switch_triggered_at").and_then(parse_timestamp),
            daily_start_equity: obj
                .get("daily_start_equity")
                .and_then(Value::as_f64)
                .filter(|v| v.is_finite() && *v > 0.0),
            daily_start_date: text("daily_start_date")
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()),
            daily_loss_pct: obj
                .get("daily_loss_pct")
                .and_then(Value::as_f64)
                .filter(|v| v.is_finite())
                .unwrap_or(0.0),
            daily_loss_triggered: obj
                .get("daily_loss_triggered")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }

    /// Returns true when an `Inactive -> Active` transition happened.
    ///
    /// Activating an already active switch only refreshes the reason.
    pub fn activate(&mut self, reason: &str, now: DateTime<Utc>) -> bool {
        self.kill_switch_reason = Some(reason.to_string());
        if self.kill_switch_active {
            return false;
        }
        self.kill_switch_active = true;
        self.kill_switch_triggered_at = Some(now);
        true
    }

    pub fn deactivate(&mut self, reason: &str, force: bool) -> DeactivateOutcome {
        if !self.kill_switch_active {
            return DeactivateOutcome::AlreadyInactive;
        }
        if self.daily_loss_triggered && !force {
            return DeactivateOutcome::BlockedByDailyLoss;
        }
        self.kill_switch_active = false;
        self.kill_switch_reason = Some(reason.to_string());
        DeactivateOutcome::Deactivated
    }

    /// Roll the baseline at the first evaluation of a new UTC day.
    ///
    /// Returns true when the baseline was reset. Non-positive equity never
    /// becomes a baseline.
    pub fn update_daily_baseline(&mut self, current_equity: f64, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if self.daily_start_date == Some(today) && self.daily_start_equity.is_some() {
            return false;
        }
        if !(current_equity.is_finite() && current_equity > 0.0) {
            return false;
        }
        self.daily_start_date = Some(today);
        self.daily_start_equity = Some(current_equity);
        self.daily_loss_pct = 0.0;
        self.daily_loss_triggered = false;
        true
    }

    pub fn calculate_daily_loss_pct(&self, current_equity: f64) -> f64 {
        match self.daily_start_equity {
            Some(start) if start > 0.0 => (current_equity - start) / start * 100.0,
            _ => 0.0,
        }
    }

    /// Refresh `daily_loss_pct` and fire the kill switch on the first breach
    /// of the day. Returns true only on the call that fired.
    pub fn evaluate_daily_loss(
        &mut self,
        current_equity: f64,
        limit_pct: f64,
        now: DateTime<Utc>,
    ) -> bool {
        let loss_pct = self.calculate_daily_loss_pct(current_equity);
        self.daily_loss_pct = loss_pct;

        if self.daily_start_equity.is_none() || self.daily_loss_triggered {
            return false;
        }
        if loss_pct > -limit_pct {
            return false;
        }

        self.activate(super::REASON_DAILY_LOSS_LIMIT, now);
        self.daily_loss_triggered = true;
        true
    }

    /// Operator re-snapshot of the baseline. Never touches the kill switch.
    pub fn reset_daily_baseline(&mut self, current_equity: f64, now: DateTime<Utc>) {
        self.daily_start_equity = (current_equity.is_finite() && current_equity > 0.0)
            .then_some(current_equity);
        self.daily_start_date = Some(now.date_naive());
        self.daily_loss_pct = 0.0;
        self.daily_loss_triggered = false;
    }
}

impl From<Value> for RiskControlState {
    fn from(value: Value) -> Self {
        Self::from_value(&value)
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    // Older records were written without an offset; they are UTC.
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn loss_pct_is_zero_at_baseline_for_any_positive_equity() {
        for equity in [0.01, 1.0, 537.25, 10_000.0, 1e9] {
            let state = RiskControlState {
                daily_start_equity: Some(equity),
                ..Default::default()
            };
            assert_eq!(state.calculate_daily_loss_pct(equity), 0.0);
        }
    }

    #[test]
    fn loss_pct_is_zero_without_baseline() {
        let state = RiskControlState::default();
        assert_eq!(state.calculate_daily_loss_pct(9_000.0), 0.0);
    }

    #[test]
    fn activate_is_idempotent_and_keeps_daily_fields() {
        let mut state = RiskControlState {
            daily_start_equity: Some(10_000.0),
            daily_loss_pct: -1.5,
            ..Default::default()
        };
        let t1 = at(2025, 1, 2, 3);
        let t2 = at(2025, 1, 2, 4);

        assert!(state.activate("runtime:manual", t1));
        let daily_before = (state.daily_start_equity, state.daily_loss_pct, state.daily_loss_triggered);
        assert!(!state.activate("telegram:/kill", t2));

        assert!(state.kill_switch_active);
        assert_eq!(state.kill_switch_triggered_at, Some(t1));
        assert_eq!(state.kill_switch_reason.as_deref(), Some("telegram:/kill"));
        assert_eq!(
            (state.daily_start_equity, state.daily_loss_pct, state.daily_loss_triggered),
            daily_before
        );
    }

    #[test]
    fn deactivate_is_blocked_after_daily_loss_unless_forced() {
        let mut state = RiskControlState::default();
        state.activate(crate::risk::REASON_DAILY_LOSS_LIMIT, at(2025, 1, 2, 3));
        state.daily_loss_triggered = true;
        let before = state.clone();

        assert_eq!(
            state.deactivate("telegram:/resume", false),
            DeactivateOutcome::BlockedByDailyLoss
        );
        assert_eq!(state, before);

        assert_eq!(
            state.deactivate("telegram:/resume", true),
            DeactivateOutcome::Deactivated
        );
        assert!(!state.kill_switch_active);
        assert!(state.daily_loss_triggered);
        assert_eq!(state.kill_switch_triggered_at, before.kill_switch_triggered_at);
    }

    #[test]
    fn deactivate_when_inactive_is_a_no_op() {
        let mut state = RiskControlState::default();
        assert_eq!(
            state.deactivate("runtime:resume", false),
            DeactivateOutcome::AlreadyInactive
        );
        assert_eq!(state, RiskControlState::default());
    }

    #[test]
    fn daily_loss_fires_once_per_day() {
        let now = at(2025, 3, 4, 10);
        let mut state = RiskControlState::default();
        assert!(state.update_daily_baseline(10_000.0, now));

        assert!(state.evaluate_daily_loss(9_400.0, 5.0, now));
        assert!((state.daily_loss_pct + 6.0).abs() < 1e-9);
        assert!(state.kill_switch_active);
        assert_eq!(state.kill_switch_reason.as_deref(), Some("daily_loss_limit"));

        assert!(!state.evaluate_daily_loss(9_300.0, 5.0, now));
        assert!(!state.evaluate_daily_loss(9_400.0, 5.0, now));
    }

    #[test]
    fn baseline_rolls_at_utc_midnight_and_clears_trigger() {
        let day1 = at(2025, 3, 4, 23);
        let day2 = at(2025, 3, 5, 0);
        let mut state = RiskControlState::default();
        state.update_daily_baseline(10_000.0, day1);
        state.evaluate_daily_loss(9_000.0, 5.0, day1);
        assert!(state.daily_loss_triggered);

        assert!(!state.update_daily_baseline(9_000.0, day1));
        assert!(state.update_daily_baseline(9_000.0, day2));
        assert_eq!(state.daily_start_equity, Some(9_000.0));
        assert_eq!(state.daily_start_date, Some(day2.date_naive()));
        assert!(!state.daily_loss_triggered);
        assert_eq!(state.daily_loss_pct, 0.0);
        // the switch itself stays on until an operator resumes
        assert!(state.kill_switch_active);
    }

    #[test]
    fn non_positive_equity_never_becomes_a_baseline() {
        let mut state = RiskControlState::default();
        assert!(!state.update_daily_baseline(0.0, at(2025, 1, 1, 0)));
        assert!(!state.update_daily_baseline(-5.0, at(2025, 1, 1, 0)));
        assert_eq!(state.daily_start_equity, None);
    }

    #[test]
    fn manual_reset_keeps_kill_switch_active() {
        let now = at(2025, 6, 1, 12);
        let mut state = RiskControlState::default();
        state.update_daily_baseline(10_000.0, now);
        state.evaluate_daily_loss(9_000.0, 5.0, now);

        state.reset_daily_baseline(9_000.0, now);
        assert!(state.kill_switch_active);
        assert!(!state.daily_loss_triggered);
        assert_eq!(state.daily_start_equity, Some(9_000.0));
        assert_eq!(state.daily_loss_pct, 0.0);
    }

    #[test]
    fn partial_records_fill_in_defaults() {
        let state = RiskControlState::from_value(&json!({
            "kill_switch_active": true,
            "daily_start_equity": -3.0,
            "daily_loss_pct": "oops",
            "future_field": 1
        }));
        assert!(state.kill_switch_active);
        assert_eq!(state.kill_switch_reason, None);
        assert_eq!(state.daily_start_equity, None);
        assert_eq!(state.daily_loss_pct, 0.0);
        assert!(!state.daily_loss_triggered);

        assert_eq!(
            RiskControlState::from_value(&json!("garbage")),
            RiskControlState::default()
        );
    }

    #[test]
    fn serialized_state_reads_back_equal() {
        let mut state = RiskControlState::default();
        state.activate("env:KILL_SWITCH", at(2025, 2, 3, 4));
        state.update_daily_baseline(1_234.5, at(2025, 2, 3, 4));
        state.daily_loss_pct = -2.25;

        let text = serde_json::to_string(&state).expect("state serializes");
        let back: RiskControlState = serde_json::from_str(&text).expect("state deserializes");
        assert_eq!(back, state);
    }

    #[test]
    fn offsetless_timestamps_are_read_as_utc() {
        let state = RiskControlState::from_value(&json!({
            "kill_switch_triggered_at": "2025-02-03T04:05:06.789"
        }));
        let ts = state.kill_switch_triggered_at.expect("timestamp parsed");
        assert_eq!(ts.to_rfc3339(), "2025-02-03T04:05:06.789+00:00");
    }
}
