use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::notify::{DailyLossEvent, DailyLossNotifier};
use super::state::{DeactivateOutcome, RiskControlState};
use super::{REASON_DAILY_LOSS_LIMIT, REASON_ENV_OVERRIDE};
use crate::config::RiskControlConfig;
use crate::persistence::Journal;

/// Read-only view of the kill switch for the order path.
pub trait KillSwitchSignal: Send + Sync {
    fn is_kill_switch_active(&self) -> bool;
}

/// Cheap shared flag mirrored by every `RiskGate` transition.
#[derive(Debug, Clone, Default)]
pub struct KillSwitchHandle {
    active: Arc<AtomicBool>,
}

impl KillSwitchHandle {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    fn set(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }
}

impl KillSwitchSignal for KillSwitchHandle {
    fn is_kill_switch_active(&self) -> bool {
        self.is_active()
    }
}

/// Sole owner of the process-wide `RiskControlState`.
///
/// Mutated only from the trading loop; remote commands reach it through the
/// loop, never from another task.
pub struct RiskGate {
    state: RiskControlState,
    config: RiskControlConfig,
    handle: KillSwitchHandle,
    notifier: Option<Arc<dyn DailyLossNotifier>>,
    journal: Journal,
}

impl RiskGate {
    /// Build the gate from persisted state and apply the boot-time
    /// `KILL_SWITCH` override, which wins over the persisted value.
    pub fn from_persisted(
        state: RiskControlState,
        config: RiskControlConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let mut gate = Self {
            state,
            config,
            handle: KillSwitchHandle::default(),
            notifier: None,
            journal: Journal::disabled(),
        };
        gate.apply_kill_switch_override(gate.config.kill_switch, now);
        gate.sync_handle();
        gate
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn DailyLossNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    pub fn state(&self) -> &RiskControlState {
        &self.state
    }

    pub fn config(&self) -> &RiskControlConfig {
        &self.config
    }

    /// Swap in a config carrying runtime overrides. The boot override is
    /// not re-applied.
    pub fn set_config(&mut self, config: RiskControlConfig) {
        self.config = config;
    }

    pub fn handle(&self) -> KillSwitchHandle {
        self.handle.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_kill_switch_active(&self) -> bool {
        self.state.kill_switch_active
    }

    /// Entries are allowed when risk control is off or the switch is inactive.
    pub fn allow_entry(&self) -> bool {
        !self.config.enabled || !self.state.kill_switch_active
    }

    pub fn apply_kill_switch_override(&mut self, value: Option<bool>, now: DateTime<Utc>) {
        match value {
            Some(true) => {
                // a fresh activation timestamp even if the durable state was already active
                self.state.kill_switch_active = false;
                self.state.activate(REASON_ENV_OVERRIDE, now);
                info!("Kill-Switch forced ON at startup by KILL_SWITCH override");
            }
            Some(false) => {
                if self.state.kill_switch_active {
                    info!(
                        "Kill-Switch forced OFF at startup by KILL_SWITCH override (was: {:?})",
                        self.state.kill_switch_reason
                    );
                }
                self.state.deactivate(REASON_ENV_OVERRIDE, true);
            }
            None => {}
        }
        self.sync_handle();
    }

    pub fn activate_kill_switch(&mut self, reason: &str, now: DateTime<Utc>) -> bool {
        let transitioned = self.state.activate(reason, now);
        self.sync_handle();
        if transitioned {
            warn!("Kill-Switch activated: reason={}", reason);
            self.journal
                .record_risk_event("KILL_SWITCH_ACTIVATED", reason, json!({}));
        } else {
            info!("Kill-Switch already active; reason refreshed to {}", reason);
        }
        transitioned
    }

    pub fn deactivate_kill_switch(&mut self, reason: &str, force: bool) -> DeactivateOutcome {
        let outcome = self.state.deactivate(reason, force);
        self.sync_handle();
        match outcome {
            DeactivateOutcome::Deactivated => {
                info!("Kill-Switch deactivated: reason={} force={}", reason, force);
                self.journal.record_risk_event(
                    "KILL_SWITCH_DEACTIVATED",
                    reason,
                    json!({ "force": force }),
                );
            }
            DeactivateOutcome::BlockedByDailyLoss => {
                warn!(
                    "Kill-Switch deactivation refused: daily loss limit triggered (reason={})",
                    reason
                );
            }
            DeactivateOutcome::AlreadyInactive => {}
        }
        outcome
    }

    pub fn update_daily_baseline(&mut self, current_equity: f64, now: DateTime<Utc>) -> bool {
        let reset = self.state.update_daily_baseline(current_equity, now);
        if reset {
            info!(
                "Daily baseline reset: date={} start_equity={:.2}",
                now.date_naive(),
                current_equity
            );
        }
        reset
    }

    pub fn reset_daily_baseline(&mut self, current_equity: f64, reason: &str, now: DateTime<Utc>) {
        let previous = self.state.clone();
        self.state.reset_daily_baseline(current_equity, now);
        info!(
            "Daily baseline manually reset to {:.2} (previous {:?}, loss {:.2}%)",
            current_equity, previous.daily_start_equity, previous.daily_loss_pct
        );
        self.journal.record_risk_event(
            "DAILY_BASELINE_RESET",
            reason,
            json!({
                "old_daily_start_equity": previous.daily_start_equity,
                "old_daily_loss_pct": previous.daily_loss_pct,
                "old_daily_loss_triggered": previous.daily_loss_triggered,
                "new_daily_start_equity": current_equity,
                "kill_switch_active": self.state.kill_switch_active,
            }),
        );
    }

    /// Evaluate the daily loss threshold; returns true only on the call that
    /// fires the kill switch.
    pub async fn check_daily_loss_limit(&mut self, current_equity: f64, now: DateTime<Utc>) -> bool {
        if !self.config.enabled || !self.config.daily_loss_limit_enabled {
            if self.state.daily_start_equity.is_some() {
                self.state.daily_loss_pct = self.state.calculate_daily_loss_pct(current_equity);
            }
            return false;
        }

        let limit_pct = self.config.daily_loss_limit_pct;
        let fired = self.state.evaluate_daily_loss(current_equity, limit_pct, now);
        self.sync_handle();
        if !fired {
            return false;
        }

        let event = DailyLossEvent {
            loss_pct: self.state.daily_loss_pct,
            limit_pct,
            start_equity: self.state.daily_start_equity.unwrap_or_default(),
            current_equity,
        };
        error!(
            "Daily loss limit triggered: loss {:.2}% <= -{:.2}% (start {:.2}, current {:.2}); Kill-Switch activated",
            event.loss_pct, event.limit_pct, event.start_equity, event.current_equity
        );
        self.journal.record_risk_event(
            "DAILY_LOSS_LIMIT_TRIGGERED",
            REASON_DAILY_LOSS_LIMIT,
            json!({
                "loss_pct": event.loss_pct,
                "limit_pct": event.limit_pct,
                "daily_start_equity": event.start_equity,
                "current_equity": event.current_equity,
            }),
        );

        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.notify_daily_loss(&event).await {
                error!("Failed to send daily loss limit notification: {}", e);
            }
        }
        true
    }

    /// Per-iteration risk evaluation. Returns whether new entries are allowed.
    pub async fn check_risk_limits(&mut self, current_equity: Option<f64>, now: DateTime<Utc>) -> bool {
        if !self.config.enabled {
            info!("Risk control disabled; skipping risk checks");
            return true;
        }

        if let Some(equity) = current_equity {
            self.update_daily_baseline(equity, now);
            self.check_daily_loss_limit(equity, now).await;
        }

        if self.state.kill_switch_active {
            warn!(
                "Kill-Switch active ({}): new entries are blocked",
                self.state.kill_switch_reason.as_deref().unwrap_or("unknown")
            );
            return false;
        }
        true
    }

    fn sync_handle(&self) {
        self.handle.set(self.state.kill_switch_active);
    }
}
