//! Kill-switch and daily-loss-limit risk control.

mod gate;
mod notify;
mod state;

pub use gate::{KillSwitchHandle, KillSwitchSignal, RiskGate};
pub use notify::{DailyLossEvent, DailyLossNotifier};
pub use state::{DeactivateOutcome, RiskControlState};

pub const REASON_DAILY_LOSS_LIMIT: &str = "daily_loss_limit";
pub const REASON_ENV_OVERRIDE: &str = "env:KILL_SWITCH";
pub const REASON_RUNTIME_MANUAL: &str = "runtime:manual";
pub const REASON_RUNTIME_RESUME: &str = "runtime:resume";
pub const REASON_TELEGRAM_KILL: &str = "telegram:/kill";
pub const REASON_TELEGRAM_RESUME: &str = "telegram:/resume";
pub const REASON_TELEGRAM_RESET_DAILY: &str = "telegram:/reset_daily";
