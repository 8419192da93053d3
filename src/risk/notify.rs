use async_trait::async_trait;

use crate::error::Result;

/// Payload delivered once when the daily loss limit trips.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DailyLossEvent {
    pub loss_pct: f64,
    pub limit_pct: f64,
    pub start_equity: f64,
    pub current_equity: f64,
}

impl DailyLossEvent {
    pub fn plain_text(&self) -> String {
        format!(
            "Daily loss limit triggered: {:.2}% (limit -{:.2}%). Start equity ${:.2}, current equity ${:.2}. \
             Kill-Switch is active; new entries are blocked until /resume.",
            self.loss_pct, self.limit_pct, self.start_equity, self.current_equity
        )
    }
}

#[async_trait]
pub trait DailyLossNotifier: Send + Sync {
    async fn notify_daily_loss(&self, event: &DailyLossEvent) -> Result<()>;
}
