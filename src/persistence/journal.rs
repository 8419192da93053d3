//! Append-only JSONL audit trail.
//!
//! One file per stream under the journal directory. Writes are best effort:
//! a failing journal is logged and never interrupts trading.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalStream {
    Decisions,
    Trades,
    RiskEvents,
    Commands,
}

impl JournalStream {
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Decisions => "decisions.jsonl",
            Self::Trades => "trades.jsonl",
            Self::RiskEvents => "risk_events.jsonl",
            Self::Commands => "commands.jsonl",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub coin: String,
    pub signal: String,
    pub reasoning: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub coin: String,
    /// ENTRY | CLOSE
    pub action: String,
    pub side: String,
    pub quantity: f64,
    pub price: f64,
    pub pnl: f64,
    pub reason: String,
    pub backend: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEventRecord {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Always `SYSTEM` for risk-control events
    pub coin: String,
    pub action: String,
    pub reason: String,
    #[serde(default)]
    pub details: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub command: String,
    pub args: Vec<String>,
    pub chat_id: String,
    pub user_id: Option<i64>,
    pub action: String,
    pub success: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Journal {
    dir: Option<PathBuf>,
}

impl Journal {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    /// A journal that drops every record.
    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn record_decision(&self, coin: &str, signal: &str, reasoning: &str, confidence: f64) {
        self.append(
            JournalStream::Decisions,
            &DecisionRecord {
                event_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                coin: coin.to_string(),
                signal: signal.to_string(),
                reasoning: reasoning.to_string(),
                confidence,
            },
        );
    }

    pub fn record_trade(&self, record: TradeRecord) {
        self.append(JournalStream::Trades, &record);
    }

    pub fn record_risk_event(&self, action: &str, reason: &str, details: Value) {
        self.append(
            JournalStream::RiskEvents,
            &RiskEventRecord {
                event_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                coin: "SYSTEM".to_string(),
                action: action.to_string(),
                reason: reason.to_string(),
                details,
            },
        );
    }

    pub fn record_command(&self, record: CommandRecord) {
        self.append(JournalStream::Commands, &record);
    }

    /// Read back every record of a stream; unreadable lines are skipped.
    pub fn read_all<T: for<'de> Deserialize<'de>>(&self, stream: JournalStream) -> Vec<T> {
        let Some(dir) = &self.dir else {
            return Vec::new();
        };
        let Ok(text) = std::fs::read_to_string(dir.join(stream.file_name())) else {
            return Vec::new();
        };
        text.lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    fn append<T: Serialize>(&self, stream: JournalStream, record: &T) {
        let Some(dir) = &self.dir else {
            return;
        };
        if let Err(e) = Self::append_line(dir, stream, record) {
            warn!("Failed to append to {} journal: {}", stream.file_name(), e);
        }
    }

    fn append_line<T: Serialize>(
        dir: &Path,
        stream: JournalStream,
        record: &T,
    ) -> crate::error::Result<()> {
        std::fs::create_dir_all(dir)?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(stream.file_name()))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_journal(tag: &str) -> Journal {
        let mut dir = std::env::temp_dir();
        dir.push(format!(
            "tradebot_journal_{}_{}",
            tag,
            Utc::now().timestamp_nanos_opt().unwrap_or(0)
        ));
        Journal::new(dir)
    }

    #[test]
    fn records_are_appended_per_stream() {
        let journal = temp_journal("streams");
        journal.record_decision("BTC", "entry", "breakout", 0.7);
        journal.record_decision("ETH", "hold", "", 0.2);
        journal.record_risk_event("DAILY_LOSS_LIMIT_TRIGGERED", "daily_loss_limit", json!({"loss_pct": -6.0}));

        let decisions: Vec<DecisionRecord> = journal.read_all(JournalStream::Decisions);
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].coin, "BTC");

        let risk: Vec<RiskEventRecord> = journal.read_all(JournalStream::RiskEvents);
        assert_eq!(risk.len(), 1);
        assert_eq!(risk[0].coin, "SYSTEM");
        assert_eq!(risk[0].details["loss_pct"], json!(-6.0));

        if let Some(dir) = journal.dir() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn disabled_journal_is_silent() {
        let journal = Journal::disabled();
        journal.record_decision("BTC", "entry", "x", 0.1);
        let decisions: Vec<DecisionRecord> = journal.read_all(JournalStream::Decisions);
        assert!(decisions.is_empty());
    }
}
