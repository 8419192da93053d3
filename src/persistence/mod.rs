//! Durable state and the JSONL audit journal.

mod journal;
mod state_store;

pub use journal::{
    CommandRecord, DecisionRecord, Journal, JournalStream, RiskEventRecord, TradeRecord,
};
pub use state_store::{LoadedState, StateStore};
