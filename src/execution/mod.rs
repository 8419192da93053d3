//! Decision handling, position sizing and order execution.

mod decision;
mod executor;
pub mod planning;
mod portfolio;

pub use decision::{Decision, Signal};
pub use executor::{
    CloseOutcome, DecisionSummary, EntryOutcome, EntryPermission, TpslOutcome, TradeExecutor,
};
pub use planning::{compute_close_plan, compute_entry_plan, EntrySkip, PlanLimits};
pub use portfolio::{Portfolio, Position};
