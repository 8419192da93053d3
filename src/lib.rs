pub mod adapters;
pub mod cli;
pub mod config;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod market;
pub mod persistence;
pub mod remote;
pub mod risk;
pub mod services;

pub use config::AppConfig;
pub use error::{Result, TradebotError};
pub use exchange::{build_exchange_client, ExchangeClient, ExchangeDeps, ExchangeKind};
pub use execution::{Decision, Portfolio, Position, Signal, TradeExecutor};
pub use persistence::{Journal, StateStore};
pub use risk::{RiskControlState, RiskGate};
pub use services::{SymbolValidationService, TradingLoop};
