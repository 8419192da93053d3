//! Long-running services: symbol validation and the trading loop.

pub mod symbol_validation;
pub mod trading_loop;

pub use symbol_validation::{
    SymbolValidationService, ValidationErrorType, ValidationResult, DEFAULT_CACHE_TTL,
};
pub use trading_loop::{DecisionSource, IterationReport, JsonFileDecisionSource, TradingLoop};
