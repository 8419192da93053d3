use thiserror::Error;

/// Main error type for the trading bot
#[derive(Error, Debug)]
pub enum TradebotError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Market data errors
    #[error("Market data unavailable: {0}")]
    MarketDataUnavailable(String),

    // Exchange errors
    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    // Risk management errors
    #[error("Risk control error: {0}")]
    RiskControl(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // Crypto/signing errors
    #[error("Signature error: {0}")]
    Signature(String),

    // Authentication errors
    #[error("Authentication error: {0}")]
    Auth(String),

    // State persistence errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    // Remote control transport errors
    #[error("Remote control error: {0}")]
    RemoteControl(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl TradebotError {
    /// True for transport-level failures that should be retried on the next tick.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::RateLimited(_) | Self::MarketDataUnavailable(_) => true,
            _ => false,
        }
    }
}

/// Result type alias for TradebotError
pub type Result<T> = std::result::Result<T, TradebotError>;
