mod overrides;
mod risk;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub use overrides::{
    OverrideKey, RuntimeOverrides, LLM_TEMPERATURE_MAX, LLM_TEMPERATURE_MIN, OVERRIDE_WHITELIST,
};
pub use risk::{RiskControlConfig, DEFAULT_DAILY_LOSS_LIMIT_PCT};

pub const VALID_TRADING_BACKENDS: &[&str] =
    &["paper", "hyperliquid", "binance_futures", "backpack_futures"];
pub const VALID_MARKET_DATA_BACKENDS: &[&str] = &["binance", "backpack"];
pub const VALID_INTERVALS: &[&str] = &[
    "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d",
];
pub const DEFAULT_INTERVAL: &str = "15m";

/// Parse an operator-facing boolean flag.
///
/// Accepts `1/true/yes/on` and `0/false/no/off` (case-insensitive); anything
/// else yields `None` so the caller can fall back to its default.
pub fn parse_bool_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Seconds per loop tick for a supported interval label.
pub fn interval_seconds(interval: &str) -> Option<u64> {
    let secs = match interval.trim().to_ascii_lowercase().as_str() {
        "1m" => 60,
        "3m" => 180,
        "5m" => 300,
        "15m" => 900,
        "30m" => 1_800,
        "1h" => 3_600,
        "2h" => 7_200,
        "4h" => 14_400,
        "6h" => 21_600,
        "8h" => 28_800,
        "12h" => 43_200,
        "1d" => 86_400,
        _ => return None,
    };
    Some(secs)
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub market_data: MarketDataConfig,
    #[serde(default)]
    pub binance: BinanceConfig,
    #[serde(default)]
    pub backpack: BackpackConfig,
    #[serde(default)]
    pub hyperliquid: HyperliquidConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub risk: RiskControlConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// paper | hyperliquid | binance_futures | backpack_futures
    pub trading_backend: String,
    /// Route orders to the real exchange instead of the paper simulator
    pub live: bool,
    /// Coin universe the decision source is consulted for
    pub coins: Vec<String>,
    /// Loop interval label (see `VALID_INTERVALS`)
    pub interval: String,
    pub paper_start_capital: f64,
    pub live_start_capital: f64,
    pub maker_fee_rate: f64,
    pub taker_fee_rate: f64,
    /// Caps applied to live entries only (0 disables the cap)
    pub live_max_leverage: f64,
    pub live_max_risk_usd: f64,
    pub live_max_margin_usd: f64,
    /// Run the trading part of each iteration
    pub loop_enabled: bool,
    /// Sampling temperature forwarded to the decision source
    pub llm_temperature: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            trading_backend: "paper".to_string(),
            live: false,
            coins: ["BTC", "ETH", "SOL", "BNB", "XRP", "DOGE"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            interval: DEFAULT_INTERVAL.to_string(),
            paper_start_capital: 10_000.0,
            live_start_capital: 500.0,
            maker_fee_rate: 0.0,
            taker_fee_rate: 0.000275,
            live_max_leverage: 10.0,
            live_max_risk_usd: 100.0,
            live_max_margin_usd: 0.0,
            loop_enabled: true,
            llm_temperature: 0.7,
        }
    }
}

impl ExecutionConfig {
    pub fn start_capital(&self) -> f64 {
        if self.live && self.trading_backend != "paper" {
            self.live_start_capital
        } else {
            self.paper_start_capital
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarketDataConfig {
    /// binance | backpack
    pub backend: String,
    pub binance_base_url: String,
    pub backpack_base_url: String,
    /// TTL for cached symbol validation results
    pub symbol_cache_ttl_secs: u64,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            backend: "binance".to_string(),
            binance_base_url: "https://fapi.binance.com".to_string(),
            backpack_base_url: "https://api.backpack.exchange".to_string(),
            symbol_cache_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BinanceConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub recv_window_ms: u64,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://fapi.binance.com".to_string(),
            api_key: None,
            api_secret: None,
            recv_window_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackpackConfig {
    pub base_url: String,
    pub api_public_key: Option<String>,
    /// Base64-encoded 32-byte ED25519 seed
    pub api_secret_seed: Option<String>,
    pub window_ms: u64,
}

impl Default for BackpackConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.backpack.exchange".to_string(),
            api_public_key: None,
            api_secret_seed: None,
            window_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HyperliquidConfig {
    pub wallet_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    /// The single chat allowed to issue commands
    pub chat_id: Option<String>,
    /// Telegram user id allowed to change runtime configuration
    pub admin_user_id: Option<i64>,
    pub api_base_url: String,
    pub poll_timeout_secs: u64,
    pub poll_limit: u32,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            chat_id: None,
            admin_user_id: None,
            api_base_url: "https://api.telegram.org".to_string(),
            poll_timeout_secs: 5,
            poll_limit: 10,
        }
    }
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        filled(&self.bot_token) && filled(&self.chat_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
        }
    }
}

impl StateConfig {
    pub fn state_path(&self) -> PathBuf {
        self.dir.join("portfolio_state.json")
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.dir.join("journal")
    }

    pub fn decisions_path(&self) -> PathBuf {
        self.dir.join("decisions.json")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rolling log files (disabled when unset)
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            directory: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("TRADEBOT_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (TRADEBOT_EXECUTION__LIVE, etc.)
            .add_source(
                Environment::with_prefix("TRADEBOT")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut cfg: Self = builder.build()?.try_deserialize()?;
        cfg.apply_operator_env(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    /// Overlay the plain operator-facing variable names (`TRADING_BACKEND`,
    /// `KILL_SWITCH`, `BINANCE_API_KEY`, ...) on top of the layered config.
    pub fn apply_operator_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("TRADING_BACKEND") {
            self.execution.trading_backend = v.trim().to_ascii_lowercase();
        }
        if let Some(v) = non_empty("MARKET_DATA_BACKEND") {
            self.market_data.backend = v.trim().to_ascii_lowercase();
        }
        if let Some(v) = non_empty("TRADEBOT_INTERVAL") {
            self.execution.interval = v.trim().to_ascii_lowercase();
        }
        if let Some(enabled) = non_empty("TRADEBOT_LOOP_ENABLED").and_then(|v| parse_bool_flag(&v)) {
            self.execution.loop_enabled = enabled;
        }
        if let Some(t) = non_empty("TRADEBOT_LLM_TEMPERATURE").and_then(|v| v.trim().parse().ok()) {
            self.execution.llm_temperature = t;
        }
        if let Some(live) = non_empty("LIVE_TRADING_ENABLED").and_then(|v| parse_bool_flag(&v)) {
            self.execution.live = live;
        }

        let fill = |slot: &mut Option<String>, keys: &[&str]| {
            if slot.is_none() {
                *slot = keys.iter().find_map(|k| non_empty(k));
            }
        };
        fill(&mut self.binance.api_key, &["BINANCE_API_KEY", "BN_API_KEY"]);
        fill(&mut self.binance.api_secret, &["BINANCE_API_SECRET", "BN_SECRET"]);
        fill(&mut self.backpack.api_public_key, &["BACKPACK_API_PUBLIC_KEY"]);
        fill(&mut self.backpack.api_secret_seed, &["BACKPACK_API_SECRET_SEED"]);
        fill(
            &mut self.hyperliquid.wallet_address,
            &["HYPERLIQUID_WALLET_ADDRESS"],
        );
        fill(&mut self.telegram.bot_token, &["TELEGRAM_BOT_TOKEN"]);
        fill(&mut self.telegram.chat_id, &["TELEGRAM_CHAT_ID"]);
        if self.telegram.admin_user_id.is_none() {
            self.telegram.admin_user_id =
                non_empty("TELEGRAM_ADMIN_USER_ID").and_then(|v| v.trim().parse().ok());
        }

        self.risk = self.risk.clone().overlay_env(&lookup);
    }

    pub fn is_live_backend(&self) -> bool {
        self.execution.live && self.execution.trading_backend != "paper"
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let backend = self.execution.trading_backend.as_str();
        if !VALID_TRADING_BACKENDS.contains(&backend) {
            errors.push(format!(
                "execution.trading_backend '{}' must be one of: {}",
                backend,
                VALID_TRADING_BACKENDS.join(", ")
            ));
        }

        if !VALID_MARKET_DATA_BACKENDS.contains(&self.market_data.backend.as_str()) {
            errors.push(format!(
                "market_data.backend '{}' must be one of: {}",
                self.market_data.backend,
                VALID_MARKET_DATA_BACKENDS.join(", ")
            ));
        }

        if interval_seconds(&self.execution.interval).is_none() {
            errors.push(format!(
                "execution.interval '{}' must be one of: {}",
                self.execution.interval,
                VALID_INTERVALS.join(", ")
            ));
        }

        if self.execution.coins.is_empty() {
            errors.push("execution.coins must not be empty".to_string());
        }

        if self.execution.start_capital() <= 0.0 {
            errors.push("start capital must be positive".to_string());
        }

        if self.execution.maker_fee_rate < 0.0 || self.execution.taker_fee_rate < 0.0 {
            errors.push("fee rates must not be negative".to_string());
        }

        for (name, raw) in [
            ("binance.base_url", &self.binance.base_url),
            ("backpack.base_url", &self.backpack.base_url),
            ("market_data.binance_base_url", &self.market_data.binance_base_url),
            ("market_data.backpack_base_url", &self.market_data.backpack_base_url),
            ("telegram.api_base_url", &self.telegram.api_base_url),
        ] {
            if let Err(e) = url::Url::parse(raw) {
                errors.push(format!("{} '{}' is not a valid URL: {}", name, raw, e));
            }
        }

        if self.execution.live {
            match backend {
                "binance_futures" => {
                    if self.binance.api_key.is_none() || self.binance.api_secret.is_none() {
                        errors.push(
                            "binance_futures live trading requires BINANCE_API_KEY and BINANCE_API_SECRET"
                                .to_string(),
                        );
                    }
                }
                "backpack_futures" => {
                    if self.backpack.api_public_key.is_none()
                        || self.backpack.api_secret_seed.is_none()
                    {
                        errors.push(
                            "backpack_futures live trading requires BACKPACK_API_PUBLIC_KEY and BACKPACK_API_SECRET_SEED"
                                .to_string(),
                        );
                    }
                }
                _ => {}
            }
        }

        if self.telegram.bot_token.is_some() && self.telegram.chat_id.is_none() {
            errors.push("telegram.chat_id is required when a bot token is configured".to_string());
        }

        if !(0.0..=100.0).contains(&self.risk.daily_loss_limit_pct) {
            errors.push("risk.daily_loss_limit_pct must be within [0, 100]".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn parse_bool_flag_accepts_common_spellings() {
        for raw in ["1", "true", "YES", " on "] {
            assert_eq!(parse_bool_flag(raw), Some(true), "{raw}");
        }
        for raw in ["0", "False", "no", "OFF"] {
            assert_eq!(parse_bool_flag(raw), Some(false), "{raw}");
        }
        assert_eq!(parse_bool_flag("maybe"), None);
        assert_eq!(parse_bool_flag(""), None);
    }

    #[test]
    fn interval_table_covers_every_supported_label() {
        for label in VALID_INTERVALS {
            assert!(interval_seconds(label).is_some(), "{label}");
        }
        assert_eq!(interval_seconds("15m"), Some(900));
        assert_eq!(interval_seconds("2m"), None);
    }

    #[test]
    fn defaults_are_valid_paper_config() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.execution.trading_backend, "paper");
        assert!(!cfg.is_live_backend());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn operator_env_overlays_backend_and_credentials() {
        let mut cfg = AppConfig::default();
        cfg.apply_operator_env(lookup(&[
            ("TRADING_BACKEND", "Binance_Futures"),
            ("LIVE_TRADING_ENABLED", "yes"),
            ("BINANCE_API_KEY", "k"),
            ("BINANCE_API_SECRET", "s"),
            ("TELEGRAM_ADMIN_USER_ID", "42"),
        ]));

        assert_eq!(cfg.execution.trading_backend, "binance_futures");
        assert!(cfg.is_live_backend());
        assert_eq!(cfg.binance.api_key.as_deref(), Some("k"));
        assert_eq!(cfg.telegram.admin_user_id, Some(42));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_collects_every_problem() {
        let mut cfg = AppConfig::default();
        cfg.execution.trading_backend = "ftx".to_string();
        cfg.execution.interval = "7m".to_string();
        cfg.market_data.backend = "kraken".to_string();

        let errors = cfg.validate().expect_err("config should be invalid");
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn live_backpack_without_keys_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.execution.trading_backend = "backpack_futures".to_string();
        cfg.execution.live = true;

        let errors = cfg.validate().expect_err("missing keys should fail");
        assert!(errors.iter().any(|e| e.contains("BACKPACK_API_PUBLIC_KEY")));
    }
}
