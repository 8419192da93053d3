use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tradebot")]
#[command(version = "0.1.0")]
#[command(about = "Risk-gated perpetual futures execution bot", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Directory holding default.toml and {TRADEBOT_ENV}.toml
    #[arg(short, long, default_value = "config", env = "TRADEBOT_CONFIG_DIR")]
    pub config_dir: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the trading loop (default)
    Run,
    /// Print the persisted portfolio and risk-control state
    Status,
    /// Activate the Kill-Switch in the state file (bot should be stopped)
    Kill,
    /// Deactivate the Kill-Switch in the state file (bot should be stopped)
    Resume {
        /// Override the daily-loss protection
        #[arg(long)]
        force: bool,
    },
    /// Reset the daily loss baseline (bot should be stopped)
    ResetDaily {
        /// New baseline; defaults to balance plus margin in use
        #[arg(long)]
        equity: Option<f64>,
    },
    /// Check that a symbol is tradable on a market-data backend
    ValidateSymbol {
        /// Binance-style symbol, e.g. BTCUSDT
        symbol: String,
        /// binance | backpack; defaults to the configured backend
        #[arg(short, long)]
        backend: Option<String>,
    },
}
