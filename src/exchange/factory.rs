use std::sync::Arc;
use tracing::info;

use crate::adapters::{
    BackpackFuturesClient, BinanceFuturesClient, HyperliquidClient, HyperliquidTrader,
    PaperExchangeClient,
};
use crate::config::{AppConfig, RuntimeOverrides};
use crate::error::{Result, TradebotError};

use super::{parse_exchange_kind, ExchangeClient, ExchangeKind};

/// Collaborators the factory cannot construct from configuration alone.
#[derive(Clone, Default)]
pub struct ExchangeDeps {
    /// Signed Hyperliquid session; required for live Hyperliquid trading.
    pub hyperliquid_trader: Option<Arc<dyn HyperliquidTrader>>,
}

/// Create the runtime exchange client from `AppConfig` and the runtime
/// `TRADING_BACKEND` override.
///
/// This is the only place that branches on backend identity.
pub fn build_exchange_client(
    app_config: &AppConfig,
    overrides: &RuntimeOverrides,
    deps: &ExchangeDeps,
) -> Result<Arc<dyn ExchangeClient>> {
    let exchange = parse_exchange_kind(&overrides.effective_trading_backend(app_config))
        .unwrap_or(ExchangeKind::Paper);

    build_exchange_client_for(exchange, app_config, deps)
}

/// Create exchange client for an explicit exchange kind.
pub fn build_exchange_client_for(
    exchange: ExchangeKind,
    app_config: &AppConfig,
    deps: &ExchangeDeps,
) -> Result<Arc<dyn ExchangeClient>> {
    if !app_config.execution.live && exchange != ExchangeKind::Paper {
        info!(
            "Live trading disabled; routing {} orders to the paper simulator",
            exchange
        );
        return Ok(Arc::new(PaperExchangeClient::new()));
    }

    match exchange {
        ExchangeKind::Paper => Ok(Arc::new(PaperExchangeClient::new())),
        ExchangeKind::BinanceFutures => {
            let client = BinanceFuturesClient::from_config(&app_config.binance, &app_config.http)?;
            info!("Binance futures live client initialised");
            Ok(Arc::new(client))
        }
        ExchangeKind::BackpackFutures => {
            let client =
                BackpackFuturesClient::from_config(&app_config.backpack, &app_config.http)?;
            info!("Backpack futures live client initialised");
            Ok(Arc::new(client))
        }
        ExchangeKind::Hyperliquid => {
            let trader = deps.hyperliquid_trader.clone().ok_or_else(|| {
                TradebotError::Validation(
                    "Hyperliquid live trading requires a signed trader session".to_string(),
                )
            })?;
            if !trader.is_live() {
                return Err(TradebotError::Validation(
                    "Hyperliquid trader is not in live mode; disable live trading or provide a live session"
                        .to_string(),
                ));
            }
            info!("Hyperliquid live client initialised");
            Ok(Arc::new(HyperliquidClient::new(trader)))
        }
    }
}
