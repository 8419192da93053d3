//! Fixed-interval trading loop.
//!
//! One task owns every piece of mutable state; remote commands are handled at
//! the start of each iteration rather than concurrently.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

use super::symbol_validation::SymbolValidationService;
use crate::adapters::{TelegramClient, TelegramDailyLossNotifier};
use crate::config::{AppConfig, RuntimeOverrides};
use crate::error::Result;
use crate::exchange::{build_exchange_client, ExchangeClient, ExchangeDeps};
use crate::execution::{
    CloseOutcome, Decision, DecisionSummary, EntryPermission, PlanLimits, Portfolio, TradeExecutor,
};
use crate::market::{build_market_data_client, coin_symbol, Candle, MarketDataClient};
use crate::persistence::{Journal, StateStore};
use crate::remote::{process_commands, CommandContext, CommandPoller};
use crate::risk::RiskGate;

/// Produces per-coin decisions for an iteration.
#[async_trait]
pub trait DecisionSource: Send + Sync {
    async fn decisions(
        &self,
        universe: &[String],
        portfolio: &Portfolio,
        candles: &HashMap<String, Candle>,
    ) -> Result<BTreeMap<String, Decision>>;
}

/// Reads `{coin: decision}` JSON written by an external decision process.
///
/// A file is consumed once: decisions are only returned again after the file
/// has been rewritten.
pub struct JsonFileDecisionSource {
    path: PathBuf,
    last_modified: Mutex<Option<SystemTime>>,
}

impl JsonFileDecisionSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_modified: Mutex::new(None),
        }
    }
}

#[async_trait]
impl DecisionSource for JsonFileDecisionSource {
    async fn decisions(
        &self,
        _universe: &[String],
        _portfolio: &Portfolio,
        _candles: &HashMap<String, Candle>,
    ) -> Result<BTreeMap<String, Decision>> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No decisions file at {}", self.path.display());
                return Ok(BTreeMap::new());
            }
            Err(e) => return Err(e.into()),
        };
        let modified = meta.modified().ok();
        if let Ok(mut last) = self.last_modified.lock() {
            if modified.is_some() && *last == modified {
                debug!("Decisions file unchanged since last iteration");
                return Ok(BTreeMap::new());
            }
            *last = modified;
        }

        let raw = tokio::fs::read_to_string(&self.path).await?;
        let value: Value = serde_json::from_str(&raw)?;
        Ok(Decision::map_from_value(&value))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationReport {
    pub commands: usize,
    pub loop_enabled: bool,
    pub allow_entry: bool,
    pub equity: Option<f64>,
    pub protective_exits: usize,
    pub decisions: DecisionSummary,
}

pub struct TradingLoop {
    config: AppConfig,
    overrides: RuntimeOverrides,
    gate: RiskGate,
    portfolio: Portfolio,
    universe: Vec<String>,
    executor: TradeExecutor,
    exchange_deps: ExchangeDeps,
    trading_backend: String,
    market: Arc<dyn MarketDataClient>,
    market_backend: String,
    decision_source: Arc<dyn DecisionSource>,
    store: StateStore,
    journal: Journal,
    poller: Option<CommandPoller>,
    symbols: SymbolValidationService,
    last_prices: HashMap<String, f64>,
}

impl TradingLoop {
    /// Load durable state and wire every collaborator from configuration.
    pub async fn bootstrap(config: AppConfig, exchange_deps: ExchangeDeps) -> Result<Self> {
        let now = Utc::now();
        let overrides = RuntimeOverrides::new();
        let journal = Journal::new(config.state.journal_dir());
        let store = StateStore::new(config.state.state_path(), config.execution.start_capital());
        let loaded = store.load().await;

        let mut gate = RiskGate::from_persisted(loaded.risk_control, config.risk.clone(), now)
            .with_journal(journal.clone());
        if let Some(notifier) = TelegramDailyLossNotifier::from_config(&config.telegram, &config.http) {
            gate = gate.with_notifier(notifier);
        }

        let client = build_exchange_client(&config, &overrides, &exchange_deps)?;
        let executor = TradeExecutor::new(
            client.clone(),
            PlanLimits::from_config(&config.execution, client.is_live()),
        )
        .with_kill_switch(Arc::new(gate.handle()))
        .with_risk_control(config.risk.enabled)
        .with_journal(journal.clone());

        let market = build_market_data_client(&config, &overrides)?;
        let poller = TelegramClient::from_config(&config.telegram, &config.http)
            .and_then(|client| CommandPoller::from_config(&config.telegram, client));
        if poller.is_none() {
            info!("Telegram remote control not configured");
        }

        let universe = config
            .execution
            .coins
            .iter()
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty())
            .collect();

        Ok(Self {
            trading_backend: overrides.effective_trading_backend(&config),
            market_backend: overrides.effective_market_data_backend(&config),
            decision_source: Arc::new(JsonFileDecisionSource::new(config.state.decisions_path())),
            symbols: SymbolValidationService::from_config(&config),
            portfolio: loaded.portfolio,
            last_prices: HashMap::new(),
            config,
            overrides,
            gate,
            universe,
            executor,
            exchange_deps,
            market,
            store,
            journal,
            poller,
        })
    }

    pub fn with_market_data(mut self, market: Arc<dyn MarketDataClient>) -> Self {
        self.market = market;
        self
    }

    pub fn with_decision_source(mut self, source: Arc<dyn DecisionSource>) -> Self {
        self.decision_source = source;
        self
    }

    pub fn with_exchange_client(mut self, client: Arc<dyn ExchangeClient>) -> Self {
        self.executor
            .set_limits(PlanLimits::from_config(&self.config.execution, client.is_live()));
        self.executor.set_client(client);
        self
    }

    pub fn without_remote_control(mut self) -> Self {
        self.poller = None;
        self
    }

    pub fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    pub fn gate(&self) -> &RiskGate {
        &self.gate
    }

    pub fn gate_mut(&mut self) -> &mut RiskGate {
        &mut self.gate
    }

    pub fn overrides_mut(&mut self) -> &mut RuntimeOverrides {
        &mut self.overrides
    }

    pub fn universe(&self) -> &[String] {
        &self.universe
    }

    /// Rebuild clients whose backend changed through a runtime override.
    /// A failed rebuild keeps the previous client.
    fn refresh_clients(&mut self) {
        let trading = self.overrides.effective_trading_backend(&self.config);
        if trading != self.trading_backend {
            match build_exchange_client(&self.config, &self.overrides, &self.exchange_deps) {
                Ok(client) => {
                    info!(
                        "Trading backend switched {} -> {}",
                        self.trading_backend, trading
                    );
                    self.executor
                        .set_limits(PlanLimits::from_config(&self.config.execution, client.is_live()));
                    self.executor.set_client(client);
                    self.trading_backend = trading;
                }
                Err(e) => error!("Cannot switch trading backend to {}: {}", trading, e),
            }
        }

        let market = self.overrides.effective_market_data_backend(&self.config);
        if market != self.market_backend {
            match build_market_data_client(&self.config, &self.overrides) {
                Ok(client) => {
                    info!("Market data backend switched {} -> {}", self.market_backend, market);
                    self.market = client;
                    self.market_backend = market;
                }
                Err(e) => error!("Cannot switch market data backend to {}: {}", market, e),
            }
        }
    }

    pub async fn run_iteration(&mut self, now: DateTime<Utc>) -> IterationReport {
        let mut report = IterationReport::default();

        if let Some(poller) = self.poller.as_mut() {
            let mut ctx = CommandContext {
                config: &self.config,
                gate: &mut self.gate,
                portfolio: &mut self.portfolio,
                executor: &self.executor,
                overrides: &mut self.overrides,
                universe: &mut self.universe,
                prices: &self.last_prices,
                symbols: Some(&self.symbols),
                journal: &self.journal,
                now,
            };
            report.commands = process_commands(poller, &mut ctx).await;
        }
        self.refresh_clients();

        report.loop_enabled = self.overrides.effective_loop_enabled(&self.config);
        if report.loop_enabled {
            if let Err(e) = self.trade(now, &mut report).await {
                error!("Trading iteration failed: {}", e);
            }
        } else {
            info!("Trading loop disabled (TRADEBOT_LOOP_ENABLED=false); skipping market processing");
        }

        self.portfolio.iteration += 1;
        self.persist(now).await;
        report
    }

    async fn fetch_candles(&self, coins: &[String]) -> HashMap<String, Candle> {
        let interval = self.overrides.effective_interval(&self.config);
        let mut candles = HashMap::new();
        for coin in coins {
            match self.market.get_klines(&coin_symbol(coin), &interval, 1).await {
                Ok(mut rows) => match rows.pop() {
                    Some(latest) => {
                        candles.insert(coin.clone(), latest);
                    }
                    None => warn!("{}: no candles returned", coin),
                },
                Err(e) => warn!("{}: market data unavailable: {}", coin, e),
            }
        }
        candles
    }

    async fn trade(&mut self, now: DateTime<Utc>, report: &mut IterationReport) -> Result<()> {
        let mut coins = self.universe.clone();
        for held in self.portfolio.positions.keys() {
            if !coins.contains(held) {
                coins.push(held.clone());
            }
        }

        let candles = self.fetch_candles(&coins).await;
        for (coin, candle) in &candles {
            self.last_prices.insert(coin.clone(), candle.close);
        }

        let priced = self
            .portfolio
            .positions
            .keys()
            .all(|coin| self.last_prices.contains_key(coin));
        report.equity = priced.then(|| self.portfolio.total_equity(&self.last_prices));
        if report.equity.is_none() {
            warn!("Equity unknown this iteration; daily loss check skipped");
        }

        report.allow_entry = self.gate.check_risk_limits(report.equity, now).await;
        let permission = EntryPermission::from_gate(&self.gate, report.allow_entry);

        let exits = self
            .executor
            .check_stop_loss_take_profit(&mut self.portfolio, &candles, now)
            .await;
        report.protective_exits = exits
            .iter()
            .filter(|(_, outcome)| matches!(outcome, CloseOutcome::Closed { .. }))
            .count();

        let decisions = self
            .decision_source
            .decisions(&self.universe, &self.portfolio, &candles)
            .await?;
        report.decisions = self
            .executor
            .process_decisions(
                &mut self.portfolio,
                &self.universe,
                &decisions,
                &candles,
                &permission,
                now,
            )
            .await;

        info!(
            "Iteration {}: equity={} allow_entry={} opened={} closed={} blocked={} exits={} balance=${:.2}",
            self.portfolio.iteration + 1,
            report
                .equity
                .map(|e| format!("${:.2}", e))
                .unwrap_or_else(|| "N/A".to_string()),
            report.allow_entry,
            report.decisions.opened,
            report.decisions.closed,
            report.decisions.blocked,
            report.protective_exits,
            self.portfolio.balance
        );
        Ok(())
    }

    async fn persist(&self, now: DateTime<Utc>) {
        if let Err(e) = self.store.save(&self.portfolio, self.gate.state(), now).await {
            error!("Failed to persist state: {}", e);
        }
    }

    /// Run until `shutdown` resolves; the interval is re-read every tick.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            "Trading loop started: backend={} market_data={} coins={:?}",
            self.trading_backend, self.market_backend, self.universe
        );
        loop {
            self.run_iteration(Utc::now()).await;
            let secs = self.overrides.effective_interval_secs(&self.config);
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested; saving state");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
            }
        }
        self.persist(Utc::now()).await;
    }
}
