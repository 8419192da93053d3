use clap::Parser;
use chrono::Utc;
use std::process::ExitCode;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tradebot::cli::{Cli, Commands};
use tradebot::config::{AppConfig, LoggingConfig};
use tradebot::exchange::ExchangeDeps;
use tradebot::execution::Portfolio;
use tradebot::persistence::StateStore;
use tradebot::risk::{DeactivateOutcome, RiskGate, REASON_RUNTIME_MANUAL, REASON_RUNTIME_RESUME};
use tradebot::services::{SymbolValidationService, TradingLoop};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let cfg = match AppConfig::load_from(&cli.config_dir) {
        Ok(cfg) => cfg,
        Err(e) => {
            init_logging_simple();
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_logging(&cfg.logging);
            run(cfg).await
        }
        Commands::Status => {
            init_logging_simple();
            show_status(&cfg).await
        }
        Commands::Kill => {
            init_logging_simple();
            kill(&cfg).await
        }
        Commands::Resume { force } => {
            init_logging_simple();
            resume(&cfg, force).await
        }
        Commands::ResetDaily { equity } => {
            init_logging_simple();
            reset_daily(&cfg, equity).await
        }
        Commands::ValidateSymbol { symbol, backend } => {
            init_logging_simple();
            validate_symbol(&cfg, &symbol, backend.as_deref()).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: AppConfig) -> anyhow::Result<()> {
    if let Err(problems) = cfg.validate() {
        for problem in &problems {
            error!("Invalid configuration: {}", problem);
        }
        anyhow::bail!("configuration has {} problem(s)", problems.len());
    }

    info!(
        "Starting tradebot: backend={} live={} coins={:?} interval={}",
        cfg.execution.trading_backend, cfg.execution.live, cfg.execution.coins, cfg.execution.interval
    );
    if !cfg.risk.enabled {
        warn!("RISK_CONTROL_ENABLED=false: kill switch and daily loss limit are bypassed");
    }

    let mut trading = TradingLoop::bootstrap(cfg, ExchangeDeps::default()).await?;
    trading.run(shutdown_signal()).await;
    info!("tradebot stopped");
    Ok(())
}

fn state_store(cfg: &AppConfig) -> StateStore {
    StateStore::new(cfg.state.state_path(), cfg.execution.start_capital())
}

async fn show_status(cfg: &AppConfig) -> anyhow::Result<()> {
    let loaded = state_store(cfg).load().await;
    let risk = &loaded.risk_control;
    println!("State file:        {}", cfg.state.state_path().display());
    println!("Balance:           ${:.2}", loaded.portfolio.balance);
    println!("Margin in use:     ${:.2}", loaded.portfolio.total_margin());
    println!("Iteration:         {}", loaded.portfolio.iteration);
    println!(
        "Kill-Switch:       {} ({})",
        if risk.kill_switch_active { "ACTIVE" } else { "inactive" },
        risk.kill_switch_reason.as_deref().unwrap_or("none")
    );
    println!(
        "Daily baseline:    {} on {}",
        risk.daily_start_equity
            .map(|e| format!("${:.2}", e))
            .unwrap_or_else(|| "N/A".to_string()),
        risk.daily_start_date
            .map(|d| d.to_string())
            .unwrap_or_else(|| "N/A".to_string())
    );
    println!(
        "Daily loss:        {:.2}% (triggered: {})",
        risk.daily_loss_pct, risk.daily_loss_triggered
    );
    println!("Open positions:    {}", loaded.portfolio.positions.len());
    for (coin, pos) in &loaded.portfolio.positions {
        println!(
            "  {:<6} {:<5} qty={:.6} entry={:.4} SL={:.4} TP={:.4} margin=${:.2}",
            coin,
            pos.side.as_str(),
            pos.quantity,
            pos.entry_price,
            pos.stop_loss,
            pos.profit_target,
            pos.margin
        );
    }
    Ok(())
}

async fn load_gate(cfg: &AppConfig) -> (StateStore, Portfolio, RiskGate) {
    let store = state_store(cfg);
    let loaded = store.load().await;
    let gate = RiskGate::from_persisted(loaded.risk_control, cfg.risk.clone(), Utc::now());
    (store, loaded.portfolio, gate)
}

async fn kill(cfg: &AppConfig) -> anyhow::Result<()> {
    let (store, portfolio, mut gate) = load_gate(cfg).await;
    if gate.activate_kill_switch(REASON_RUNTIME_MANUAL, Utc::now()) {
        println!("Kill-Switch activated");
    } else {
        println!("Kill-Switch was already active");
    }
    store.save(&portfolio, gate.state(), Utc::now()).await?;
    Ok(())
}

async fn resume(cfg: &AppConfig, force: bool) -> anyhow::Result<()> {
    let (store, portfolio, mut gate) = load_gate(cfg).await;
    match gate.deactivate_kill_switch(REASON_RUNTIME_RESUME, force) {
        DeactivateOutcome::Deactivated => println!("Kill-Switch deactivated"),
        DeactivateOutcome::AlreadyInactive => println!("Kill-Switch is not active"),
        DeactivateOutcome::BlockedByDailyLoss => {
            anyhow::bail!(
                "daily loss limit triggered today ({:.2}%); rerun with --force or reset-daily first",
                gate.state().daily_loss_pct
            );
        }
    }
    store.save(&portfolio, gate.state(), Utc::now()).await?;
    Ok(())
}

async fn reset_daily(cfg: &AppConfig, equity: Option<f64>) -> anyhow::Result<()> {
    let (store, portfolio, mut gate) = load_gate(cfg).await;
    if !gate.is_enabled() {
        anyhow::bail!("risk control is disabled (RISK_CONTROL_ENABLED=false)");
    }
    let equity = equity.unwrap_or_else(|| portfolio.balance + portfolio.total_margin());
    if !(equity.is_finite() && equity > 0.0) {
        anyhow::bail!("equity must be a positive number, got {}", equity);
    }
    gate.reset_daily_baseline(equity, REASON_RUNTIME_MANUAL, Utc::now());
    store.save(&portfolio, gate.state(), Utc::now()).await?;
    println!("Daily baseline reset to ${:.2}", equity);
    if gate.is_kill_switch_active() {
        println!("Kill-Switch is still active; run `tradebot resume` to allow entries");
    }
    Ok(())
}

async fn validate_symbol(cfg: &AppConfig, symbol: &str, backend: Option<&str>) -> anyhow::Result<()> {
    let backend = backend.unwrap_or(&cfg.market_data.backend);
    let service = SymbolValidationService::from_config(cfg);
    let result = service.validate(symbol, backend).await;
    if result.is_valid {
        println!("{} is tradable on {}", symbol.to_uppercase(), result.backend);
        Ok(())
    } else {
        anyhow::bail!("{:?}: {}", result.error_type, result.message)
    }
}

fn init_logging(cfg: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tradebot=debug", cfg.level)));

    // `rolling::daily` panics if it cannot create the file, so check writability first.
    let file_layer = cfg.directory.as_ref().and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "Warning: Could not create log directory {} ({}), file logging disabled",
                dir.display(),
                e
            );
            return None;
        }
        let marker = dir.join(".tradebot_write_test");
        match std::fs::OpenOptions::new().create(true).append(true).open(&marker) {
            Ok(_) => {
                let _ = std::fs::remove_file(&marker);
                let appender = tracing_appender::rolling::daily(dir, "tradebot.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                // lives for the whole process
                Box::leak(Box::new(guard));
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    dir.display(),
                    e
                );
                None
            }
        }
    });

    let console_layer = if cfg.json {
        tracing_subscriber::fmt::layer().json().with_target(true).boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();
}

fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
