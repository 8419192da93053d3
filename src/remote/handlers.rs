//! Operator command handlers.
//!
//! Handlers run inside the trading loop and mutate risk state, positions and
//! runtime overrides directly; the loop persists the result at the end of the
//! iteration. Replies are MarkdownV2.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::command::TelegramCommand;
use super::poller::CommandPoller;
use crate::adapters::{escape_markdown, PARSE_MODE_MARKDOWN_V2};
use crate::config::{AppConfig, OverrideKey, RuntimeOverrides, OVERRIDE_WHITELIST};
use crate::error::{Result, TradebotError};
use crate::execution::{CloseOutcome, Portfolio, TpslOutcome, TradeExecutor};
use crate::market::coin_symbol;
use crate::persistence::{CommandRecord, Journal};
use crate::risk::{
    DeactivateOutcome, RiskGate, REASON_TELEGRAM_KILL, REASON_TELEGRAM_RESET_DAILY,
    REASON_TELEGRAM_RESUME,
};
use crate::services::SymbolValidationService;

pub const GENERIC_FAILURE_MESSAGE: &str = "Command failed, please retry later.";

#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
    pub state_changed: bool,
    pub action: Option<&'static str>,
}

impl CommandResult {
    fn ok(message: String, action: &'static str) -> Self {
        Self {
            success: true,
            message,
            state_changed: false,
            action: Some(action),
        }
    }

    fn changed(message: String, action: &'static str) -> Self {
        Self {
            success: true,
            message,
            state_changed: true,
            action: Some(action),
        }
    }

    fn failed(message: String, action: &'static str) -> Self {
        Self {
            success: false,
            message,
            state_changed: false,
            action: Some(action),
        }
    }

    fn info(message: String) -> Self {
        Self {
            success: true,
            message,
            state_changed: false,
            action: None,
        }
    }
}

/// Everything a command may read or change during one loop iteration.
pub struct CommandContext<'a> {
    pub config: &'a AppConfig,
    pub gate: &'a mut RiskGate,
    pub portfolio: &'a mut Portfolio,
    pub executor: &'a TradeExecutor,
    pub overrides: &'a mut RuntimeOverrides,
    pub universe: &'a mut Vec<String>,
    /// Latest close per coin.
    pub prices: &'a HashMap<String, f64>,
    pub symbols: Option<&'a SymbolValidationService>,
    pub journal: &'a Journal,
    pub now: DateTime<Utc>,
}

impl CommandContext<'_> {
    /// Total equity, `None` when a held coin has no price.
    fn equity(&self) -> Option<f64> {
        let priced = self
            .portfolio
            .positions
            .keys()
            .all(|coin| self.prices.contains_key(coin));
        priced.then(|| self.portfolio.total_equity(self.prices))
    }
}

fn esc(text: &str) -> String {
    escape_markdown(text)
}

fn usd(value: f64) -> String {
    format!("${:.2}", value)
}

/// `btc`, `BTCUSDT`, `BTC_USDC_PERP` -> `BTC`.
pub fn normalize_symbol(symbol: &str) -> String {
    let mut upper = symbol.trim().to_ascii_uppercase();
    for suffix in ["_USDC_PERP", "_USDT_PERP", "USDT", "USDC", "USD"] {
        if let Some(base) = upper.strip_suffix(suffix) {
            upper = base.to_string();
            break;
        }
    }
    match upper.split_once('_') {
        Some((base, _)) => base.to_string(),
        None => upper,
    }
}

/// Dispatch one command, journal it and return the reply.
pub async fn handle_command(cmd: &TelegramCommand, ctx: &mut CommandContext<'_>) -> CommandResult {
    info!(
        "Telegram /{} command received: chat_id={} user_id={:?} args={:?}",
        cmd.command, cmd.chat_id, cmd.user_id, cmd.args
    );
    let result = match dispatch(cmd, ctx).await {
        Ok(result) => result,
        Err(e) => {
            error!("Telegram /{} failed: {}", cmd.command, e);
            CommandResult::failed(esc(GENERIC_FAILURE_MESSAGE), "COMMAND_ERROR")
        }
    };

    ctx.journal.record_command(CommandRecord {
        event_id: Uuid::new_v4(),
        timestamp: ctx.now,
        command: cmd.command.clone(),
        args: cmd.args.clone(),
        chat_id: cmd.chat_id.clone(),
        user_id: cmd.user_id,
        action: result.action.unwrap_or("NONE").to_string(),
        success: result.success,
    });
    result
}

async fn dispatch(cmd: &TelegramCommand, ctx: &mut CommandContext<'_>) -> Result<CommandResult> {
    Ok(match cmd.command.as_str() {
        "kill" => handle_kill(ctx),
        "resume" => handle_resume(cmd, ctx),
        "status" => handle_status(ctx),
        "risk" => handle_risk(ctx),
        "reset_daily" => handle_reset_daily(ctx),
        "positions" => handle_positions(ctx),
        "close" => handle_close(cmd, ctx).await,
        "tpsl" => handle_tpsl(cmd, ctx).await,
        "config" => handle_config(cmd, ctx),
        "symbols" => handle_symbols(cmd, ctx).await?,
        "help" | "start" => CommandResult::ok(help_text(), "HELP_DISPLAYED"),
        other => CommandResult::failed(
            format!("❓ *Unknown command:* `/{}`\n\n{}", other, help_text()),
            "UNKNOWN_COMMAND",
        ),
    })
}

/// Poll once, handle every command and reply to the operator chat.
pub async fn process_commands(
    poller: &mut CommandPoller,
    ctx: &mut CommandContext<'_>,
) -> usize {
    let commands = poller.poll().await;
    for cmd in &commands {
        let result = handle_command(cmd, ctx).await;
        if let Err(e) = poller
            .client()
            .send_message(&cmd.chat_id, &result.message, Some(PARSE_MODE_MARKDOWN_V2))
            .await
        {
            warn!("Failed to send reply for /{}: {}", cmd.command, e);
        }
    }
    commands.len()
}

fn help_text() -> String {
    [
        "🤖 *Available commands*",
        "",
        "`/kill` \\- activate the Kill\\-Switch \\(block new entries\\)",
        "`/resume [force]` \\- deactivate the Kill\\-Switch",
        "`/status` \\- balance, equity and trading state",
        "`/risk` \\- risk control state",
        "`/reset_daily` \\- reset the daily loss baseline to current equity",
        "`/positions` \\- open positions",
        "`/close SYMBOL [PCT|all]` \\- close a position fully or partially",
        "`/tpsl SYMBOL SL TP` \\- move stop loss / take profit \\(`-` keeps a level\\)",
        "`/config list|get KEY|set KEY VALUE` \\- runtime overrides",
        "`/symbols list|add SYMBOL|remove SYMBOL` \\- trading universe",
        "`/help` \\- this message",
    ]
    .join("\n")
}

fn handle_kill(ctx: &mut CommandContext<'_>) -> CommandResult {
    let positions = ctx.portfolio.positions.len();
    if ctx.gate.is_kill_switch_active() {
        let state = ctx.gate.state();
        return CommandResult::info(format!(
            "⚠️ *Kill\\-Switch already active*\n\n*Reason:* {}\n*Since:* `{}`\n\nNo action needed\\.",
            esc(state.kill_switch_reason.as_deref().unwrap_or("unknown")),
            state
                .kill_switch_triggered_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string()),
        ));
    }

    ctx.gate.activate_kill_switch(REASON_TELEGRAM_KILL, ctx.now);
    warn!(
        "Telegram /kill: Kill-Switch activated | positions_count={}",
        positions
    );
    CommandResult::changed(
        format!(
            "🚨 *Kill\\-Switch activated*\n\n*Reason:* {}\n*Triggered at:* `{}`\n*Open positions:* {}\n\n\
             New entries are blocked; stop\\-loss and take\\-profit keep running\\.\n\n\
             Send `/resume` to resume trading\\.",
            esc(REASON_TELEGRAM_KILL),
            ctx.now.to_rfc3339(),
            positions
        ),
        "KILL_SWITCH_ACTIVATED",
    )
}

fn handle_resume(cmd: &TelegramCommand, ctx: &mut CommandContext<'_>) -> CommandResult {
    let force = cmd.args.iter().any(|a| a.eq_ignore_ascii_case("force"));
    match ctx.gate.deactivate_kill_switch(REASON_TELEGRAM_RESUME, force) {
        DeactivateOutcome::AlreadyInactive => CommandResult::info(
            "ℹ️ *Kill\\-Switch is not active*\n\nTrading is running normally\\.".to_string(),
        ),
        DeactivateOutcome::BlockedByDailyLoss => CommandResult::failed(
            format!(
                "❌ *Cannot resume*\n\n*Reason:* the daily loss limit is still in effect\n\
                 *Daily loss:* `{:.2}%`\n\n\
                 Send `/reset_daily` to start a new risk window, or `/resume force` to override\\.",
                ctx.gate.state().daily_loss_pct
            ),
            "RESUME_BLOCKED_DAILY_LOSS",
        ),
        DeactivateOutcome::Deactivated => CommandResult::changed(
            format!(
                "✅ *Kill\\-Switch deactivated*\n\n*At:* `{}`\n*Reason:* {}{}\n\nNew entry signals will be processed again\\.",
                ctx.now.to_rfc3339(),
                esc(REASON_TELEGRAM_RESUME),
                if force { " \\(forced\\)" } else { "" }
            ),
            "KILL_SWITCH_DEACTIVATED",
        ),
    }
}

fn handle_status(ctx: &mut CommandContext<'_>) -> CommandResult {
    let loop_enabled = ctx.overrides.effective_loop_enabled(ctx.config);
    let trading_status = if ctx.gate.is_kill_switch_active() {
        "⛔ Paused \\(Kill\\-Switch\\)"
    } else if !loop_enabled {
        "⏸ Loop disabled"
    } else {
        "✅ Running"
    };

    let start_capital = ctx.config.execution.start_capital();
    let equity_line = match ctx.equity() {
        Some(equity) => {
            let ret = if start_capital > 0.0 {
                (equity - start_capital) / start_capital * 100.0
            } else {
                0.0
            };
            format!("`{} ({:+.2}%)`", usd(equity), ret)
        }
        None => "`N/A`".to_string(),
    };

    CommandResult::ok(
        format!(
            "📊 *Bot status*\n\n*Trading:* {}\n*Backend:* `{}`\n*Balance:* `{}`\n*Margin in use:* `{}`\n\
             *Total equity:* {}\n*Unrealized PnL:* `{:+.2}`\n*Open positions:* {}\n*Iteration:* {}",
            trading_status,
            ctx.executor.client().kind(),
            usd(ctx.portfolio.balance),
            usd(ctx.portfolio.total_margin()),
            equity_line,
            ctx.portfolio.unrealized_pnl(ctx.prices),
            ctx.portfolio.positions.len(),
            ctx.portfolio.iteration,
        ),
        "BOT_STATUS",
    )
}

fn handle_risk(ctx: &mut CommandContext<'_>) -> CommandResult {
    let state = ctx.gate.state();
    let config = ctx.gate.config();
    let mut flags = Vec::new();
    if state.daily_loss_triggered {
        flags.push("⚠️ Daily loss limit triggered today");
    }
    if !config.enabled {
        flags.push("⚠️ Risk control disabled; no checks are applied");
    }

    let limit = if config.daily_loss_limit_enabled {
        format!("`-{:.2}%`", config.daily_loss_limit_pct)
    } else {
        "off".to_string()
    };
    let on_off = |b: bool| if b { "✅ on" } else { "❌ off" };

    let mut message = format!(
        "🛡 *Risk control*\n\n*Kill\\-Switch:* {}\n*Reason:* {}\n*Triggered at:* `{}`\n\n\
         *Daily loss:* `{:.2}%`\n*Limit:* {}\n*Start equity:* `{}`\n*Current equity:* `{}`\n\n\
         *Risk control:* {}\n*Daily loss limit:* {}",
        if state.kill_switch_active { "🔴 active" } else { "🟢 inactive" },
        esc(state.kill_switch_reason.as_deref().unwrap_or("none")),
        state
            .kill_switch_triggered_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "N/A".to_string()),
        state.daily_loss_pct,
        limit,
        state
            .daily_start_equity
            .map(usd)
            .unwrap_or_else(|| "N/A".to_string()),
        ctx.equity().map(usd).unwrap_or_else(|| "N/A".to_string()),
        on_off(config.enabled),
        on_off(config.daily_loss_limit_enabled),
    );
    for flag in flags {
        message.push('\n');
        message.push_str(&esc(flag));
    }
    CommandResult::ok(message, "RISK_CONTROL_STATUS")
}

fn handle_reset_daily(ctx: &mut CommandContext<'_>) -> CommandResult {
    if !ctx.gate.is_enabled() {
        warn!("Telegram /reset_daily: risk control not enabled");
        return CommandResult {
            success: false,
            message: "⚠️ *Cannot reset the daily baseline*\n\n\
                      Risk control is disabled\\. Check the `RISK_CONTROL_ENABLED` setting\\."
                .to_string(),
            state_changed: false,
            action: None,
        };
    }
    let Some(equity) = ctx.equity().filter(|e| e.is_finite()) else {
        warn!("Telegram /reset_daily: equity unavailable");
        return CommandResult {
            success: false,
            message: "⚠️ *Cannot reset the daily baseline*\n\n\
                      Current equity is unavailable\\. Please retry later\\."
                .to_string(),
            state_changed: false,
            action: None,
        };
    };

    let previous = ctx.gate.state().clone();
    ctx.gate
        .reset_daily_baseline(equity, REASON_TELEGRAM_RESET_DAILY, ctx.now);

    let next_step = if ctx.gate.is_kill_switch_active() {
        "\n\n⚠️ *Kill\\-Switch is still active*\nSend `/resume` to resume trading\\."
    } else {
        "\n\n✅ Trading is running normally\\."
    };
    CommandResult::changed(
        format!(
            "🧮 *Daily loss baseline reset*\n\n*New start equity:* `{}`\n*Previous start equity:* `{}`\n\
             *Current loss:* `0.00%`\n*Previous loss:* `{:.2}%`\n*Daily loss triggered:* `{}` → `false`{}",
            usd(equity),
            previous
                .daily_start_equity
                .map(usd)
                .unwrap_or_else(|| "N/A".to_string()),
            previous.daily_loss_pct,
            previous.daily_loss_triggered,
            next_step
        ),
        "DAILY_BASELINE_RESET",
    )
}

fn handle_positions(ctx: &mut CommandContext<'_>) -> CommandResult {
    if ctx.portfolio.positions.is_empty() {
        return CommandResult::ok("📭 *No open positions*".to_string(), "POSITIONS_SNAPSHOT");
    }

    let mut message = format!("📈 *Open positions \\({}\\)*\n", ctx.portfolio.positions.len());
    for (coin, pos) in &ctx.portfolio.positions {
        let price = ctx.prices.get(coin).copied();
        let pnl = price
            .map(|p| format!("{:+.2}", pos.pnl_at(p)))
            .unwrap_or_else(|| "N/A".to_string());
        message.push_str(&format!(
            "\n*{}* {} `{}x`\nqty `{:.6}` entry `{:.4}` mark `{}`\nPnL `{}` margin `{}`\nSL `{:.4}` TP `{:.4}`\n",
            esc(coin),
            pos.side.as_str().to_uppercase(),
            pos.leverage,
            pos.quantity,
            pos.entry_price,
            price
                .map(|p| format!("{:.4}", p))
                .unwrap_or_else(|| "N/A".to_string()),
            pnl,
            usd(pos.margin),
            pos.stop_loss,
            pos.profit_target,
        ));
    }
    CommandResult::ok(message, "POSITIONS_SNAPSHOT")
}

fn parse_close_args(args: &[String]) -> std::result::Result<(String, Option<f64>), String> {
    let Some(raw_symbol) = args.first() else {
        return Err("Specify a symbol, e.g. /close BTC or /close BTC 50".to_string());
    };
    let symbol = normalize_symbol(raw_symbol);
    if symbol.is_empty() {
        return Err("Invalid symbol".to_string());
    }
    let Some(amount) = args.get(1) else {
        return Ok((symbol, None));
    };
    if amount.trim().eq_ignore_ascii_case("all") {
        return Ok((symbol, None));
    }
    let pct: f64 = amount.trim().parse().map_err(|_| {
        format!(
            "Invalid close percentage '{}'; use a number between 0 and 100 or 'all'",
            amount
        )
    })?;
    if !pct.is_finite() || pct < 0.0 {
        return Err("Close percentage cannot be negative".to_string());
    }
    if pct == 0.0 {
        return Err("Close percentage cannot be 0".to_string());
    }
    Ok((symbol, Some(pct)))
}

async fn handle_close(cmd: &TelegramCommand, ctx: &mut CommandContext<'_>) -> CommandResult {
    let (symbol, pct) = match parse_close_args(&cmd.args) {
        Ok(parsed) => parsed,
        Err(e) => {
            return CommandResult::failed(format!("❌ {}", esc(&e)), "CLOSE_PARSE_ERROR");
        }
    };
    if !ctx.portfolio.positions.contains_key(&symbol) {
        return CommandResult::ok(
            format!("ℹ️ No open position for *{}*\\.", esc(&symbol)),
            "CLOSE_NO_POSITION",
        );
    }
    let Some(price) = ctx.prices.get(&symbol).copied() else {
        return CommandResult::failed(
            format!(
                "❌ Close for *{}* not executed: no market price available\\.",
                esc(&symbol)
            ),
            "CLOSE_EXECUTION_FAILED",
        );
    };

    let fraction = match pct {
        Some(p) if p < 100.0 => p / 100.0,
        _ => 1.0,
    };
    let outcome = ctx
        .executor
        .execute_partial_close(
            ctx.portfolio,
            &symbol,
            fraction,
            "Telegram /close",
            price,
            ctx.now,
        )
        .await;

    match outcome {
        CloseOutcome::Closed {
            quantity,
            net_pnl,
            partial,
        } => {
            let note = if pct.is_some_and(|p| p >= 100.0) {
                "\n_Percentage ≥ 100, closed the full position\\._"
            } else {
                ""
            };
            let remaining = ctx
                .portfolio
                .positions
                .get(&symbol)
                .map(|p| p.quantity)
                .unwrap_or(0.0);
            CommandResult::changed(
                format!(
                    "✅ *{}* {}\n\n*Closed qty:* `{:.6}`\n*Remaining qty:* `{:.6}`\n*Price:* `{:.4}`\n*Net PnL:* `{:+.2}`{}",
                    esc(&symbol),
                    if partial { "partially closed" } else { "closed" },
                    quantity,
                    remaining,
                    price,
                    net_pnl,
                    note
                ),
                if partial {
                    "PARTIAL_CLOSE_EXECUTED"
                } else {
                    "CLOSE_EXECUTED"
                },
            )
        }
        CloseOutcome::NoPosition => CommandResult::ok(
            format!("ℹ️ No open position for *{}*\\.", esc(&symbol)),
            "CLOSE_NO_POSITION",
        ),
        CloseOutcome::ZeroQuantity => CommandResult::failed(
            format!("❌ Position *{}* has zero quantity\\.", esc(&symbol)),
            "CLOSE_ZERO_QUANTITY",
        ),
        CloseOutcome::Failed(errors) => {
            warn!("Telegram /close {} failed: {:?}", symbol, errors);
            CommandResult::failed(
                format!(
                    "❌ Close for *{}* was rejected by the exchange; the position stays open\\.",
                    esc(&symbol)
                ),
                "CLOSE_EXECUTION_FAILED",
            )
        }
    }
}

fn parse_level(raw: &str) -> std::result::Result<Option<f64>, String> {
    let raw = raw.trim();
    if raw == "-" {
        return Ok(None);
    }
    raw.parse::<f64>()
        .map(Some)
        .map_err(|_| format!("Invalid price '{}'", raw))
}

async fn handle_tpsl(cmd: &TelegramCommand, ctx: &mut CommandContext<'_>) -> CommandResult {
    let usage = "Usage: /tpsl SYMBOL SL TP (use - to keep a level)";
    if cmd.args.len() != 3 {
        return CommandResult::failed(format!("❌ {}", esc(usage)), "TPSL_PARSE_ERROR");
    }
    let symbol = normalize_symbol(&cmd.args[0]);
    let (new_sl, new_tp) = match (parse_level(&cmd.args[1]), parse_level(&cmd.args[2])) {
        (Ok(sl), Ok(tp)) => (sl, tp),
        (Err(e), _) | (_, Err(e)) => {
            return CommandResult::failed(
                format!("❌ {}\n{}", esc(&e), esc(usage)),
                "TPSL_PARSE_ERROR",
            )
        }
    };

    match ctx
        .executor
        .update_tpsl(ctx.portfolio, &symbol, new_sl, new_tp)
        .await
    {
        TpslOutcome::Updated {
            stop_loss,
            profit_target,
        } => CommandResult::changed(
            format!(
                "🎯 *{}* protective levels updated\n\n*Stop loss:* `{:.4}`\n*Take profit:* `{:.4}`",
                esc(&symbol),
                stop_loss,
                profit_target
            ),
            "TPSL_UPDATED",
        ),
        TpslOutcome::NoPosition => CommandResult::ok(
            format!("ℹ️ No open position for *{}*\\.", esc(&symbol)),
            "TPSL_NO_POSITION",
        ),
        TpslOutcome::Invalid(e) => {
            CommandResult::failed(format!("❌ {}", esc(&e)), "TPSL_PARSE_ERROR")
        }
        TpslOutcome::Failed(errors) => CommandResult::failed(
            format!(
                "❌ SL/TP update for *{}* failed: {}",
                esc(&symbol),
                esc(&errors.join("; "))
            ),
            "TPSL_UPDATE_FAILED",
        ),
    }
}

/// `Ok` when the sender is the configured admin, otherwise the denial text.
fn check_admin(cmd: &TelegramCommand, cfg: &AppConfig) -> std::result::Result<(), String> {
    match cfg.telegram.admin_user_id {
        None => Err("⛔ *Permission denied*\n\nNo admin user is configured \\(`TELEGRAM_ADMIN_USER_ID`\\)\\."
            .to_string()),
        Some(admin) if cmd.user_id == Some(admin) => Ok(()),
        Some(_) => Err("⛔ *Permission denied*\n\nOnly the admin user may change settings\\.".to_string()),
    }
}

fn effective_value(key: OverrideKey, ctx: &CommandContext<'_>) -> String {
    let risk = ctx.overrides.effective_risk(&ctx.config.risk);
    match key {
        OverrideKey::TradingBackend => ctx.overrides.effective_trading_backend(ctx.config),
        OverrideKey::MarketDataBackend => ctx.overrides.effective_market_data_backend(ctx.config),
        OverrideKey::Interval => ctx.overrides.effective_interval(ctx.config),
        OverrideKey::LlmTemperature => ctx.overrides.effective_llm_temperature(ctx.config).to_string(),
        OverrideKey::LoopEnabled => ctx.overrides.effective_loop_enabled(ctx.config).to_string(),
        OverrideKey::DailyLossLimitEnabled => risk.daily_loss_limit_enabled.to_string(),
        OverrideKey::DailyLossLimitPct => risk.daily_loss_limit_pct.to_string(),
    }
}

fn config_help() -> String {
    "⚙️ *Config commands*\n\n`/config list`\n`/config get KEY`\n`/config set KEY VALUE` \\(admin\\)".to_string()
}

fn handle_config(cmd: &TelegramCommand, ctx: &mut CommandContext<'_>) -> CommandResult {
    let Some(sub) = cmd.args.first().map(|s| s.to_ascii_lowercase()) else {
        return CommandResult::ok(config_help(), "CONFIG_HELP");
    };

    match sub.as_str() {
        "list" => {
            let mut message = "⚙️ *Runtime configuration*\n".to_string();
            for key in OVERRIDE_WHITELIST {
                let source = if ctx.overrides.get(*key).is_some() {
                    "override"
                } else {
                    "config"
                };
                message.push_str(&format!(
                    "\n`{}` \\= `{}` _{}_\n{}",
                    key,
                    effective_value(*key, ctx),
                    source,
                    esc(key.description())
                ));
            }
            CommandResult::ok(message, "CONFIG_LIST")
        }
        "get" => {
            let Some(raw_key) = cmd.args.get(1) else {
                return CommandResult::failed(
                    "❌ Usage: `/config get KEY`".to_string(),
                    "CONFIG_GET_MISSING_KEY",
                );
            };
            match raw_key.parse::<OverrideKey>() {
                Ok(key) => CommandResult::ok(
                    format!(
                        "⚙️ `{}` \\= `{}`\n{}",
                        key,
                        effective_value(key, ctx),
                        esc(key.description())
                    ),
                    "CONFIG_GET",
                ),
                Err(e) => CommandResult::failed(format!("❌ {}", esc(&e)), "CONFIG_GET_INVALID_KEY"),
            }
        }
        "set" => handle_config_set(cmd, ctx),
        _ => CommandResult::failed(
            format!("❌ Unknown subcommand `{}`\n\n{}", sub, config_help()),
            "CONFIG_UNKNOWN_SUBCOMMAND",
        ),
    }
}

fn handle_config_set(cmd: &TelegramCommand, ctx: &mut CommandContext<'_>) -> CommandResult {
    if let Err(denied) = check_admin(cmd, ctx.config) {
        warn!(
            "Telegram /config set: permission denied | user_id={:?}",
            cmd.user_id
        );
        return CommandResult::failed(denied, "CONFIG_SET_PERMISSION_DENIED");
    }
    let Some(raw_key) = cmd.args.get(1) else {
        return CommandResult::failed(
            "❌ Usage: `/config set KEY VALUE`".to_string(),
            "CONFIG_SET_MISSING_KEY",
        );
    };
    let key = match raw_key.parse::<OverrideKey>() {
        Ok(key) => key,
        Err(e) => return CommandResult::failed(format!("❌ {}", esc(&e)), "CONFIG_SET_INVALID_KEY"),
    };
    let Some(value) = cmd.args.get(2) else {
        return CommandResult::failed(
            format!("❌ Missing value for `{}`", key),
            "CONFIG_SET_MISSING_VALUE",
        );
    };

    let before = effective_value(key, ctx);
    if let Err(e) = ctx.overrides.set(key, value) {
        return CommandResult::failed(format!("❌ {}", esc(&e)), "CONFIG_SET_INVALID_VALUE");
    }
    if matches!(
        key,
        OverrideKey::DailyLossLimitEnabled | OverrideKey::DailyLossLimitPct
    ) {
        ctx.gate
            .set_config(ctx.overrides.effective_risk(&ctx.config.risk));
    }
    let after = effective_value(key, ctx);
    info!(
        "Runtime override updated: {} {} -> {} (user_id={:?})",
        key, before, after, cmd.user_id
    );
    CommandResult::changed(
        format!(
            "✅ *Config updated*\n\n`{}`: `{}` → `{}`\n_Runtime only; not persisted across restarts\\._",
            key, before, after
        ),
        "CONFIG_UPDATED",
    )
}

fn symbols_help() -> String {
    "🪙 *Symbol commands*\n\n`/symbols list`\n`/symbols add SYMBOL` \\(admin\\)\n`/symbols remove SYMBOL` \\(admin\\)"
        .to_string()
}

async fn handle_symbols(
    cmd: &TelegramCommand,
    ctx: &mut CommandContext<'_>,
) -> Result<CommandResult> {
    let Some(sub) = cmd.args.first().map(|s| s.to_ascii_lowercase()) else {
        return Ok(CommandResult::ok(symbols_help(), "SYMBOLS_HELP"));
    };

    let result = match sub.as_str() {
        "list" => {
            let mut coins = ctx.universe.clone();
            coins.sort();
            let listing = if coins.is_empty() {
                "_empty_".to_string()
            } else {
                coins.iter().map(|c| format!("`{}`", c)).collect::<Vec<_>>().join(", ")
            };
            CommandResult::ok(
                format!("🪙 *Trading universe \\({}\\)*\n\n{}", coins.len(), listing),
                "SYMBOLS_LIST",
            )
        }
        "add" | "remove" => {
            let adding = sub == "add";
            if let Err(denied) = check_admin(cmd, ctx.config) {
                warn!(
                    "SYMBOLS_AUDIT | action=DENY | op={} | user_id={:?} | reason=not_admin",
                    sub, cmd.user_id
                );
                return Ok(CommandResult::failed(
                    denied,
                    if adding {
                        "SYMBOLS_ADD_PERMISSION_DENIED"
                    } else {
                        "SYMBOLS_REMOVE_PERMISSION_DENIED"
                    },
                ));
            }
            let coin = cmd.args.get(1).map(|s| normalize_symbol(s)).unwrap_or_default();
            if coin.is_empty() {
                return Ok(CommandResult::failed(
                    format!("❌ Usage: `/symbols {} SYMBOL`", sub),
                    if adding {
                        "SYMBOLS_ADD_MISSING_SYMBOL"
                    } else {
                        "SYMBOLS_REMOVE_MISSING_SYMBOL"
                    },
                ));
            }
            if adding {
                add_symbol(coin, ctx).await?
            } else {
                remove_symbol(coin, ctx)
            }
        }
        _ => CommandResult::failed(
            format!("❌ Unknown subcommand `{}`\n\n{}", sub, symbols_help()),
            "SYMBOLS_UNKNOWN_SUBCOMMAND",
        ),
    };
    Ok(result)
}

async fn add_symbol(coin: String, ctx: &mut CommandContext<'_>) -> Result<CommandResult> {
    if ctx.universe.contains(&coin) {
        return Ok(CommandResult::ok(
            format!("ℹ️ `{}` is already in the trading universe\\.", coin),
            "SYMBOLS_ADD_ALREADY_EXISTS",
        ));
    }
    let validator = ctx.symbols.ok_or_else(|| {
        TradebotError::Internal("symbol validation service unavailable".to_string())
    })?;
    let backend = ctx.overrides.effective_market_data_backend(ctx.config);
    let (valid, message) = validator
        .validate_symbol_for_backend(&coin_symbol(&coin), &backend)
        .await;
    if !valid {
        warn!(
            "SYMBOLS_AUDIT | action=DENY | op=add | symbol={} | reason=invalid_symbol | {}",
            coin, message
        );
        return Ok(CommandResult::failed(
            format!("❌ `{}` rejected\n\n{}", coin, esc(&message)),
            "SYMBOLS_ADD_INVALID_SYMBOL",
        ));
    }

    let old_len = ctx.universe.len();
    ctx.universe.push(coin.clone());
    info!(
        "SYMBOLS_AUDIT | action=ADD | symbol={} | old_universe={} symbols | new_universe={} symbols",
        coin,
        old_len,
        ctx.universe.len()
    );
    Ok(CommandResult::changed(
        format!("✅ `{}` added to the trading universe \\({} symbols\\)\\.", coin, ctx.universe.len()),
        "SYMBOLS_ADD",
    ))
}

fn remove_symbol(coin: String, ctx: &mut CommandContext<'_>) -> CommandResult {
    let Some(idx) = ctx.universe.iter().position(|c| *c == coin) else {
        return CommandResult::failed(
            format!("❌ `{}` is not in the trading universe\\.", coin),
            "SYMBOLS_REMOVE_NOT_FOUND",
        );
    };
    let old_len = ctx.universe.len();
    ctx.universe.remove(idx);
    info!(
        "SYMBOLS_AUDIT | action=REMOVE | symbol={} | old_universe={} symbols | new_universe={} symbols",
        coin,
        old_len,
        ctx.universe.len()
    );
    let note = if ctx.portfolio.positions.contains_key(&coin) {
        "\n_An open position remains; it is still managed by stop\\-loss/take\\-profit\\._"
    } else {
        ""
    };
    CommandResult::changed(
        format!(
            "✅ `{}` removed from the trading universe \\({} symbols\\)\\.{}",
            coin,
            ctx.universe.len(),
            note
        ),
        "SYMBOLS_REMOVE",
    )
}
