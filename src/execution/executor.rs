//! Order execution against the configured exchange client.
//!
//! Entries pass a final kill-switch check right before the order is built,
//! independent of any filtering done by the caller. Closes and protective
//! exits never consult the kill switch.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::decision::{Decision, Signal};
use super::planning::{compact, compute_close_plan, compute_entry_plan, EntrySkip, PlanLimits};
use super::portfolio::{Portfolio, Position};
use crate::exchange::{CloseRequest, EntryRequest, ExchangeClient, TpslRequest};
use crate::market::Candle;
use crate::persistence::{Journal, TradeRecord};
use crate::risk::{KillSwitchSignal, RiskGate};

#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    Opened { quantity: f64, margin: f64 },
    /// Refused by the executor kill-switch guard; no order was built.
    Blocked,
    AlreadyOpen,
    Skipped(EntrySkip),
    Failed(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    Closed {
        quantity: f64,
        net_pnl: f64,
        partial: bool,
    },
    NoPosition,
    ZeroQuantity,
    Failed(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TpslOutcome {
    Updated {
        stop_loss: f64,
        profit_target: f64,
    },
    NoPosition,
    Invalid(String),
    Failed(Vec<String>),
}

/// Result of the per-iteration risk evaluation, as seen by decision processing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntryPermission {
    pub allow_entry: bool,
    pub kill_switch_active: bool,
    pub kill_switch_reason: Option<String>,
}

impl EntryPermission {
    pub fn allowed() -> Self {
        Self {
            allow_entry: true,
            ..Default::default()
        }
    }

    pub fn from_gate(gate: &RiskGate, allow_entry: bool) -> Self {
        Self {
            allow_entry,
            kill_switch_active: gate.is_kill_switch_active(),
            kill_switch_reason: gate.state().kill_switch_reason.clone(),
        }
    }

    fn block_reason(&self) -> String {
        if self.kill_switch_active {
            format!(
                "Kill-Switch active ({})",
                self.kill_switch_reason.as_deref().unwrap_or("unknown")
            )
        } else {
            "Risk control".to_string()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecisionSummary {
    pub opened: usize,
    pub closed: usize,
    pub blocked: usize,
    pub skipped: usize,
    pub failed: usize,
    pub held: usize,
}

pub struct TradeExecutor {
    client: Arc<dyn ExchangeClient>,
    kill_switch: Option<Arc<dyn KillSwitchSignal>>,
    risk_control_enabled: bool,
    limits: PlanLimits,
    journal: Journal,
}

impl TradeExecutor {
    pub fn new(client: Arc<dyn ExchangeClient>, limits: PlanLimits) -> Self {
        Self {
            client,
            kill_switch: None,
            risk_control_enabled: true,
            limits,
            journal: Journal::disabled(),
        }
    }

    /// Inject the predicate consulted before every entry order.
    pub fn with_kill_switch(mut self, signal: Arc<dyn KillSwitchSignal>) -> Self {
        self.kill_switch = Some(signal);
        self
    }

    pub fn with_risk_control(mut self, enabled: bool) -> Self {
        self.risk_control_enabled = enabled;
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    pub fn client(&self) -> &Arc<dyn ExchangeClient> {
        &self.client
    }

    /// Swap the exchange client, e.g. after a `TRADING_BACKEND` override.
    pub fn set_client(&mut self, client: Arc<dyn ExchangeClient>) {
        self.client = client;
    }

    pub fn set_limits(&mut self, limits: PlanLimits) {
        self.limits = limits;
    }

    fn kill_switch_engaged(&self) -> bool {
        self.risk_control_enabled
            && self
                .kill_switch
                .as_ref()
                .is_some_and(|signal| signal.is_kill_switch_active())
    }

    pub async fn execute_entry(
        &self,
        portfolio: &mut Portfolio,
        coin: &str,
        decision: &Decision,
        current_price: f64,
        now: DateTime<Utc>,
    ) -> EntryOutcome {
        if self.kill_switch_engaged() {
            warn!(
                "Kill-Switch active (executor guard): blocking entry for {} at price {:.4}",
                coin, current_price
            );
            return EntryOutcome::Blocked;
        }

        if portfolio.positions.contains_key(coin) {
            warn!("{}: Already have position, skipping entry", coin);
            return EntryOutcome::AlreadyOpen;
        }

        let plan = match compute_entry_plan(decision, current_price, portfolio.balance, &self.limits)
        {
            Ok(plan) => plan,
            Err(skip) => {
                warn!("{}: Skipping entry: {}", coin, skip);
                return EntryOutcome::Skipped(skip);
            }
        };

        let request = EntryRequest {
            coin: coin.to_string(),
            side: plan.side,
            size: plan.quantity,
            entry_price: Some(current_price),
            stop_loss_price: Some(plan.stop_loss_price),
            take_profit_price: Some(plan.profit_target_price),
            leverage: plan.leverage,
            liquidity: plan.liquidity,
        };
        let result = self.client.place_entry(&request).await;
        if !result.success {
            error!(
                "{}: {} entry failed: {}",
                coin,
                result.backend,
                result.errors.join("; ")
            );
            return EntryOutcome::Failed(result.errors);
        }

        let reason = compact(&plan.raw_reason);
        portfolio.positions.insert(
            coin.to_string(),
            Position {
                side: plan.side,
                quantity: plan.quantity,
                entry_price: current_price,
                profit_target: plan.profit_target_price,
                stop_loss: plan.stop_loss_price,
                leverage: plan.leverage,
                confidence: decision.confidence,
                invalidation_condition: decision.invalidation_condition.clone(),
                margin: plan.margin_required,
                fees_paid: plan.entry_fee,
                fee_rate: plan.fee_rate,
                liquidity: plan.liquidity,
                risk_usd: plan.risk_usd,
                live_backend: self.client.is_live().then_some(result.backend),
                entry_oid: result.entry_oid.clone(),
                tp_oid: result.tp_oid.clone(),
                sl_oid: result.sl_oid.clone(),
                entry_justification: reason.clone(),
                last_justification: reason.clone(),
                opened_at: Some(now),
            },
        );
        portfolio.balance -= plan.total_cost;

        info!(
            "[ENTRY] {} {} {:.0}x @ {:.4} qty={:.6} margin=${:.2} risk=${:.2} TP={:.4} SL={:.4} fee=${:.2} backend={}",
            coin,
            plan.side.as_str().to_uppercase(),
            plan.leverage,
            current_price,
            plan.quantity,
            plan.margin_required,
            plan.risk_usd,
            plan.profit_target_price,
            plan.stop_loss_price,
            plan.entry_fee,
            result.backend
        );

        let reason_text = if reason.is_empty() {
            "AI entry signal"
        } else {
            reason.as_str()
        };
        self.journal.record_trade(TradeRecord {
            event_id: Uuid::new_v4(),
            timestamp: now,
            coin: coin.to_string(),
            action: "ENTRY".to_string(),
            side: plan.side.as_str().to_string(),
            quantity: plan.quantity,
            price: current_price,
            pnl: 0.0,
            reason: format!("{} | Fees: ${:.2}", reason_text, plan.entry_fee),
            backend: result.backend.to_string(),
        });

        EntryOutcome::Opened {
            quantity: plan.quantity,
            margin: plan.margin_required,
        }
    }

    /// Close the whole position. Never gated by the kill switch.
    pub async fn execute_close(
        &self,
        portfolio: &mut Portfolio,
        coin: &str,
        reason: &str,
        current_price: f64,
        now: DateTime<Utc>,
    ) -> CloseOutcome {
        self.execute_partial_close(portfolio, coin, 1.0, reason, current_price, now)
            .await
    }

    /// Close `fraction` (0, 1] of a position; 1.0 removes it.
    pub async fn execute_partial_close(
        &self,
        portfolio: &mut Portfolio,
        coin: &str,
        fraction: f64,
        reason: &str,
        current_price: f64,
        now: DateTime<Utc>,
    ) -> CloseOutcome {
        let Some(position) = portfolio.positions.get(coin) else {
            warn!("{}: No position to close", coin);
            return CloseOutcome::NoPosition;
        };

        let plan = compute_close_plan(position, reason, current_price, fraction);
        if plan.quantity <= 0.0 {
            warn!("{}: close quantity is zero, nothing to do", coin);
            return CloseOutcome::ZeroQuantity;
        }
        let partial = plan.fraction < 1.0;
        let side = position.side;

        let result = self
            .client
            .close_position(&CloseRequest {
                coin: coin.to_string(),
                side,
                size: Some(plan.quantity),
                fallback_price: Some(current_price),
            })
            .await;
        if !result.success {
            error!(
                "{}: {} close failed; position remains open. {}",
                coin,
                result.backend,
                result.errors.join("; ")
            );
            return CloseOutcome::Failed(result.errors);
        }
        if let Some(note) = result.reason() {
            info!("{}: close note from {}: {}", coin, result.backend, note);
        }

        portfolio.balance += plan.margin_released + plan.net_pnl;
        if partial {
            if let Some(pos) = portfolio.positions.get_mut(coin) {
                pos.quantity -= plan.quantity;
                pos.margin -= plan.margin_released;
                pos.fees_paid -= pos.fees_paid * plan.fraction;
            }
        } else {
            portfolio.positions.remove(coin);
        }

        info!(
            "[{}] {} {} qty={:.6} @ {:.4} gross=${:.2} fees=${:.2} net=${:.2} balance=${:.2} reason={}",
            if partial { "PARTIAL CLOSE" } else { "CLOSE" },
            coin,
            side.as_str().to_uppercase(),
            plan.quantity,
            current_price,
            plan.pnl,
            plan.total_fees,
            plan.net_pnl,
            portfolio.balance,
            plan.reason_text
        );

        self.journal.record_trade(TradeRecord {
            event_id: Uuid::new_v4(),
            timestamp: now,
            coin: coin.to_string(),
            action: if partial { "PARTIAL_CLOSE" } else { "CLOSE" }.to_string(),
            side: side.as_str().to_string(),
            quantity: plan.quantity,
            price: current_price,
            pnl: plan.net_pnl,
            reason: format!(
                "{} | Gross: ${:.2} | Fees: ${:.2}",
                plan.reason_text, plan.pnl, plan.total_fees
            ),
            backend: result.backend.to_string(),
        });

        CloseOutcome::Closed {
            quantity: plan.quantity,
            net_pnl: plan.net_pnl,
            partial,
        }
    }

    pub fn process_hold(&self, portfolio: &mut Portfolio, coin: &str, decision: &Decision) {
        let Some(pos) = portfolio.positions.get_mut(coin) else {
            return;
        };
        let reason = compact(&decision.justification);
        if !reason.is_empty() {
            pos.last_justification = reason;
        } else if pos.last_justification.trim().is_empty() {
            pos.last_justification = "No justification provided.".to_string();
        }
        debug!(
            "[HOLD] {} {} qty={:.6} TP={:.4} SL={:.4} reason={}",
            coin,
            pos.side.as_str().to_uppercase(),
            pos.quantity,
            pos.profit_target,
            pos.stop_loss,
            pos.last_justification
        );
    }

    /// Move stop-loss and/or take-profit of an open position.
    ///
    /// Live clients update their protective orders first; local levels only
    /// change once the exchange accepted.
    pub async fn update_tpsl(
        &self,
        portfolio: &mut Portfolio,
        coin: &str,
        new_sl: Option<f64>,
        new_tp: Option<f64>,
    ) -> TpslOutcome {
        let Some(pos) = portfolio.positions.get(coin) else {
            return TpslOutcome::NoPosition;
        };
        if new_sl.is_none() && new_tp.is_none() {
            return TpslOutcome::Invalid("provide a new stop loss and/or take profit".to_string());
        }
        if let Some(bad) = [new_sl, new_tp]
            .into_iter()
            .flatten()
            .find(|p| !p.is_finite() || *p <= 0.0)
        {
            return TpslOutcome::Invalid(format!("price {} must be positive", bad));
        }

        let (mut sl_oid, mut tp_oid) = (None, None);
        if self.client.is_live() {
            let result = self
                .client
                .update_tpsl(&TpslRequest {
                    coin: coin.to_string(),
                    side: pos.side,
                    quantity: pos.quantity,
                    new_sl,
                    new_tp,
                })
                .await;
            if !result.success {
                warn!(
                    "{}: {} SL/TP update failed: {}",
                    coin,
                    result.backend,
                    result.errors.join("; ")
                );
                return TpslOutcome::Failed(result.errors);
            }
            sl_oid = result.sl_order_id;
            tp_oid = result.tp_order_id;
        }

        let Some(pos) = portfolio.positions.get_mut(coin) else {
            return TpslOutcome::NoPosition;
        };
        if let Some(sl) = new_sl {
            pos.stop_loss = sl;
            if sl_oid.is_some() {
                pos.sl_oid = sl_oid;
            }
        }
        if let Some(tp) = new_tp {
            pos.profit_target = tp;
            if tp_oid.is_some() {
                pos.tp_oid = tp_oid;
            }
        }
        info!(
            "{}: SL/TP updated to SL={:.4} TP={:.4}",
            coin, pos.stop_loss, pos.profit_target
        );
        TpslOutcome::Updated {
            stop_loss: pos.stop_loss,
            profit_target: pos.profit_target,
        }
    }

    /// Apply one iteration's decisions for the coin universe.
    pub async fn process_decisions(
        &self,
        portfolio: &mut Portfolio,
        universe: &[String],
        decisions: &BTreeMap<String, Decision>,
        candles: &HashMap<String, Candle>,
        permission: &EntryPermission,
        now: DateTime<Utc>,
    ) -> DecisionSummary {
        let mut summary = DecisionSummary::default();

        let orphaned: Vec<&String> = portfolio
            .positions
            .keys()
            .filter(|coin| !universe.contains(coin))
            .collect();
        if !orphaned.is_empty() {
            warn!(
                "Positions exist outside current universe and will not receive decisions: {:?}. \
                 These positions are still managed by SL/TP logic.",
                orphaned
            );
        }

        for coin in universe {
            let Some(decision) = decisions.get(coin) else {
                continue;
            };
            self.journal.record_decision(
                coin,
                decision.signal.as_str(),
                &decision.justification,
                decision.confidence,
            );

            if decision.signal == Signal::Entry && !permission.allow_entry {
                let block_reason = permission.block_reason();
                warn!(
                    "coin={} signal=entry allow_entry=false kill_switch_active={} {}",
                    coin, permission.kill_switch_active, block_reason
                );
                self.journal.record_decision(
                    coin,
                    "blocked",
                    &format!(
                        "RISK_CONTROL_BLOCKED: {} | original: {}",
                        block_reason, decision.justification
                    ),
                    decision.confidence,
                );
                summary.blocked += 1;
                continue;
            }

            let Some(price) = candles.get(coin).map(|c| c.close) else {
                debug!("{}: no market data, skipping {} decision", coin, decision.signal);
                continue;
            };

            match decision.signal {
                Signal::Entry => match self
                    .execute_entry(portfolio, coin, decision, price, now)
                    .await
                {
                    EntryOutcome::Opened { .. } => summary.opened += 1,
                    EntryOutcome::Blocked => summary.blocked += 1,
                    EntryOutcome::Failed(_) => summary.failed += 1,
                    EntryOutcome::AlreadyOpen | EntryOutcome::Skipped(_) => summary.skipped += 1,
                },
                Signal::Close => match self
                    .execute_close(portfolio, coin, &decision.justification, price, now)
                    .await
                {
                    CloseOutcome::Closed { .. } => summary.closed += 1,
                    CloseOutcome::Failed(_) => summary.failed += 1,
                    CloseOutcome::NoPosition | CloseOutcome::ZeroQuantity => summary.skipped += 1,
                },
                Signal::Hold => {
                    self.process_hold(portfolio, coin, decision);
                    summary.held += 1;
                }
            }
        }
        summary
    }

    /// Close positions whose stop-loss or take-profit was touched by the
    /// latest candle. Runs regardless of the kill switch.
    pub async fn check_stop_loss_take_profit(
        &self,
        portfolio: &mut Portfolio,
        candles: &HashMap<String, Candle>,
        now: DateTime<Utc>,
    ) -> Vec<(String, CloseOutcome)> {
        if self.client.manages_protective_orders() {
            return Vec::new();
        }

        let coins: Vec<String> = portfolio.positions.keys().cloned().collect();
        let mut exits = Vec::new();
        for coin in coins {
            let Some(candle) = candles.get(&coin) else {
                debug!("{}: no market data for SL/TP check", coin);
                continue;
            };
            let Some((reason, exit_price)) = portfolio
                .positions
                .get(&coin)
                .and_then(|pos| pos.protective_exit(candle.high, candle.low))
            else {
                continue;
            };
            let outcome = self
                .execute_close(portfolio, &coin, reason, exit_price, now)
                .await;
            exits.push((coin, outcome));
        }
        exits
    }
}
