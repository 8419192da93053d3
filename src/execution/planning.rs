//! Position sizing and fee arithmetic for entries and closes.
//!
//! Pure functions: no I/O, no clock, so every rule is unit-testable.

use thiserror::Error;

use super::decision::Decision;
use super::portfolio::Position;
use crate::config::ExecutionConfig;
use crate::exchange::{Liquidity, PositionSide};

pub const MIN_REWARD_FEE_RATIO: f64 = 3.0;
pub const MIN_EXPECTED_REWARD_USD: f64 = 1.0;
pub const DEFAULT_LEVERAGE: f64 = 10.0;
pub const DEFAULT_RISK_FRACTION: f64 = 0.01;

const CONTRADICTORY_PHRASES: &[&str] = &[
    "no entry",
    "no long entry",
    "no short entry",
    "do not enter",
    "avoid entry",
    "skip entry",
];

/// Sizing limits and fee schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanLimits {
    pub is_live_backend: bool,
    pub live_max_leverage: f64,
    pub live_max_risk_usd: f64,
    pub live_max_margin_usd: f64,
    pub maker_fee_rate: f64,
    pub taker_fee_rate: f64,
}

impl PlanLimits {
    pub fn from_config(cfg: &ExecutionConfig, is_live_backend: bool) -> Self {
        Self {
            is_live_backend,
            live_max_leverage: cfg.live_max_leverage,
            live_max_risk_usd: cfg.live_max_risk_usd,
            live_max_margin_usd: cfg.live_max_margin_usd,
            maker_fee_rate: cfg.maker_fee_rate,
            taker_fee_rate: cfg.taker_fee_rate,
        }
    }

    fn fee_rate(&self, liquidity: Liquidity) -> f64 {
        match liquidity {
            Liquidity::Maker => self.maker_fee_rate,
            Liquidity::Taker => self.taker_fee_rate,
        }
    }
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default(), false)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EntrySkip {
    #[error("justification contradicts entry signal ({0})")]
    ContradictoryJustification(String),
    #[error("missing stop loss or profit target")]
    MissingLevels,
    #[error("non-positive stop loss ({stop_loss}) or profit target ({profit_target})")]
    NonPositiveLevels { stop_loss: f64, profit_target: f64 },
    #[error("stop loss {stop_loss} on wrong side of price {price} for {side}")]
    StopOnWrongSide {
        side: PositionSide,
        stop_loss: f64,
        price: f64,
    },
    #[error("profit target {profit_target} on wrong side of price {price} for {side}")]
    TargetOnWrongSide {
        side: PositionSide,
        profit_target: f64,
        price: f64,
    },
    #[error("invalid price {0}")]
    InvalidPrice(f64),
    #[error("expected gross reward {0:.4} below minimum 1.0")]
    RewardTooSmall(f64),
    #[error("reward/fee ratio {0:.2} below minimum 3.0")]
    RewardFeeRatioTooLow(f64),
    #[error("insufficient balance ${balance:.2} for margin ${margin:.2} and fees ${fee:.2}")]
    InsufficientBalance { balance: f64, margin: f64, fee: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryPlan {
    pub side: PositionSide,
    pub leverage: f64,
    pub stop_loss_price: f64,
    pub profit_target_price: f64,
    pub risk_usd: f64,
    pub quantity: f64,
    pub position_value: f64,
    pub margin_required: f64,
    pub liquidity: Liquidity,
    pub fee_rate: f64,
    pub entry_fee: f64,
    pub total_cost: f64,
    pub raw_reason: String,
}

pub fn compact(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn compute_entry_plan(
    decision: &Decision,
    current_price: f64,
    balance: f64,
    limits: &PlanLimits,
) -> Result<EntryPlan, EntrySkip> {
    if !current_price.is_finite() || current_price <= 0.0 {
        return Err(EntrySkip::InvalidPrice(current_price));
    }

    let side = decision.side;
    let raw_reason = decision.justification.trim().to_string();
    let reason = compact(&raw_reason);
    let reason_lower = reason.to_lowercase();
    if CONTRADICTORY_PHRASES.iter().any(|p| reason_lower.contains(p)) {
        return Err(EntrySkip::ContradictoryJustification(reason));
    }

    let mut leverage = decision.leverage.unwrap_or(DEFAULT_LEVERAGE);
    if leverage <= 0.0 {
        leverage = 1.0;
    }
    let mut risk_usd = decision
        .risk_usd
        .unwrap_or(balance * DEFAULT_RISK_FRACTION);

    if limits.is_live_backend {
        if limits.live_max_leverage > 0.0 && leverage > limits.live_max_leverage {
            leverage = limits.live_max_leverage;
        }
        if limits.live_max_risk_usd > 0.0 && risk_usd > limits.live_max_risk_usd {
            risk_usd = limits.live_max_risk_usd;
        }
    }

    let (Some(stop_loss), Some(profit_target)) = (decision.stop_loss, decision.profit_target)
    else {
        return Err(EntrySkip::MissingLevels);
    };
    if stop_loss <= 0.0 || profit_target <= 0.0 {
        return Err(EntrySkip::NonPositiveLevels {
            stop_loss,
            profit_target,
        });
    }

    let (stop_ok, target_ok) = match side {
        PositionSide::Long => (stop_loss < current_price, profit_target > current_price),
        PositionSide::Short => (stop_loss > current_price, profit_target < current_price),
    };
    if !stop_ok {
        return Err(EntrySkip::StopOnWrongSide {
            side,
            stop_loss,
            price: current_price,
        });
    }
    if !target_ok {
        return Err(EntrySkip::TargetOnWrongSide {
            side,
            profit_target,
            price: current_price,
        });
    }

    // non-zero after the side checks above
    let stop_distance = (current_price - stop_loss).abs();
    let mut quantity = risk_usd / stop_distance;
    let mut position_value = quantity * current_price;
    let mut margin_required = position_value / leverage;

    if limits.is_live_backend
        && limits.live_max_margin_usd > 0.0
        && margin_required > limits.live_max_margin_usd
    {
        margin_required = limits.live_max_margin_usd;
        position_value = margin_required * leverage;
        quantity = position_value / current_price;
        risk_usd = risk_usd.min(quantity * stop_distance);
    }

    let liquidity = decision.liquidity;
    let fee_rate = decision
        .fee_rate
        .filter(|r| *r >= 0.0)
        .unwrap_or_else(|| limits.fee_rate(liquidity));
    let entry_fee = position_value * fee_rate;

    let expected_gross_reward = quantity * (profit_target - current_price).abs();
    // exit fee assumed equal to the entry fee
    let total_fees_est = entry_fee * 2.0;
    if expected_gross_reward < MIN_EXPECTED_REWARD_USD {
        return Err(EntrySkip::RewardTooSmall(expected_gross_reward));
    }
    if total_fees_est > 0.0 && expected_gross_reward / total_fees_est < MIN_REWARD_FEE_RATIO {
        return Err(EntrySkip::RewardFeeRatioTooLow(
            expected_gross_reward / total_fees_est,
        ));
    }

    let total_cost = margin_required + entry_fee;
    if total_cost > balance {
        return Err(EntrySkip::InsufficientBalance {
            balance,
            margin: margin_required,
            fee: entry_fee,
        });
    }

    Ok(EntryPlan {
        side,
        leverage,
        stop_loss_price: stop_loss,
        profit_target_price: profit_target,
        risk_usd,
        quantity,
        position_value,
        margin_required,
        liquidity,
        fee_rate,
        entry_fee,
        total_cost,
        raw_reason,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClosePlan {
    pub reason_text: String,
    /// Fraction of the position being closed, in (0, 1]
    pub fraction: f64,
    pub quantity: f64,
    pub pnl: f64,
    pub fee_rate: f64,
    pub exit_fee: f64,
    pub total_fees: f64,
    pub net_pnl: f64,
    /// Margin released back to the balance
    pub margin_released: f64,
}

/// Realised PnL and fees for closing `fraction` of `position` at `price`.
pub fn compute_close_plan(
    position: &Position,
    reason: &str,
    current_price: f64,
    fraction: f64,
) -> ClosePlan {
    let fraction = if fraction.is_finite() {
        fraction.clamp(0.0, 1.0)
    } else {
        1.0
    };
    let base_reason = if reason.trim().is_empty() {
        if position.last_justification.trim().is_empty() {
            "AI close signal"
        } else {
            position.last_justification.as_str()
        }
    } else {
        reason
    };

    let quantity = position.quantity * fraction;
    let pnl = position.pnl_at(current_price) * fraction;
    let exit_fee = quantity * current_price * position.fee_rate;
    let total_fees = position.fees_paid * fraction + exit_fee;

    ClosePlan {
        reason_text: compact(base_reason),
        fraction,
        quantity,
        pnl,
        fee_rate: position.fee_rate,
        exit_fee,
        total_fees,
        net_pnl: pnl - total_fees,
        margin_released: position.margin * fraction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::decision::Signal;

    fn entry(side: PositionSide, stop: f64, target: f64) -> Decision {
        Decision {
            signal: Signal::Entry,
            side,
            leverage: Some(5.0),
            risk_usd: Some(50.0),
            stop_loss: Some(stop),
            profit_target: Some(target),
            justification: "breakout".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn sizes_by_risk_over_stop_distance() {
        let plan = compute_entry_plan(
            &entry(PositionSide::Long, 95.0, 110.0),
            100.0,
            10_000.0,
            &PlanLimits::default(),
        )
        .expect("plan should be accepted");
        assert!((plan.quantity - 10.0).abs() < 1e-9);
        assert!((plan.position_value - 1_000.0).abs() < 1e-9);
        assert!((plan.margin_required - 200.0).abs() < 1e-9);
        assert!((plan.entry_fee - 0.275).abs() < 1e-9);
        assert!((plan.total_cost - 200.275).abs() < 1e-9);
    }

    #[test]
    fn rejects_contradictory_justification() {
        let mut d = entry(PositionSide::Long, 95.0, 110.0);
        d.justification = "Signal says entry but   Do Not Enter yet".to_string();
        let err = compute_entry_plan(&d, 100.0, 10_000.0, &PlanLimits::default())
            .expect_err("contradiction should skip");
        assert!(matches!(err, EntrySkip::ContradictoryJustification(_)));
    }

    #[test]
    fn rejects_levels_on_wrong_side() {
        let limits = PlanLimits::default();
        assert!(matches!(
            compute_entry_plan(&entry(PositionSide::Long, 101.0, 110.0), 100.0, 10_000.0, &limits),
            Err(EntrySkip::StopOnWrongSide { .. })
        ));
        assert!(matches!(
            compute_entry_plan(&entry(PositionSide::Short, 105.0, 101.0), 100.0, 10_000.0, &limits),
            Err(EntrySkip::TargetOnWrongSide { .. })
        ));
        let mut missing = entry(PositionSide::Long, 95.0, 110.0);
        missing.stop_loss = None;
        assert_eq!(
            compute_entry_plan(&missing, 100.0, 10_000.0, &limits),
            Err(EntrySkip::MissingLevels)
        );
    }

    #[test]
    fn non_positive_leverage_becomes_one() {
        let mut d = entry(PositionSide::Long, 95.0, 110.0);
        d.leverage = Some(-3.0);
        let plan = compute_entry_plan(&d, 100.0, 10_000.0, &PlanLimits::default())
            .expect("plan should be accepted");
        assert_eq!(plan.leverage, 1.0);
        assert!((plan.margin_required - 1_000.0).abs() < 1e-9);
    }

    #[test]
    fn tiny_reward_and_poor_fee_ratio_skip() {
        let limits = PlanLimits::default();
        let mut d = entry(PositionSide::Long, 95.0, 100.4);
        d.risk_usd = Some(5.0);
        assert!(matches!(
            compute_entry_plan(&d, 100.0, 10_000.0, &limits),
            Err(EntrySkip::RewardTooSmall(_))
        ));

        let expensive = PlanLimits {
            taker_fee_rate: 0.01,
            ..limits
        };
        assert!(matches!(
            compute_entry_plan(&entry(PositionSide::Long, 95.0, 102.0), 100.0, 10_000.0, &expensive),
            Err(EntrySkip::RewardFeeRatioTooLow(_))
        ));
    }

    #[test]
    fn live_caps_limit_leverage_risk_and_margin() {
        let limits = PlanLimits {
            is_live_backend: true,
            live_max_leverage: 2.0,
            live_max_risk_usd: 20.0,
            live_max_margin_usd: 100.0,
            ..PlanLimits::default()
        };
        let plan = compute_entry_plan(&entry(PositionSide::Long, 95.0, 110.0), 100.0, 10_000.0, &limits)
            .expect("plan should be accepted");
        assert_eq!(plan.leverage, 2.0);
        assert!((plan.margin_required - 100.0).abs() < 1e-9);
        assert!((plan.quantity - 2.0).abs() < 1e-9);
        assert!((plan.risk_usd - 10.0).abs() < 1e-9);
    }

    #[test]
    fn insufficient_balance_skips() {
        let err = compute_entry_plan(
            &entry(PositionSide::Long, 95.0, 110.0),
            100.0,
            150.0,
            &PlanLimits::default(),
        )
        .expect_err("balance too small");
        assert!(matches!(err, EntrySkip::InsufficientBalance { .. }));
    }

    #[test]
    fn close_plan_nets_fees_and_scales_by_fraction() {
        let pos = Position {
            side: PositionSide::Short,
            quantity: 4.0,
            entry_price: 100.0,
            margin: 80.0,
            fees_paid: 0.4,
            fee_rate: 0.001,
            last_justification: "trend  weakening".to_string(),
            ..Default::default()
        };
        let full = compute_close_plan(&pos, "", 90.0, 1.0);
        assert_eq!(full.reason_text, "trend weakening");
        assert!((full.pnl - 40.0).abs() < 1e-9);
        assert!((full.exit_fee - 0.36).abs() < 1e-9);
        assert!((full.net_pnl - (40.0 - 0.76)).abs() < 1e-9);
        assert_eq!(full.margin_released, 80.0);

        let half = compute_close_plan(&pos, "trim", 90.0, 0.5);
        assert!((half.quantity - 2.0).abs() < 1e-9);
        assert!((half.pnl - 20.0).abs() < 1e-9);
        assert_eq!(half.margin_released, 40.0);

        let fallback = compute_close_plan(&Position::default(), " ", 1.0, 1.0);
        assert_eq!(fallback.reason_text, "AI close signal");
    }
}
