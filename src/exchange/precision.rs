//! Tick/step normalisation shared by the REST adapters.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

pub fn to_decimal(value: f64) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    Decimal::from_f64(value)
}

/// Round a size down to a whole number of `step` increments.
pub fn round_down_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    let units = (value / step).trunc();
    (units * step).normalize()
}

/// Round a price to the nearest multiple of `tick`.
pub fn round_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    let units = (price / tick).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    (units * tick).normalize()
}

/// Render with at most `max_dp` decimals and no trailing zeros.
pub fn format_decimal(value: Decimal, max_dp: u32) -> String {
    value
        .round_dp_with_strategy(max_dp, RoundingStrategy::ToZero)
        .normalize()
        .to_string()
}

/// Format an f64 with a fixed number of decimals, trimming trailing zeros.
pub fn format_fixed(value: f64, dp: usize) -> String {
    let text = format!("{:.*}", dp, value);
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text
    }
}

pub fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}
