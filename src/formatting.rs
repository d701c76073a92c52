use std::str::FromStr;

use ethers::types::U256;
use ethers::utils::{format_units, parse_units};
use rust_decimal::prelude::*;
use rust_decimal::{Decimal, dec};

use crate::error::{Result, YieldError};
use crate::types::SECONDS_PER_YEAR;

/// ~12 s blocks
pub const BLOCKS_PER_YEAR: u64 = 2_628_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateFormat {
    /// Annual rate scaled by 1e27 (AAVE)
    Ray,
    /// Already a percentage
    Percent,
    /// Per-second rate scaled by 1e18 (Compound v3)
    PerSecond,
    /// Per-block rate scaled by 1e18
    PerBlock,
}

/// Half-away-from-zero rounding, the way amounts are displayed everywhere
pub fn round_to(value: Decimal, dp: u32) -> Decimal {
    value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
}

pub fn round_2dp(value: Decimal) -> Decimal {
    round_to(value, 2)
}

/// Base units -> human amount with `precision` decimals
pub fn format_amount(amount: U256, decimals: u32, precision: u32) -> Result<Decimal> {
    let units = format_units(amount, decimals as usize)
        .map_err(|e| YieldError::Conversion(format!("format_units({amount}): {e}")))?;
    let value = Decimal::from_str(&units)
        .map_err(|e| YieldError::Conversion(format!("{units} is not a decimal: {e}")))?;
    Ok(round_to(value, precision))
}

/// Human amount -> base units
pub fn parse_amount(amount: &str, decimals: u32) -> Result<U256> {
    parse_units(amount, decimals as usize)
        .map(Into::into)
        .map_err(|e| YieldError::Conversion(format!("parse_units({amount}): {e}")))
}

pub fn u256_to_decimal(value: U256) -> Result<Decimal> {
    Decimal::from_str(&value.to_string())
        .map_err(|e| YieldError::Conversion(format!("{value} exceeds decimal range: {e}")))
}

/// `(1 + r)^periods - 1`, via ln/exp so tiny per-period rates keep their precision
fn compound(rate_per_period: f64, periods: u64) -> f64 {
    (rate_per_period.ln_1p() * periods as f64).exp_m1()
}

/// `0.0525` -> `5.25`; NaN and infinities become zero
pub fn fraction_to_percent(fraction: f64) -> Decimal {
    if !fraction.is_finite() {
        return Decimal::ZERO;
    }
    round_2dp(Decimal::from_f64(fraction * 100.0).unwrap_or(Decimal::ZERO))
}

/// Convert an on-chain rate into an APY percentage with 2 decimals
pub fn format_apy(raw: Decimal, format: RateFormat) -> Decimal {
    let raw_f = raw.to_f64().unwrap_or(0.0);
    match format {
        RateFormat::Ray => {
            let apr = raw_f / 1e27;
            fraction_to_percent(compound(apr / SECONDS_PER_YEAR as f64, SECONDS_PER_YEAR))
        }
        RateFormat::PerSecond => fraction_to_percent(compound(raw_f / 1e18, SECONDS_PER_YEAR)),
        RateFormat::PerBlock => fraction_to_percent(compound(raw_f / 1e18, BLOCKS_PER_YEAR)),
        RateFormat::Percent => round_2dp(raw),
    }
}

pub fn ray_to_apy(rate: U256) -> Result<Decimal> {
    Ok(format_apy(u256_to_decimal(rate)?, RateFormat::Ray))
}

pub fn per_second_rate_to_apy(rate: U256) -> Result<Decimal> {
    Ok(format_apy(u256_to_decimal(rate)?, RateFormat::PerSecond))
}

/// `$1,234.56`
pub fn format_usd(value: Decimal) -> String {
    let rounded = round_2dp(value);
    let text = format!("{:.2}", rounded.abs());
    let (whole, cents) = text.split_at(text.len() - 3);

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, digit) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    let sign = if rounded.is_sign_negative() && !rounded.is_zero() { "-" } else { "" };
    format!("{sign}${grouped}{cents}")
}

/// Percent change from `old` to `new`; zero when `old` is zero
pub fn percentage_diff(old: Decimal, new: Decimal) -> Decimal {
    if old.is_zero() {
        return Decimal::ZERO;
    }
    round_2dp((new - old) / old * dec!(100))
}

/// Simple-interest gain over `days` at `apy` percent
pub fn estimated_gain(amount: Decimal, apy: Decimal, days: u32) -> Decimal {
    let daily_rate = apy / dec!(100) / dec!(365);
    round_2dp(amount * daily_rate * Decimal::from(days))
}

pub fn max_value(values: &[Decimal]) -> Decimal {
    values.iter().copied().max().unwrap_or(Decimal::ZERO)
}

pub fn min_value(values: &[Decimal]) -> Decimal {
    values.iter().copied().min().unwrap_or(Decimal::ZERO)
}
