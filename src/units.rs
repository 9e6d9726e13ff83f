//! Human decimal amounts <-> integer base units.
//!
//! Everything here is exact: parsing goes through `rust_decimal` and scaling is
//! integer arithmetic, so `1.5` SOL is always `1_500_000_000` lamports.

use rust_decimal::Decimal;
use std::str::FromStr;

use crate::error::TradeError;

/// Plain decimal only: digits with at most one `.`. No sign, exponent or `_`.
fn is_plain_decimal(raw: &str) -> bool {
    let mut dots = 0;
    let mut digits = 0;
    for c in raw.chars() {
        match c {
            '0'..='9' => digits += 1,
            '.' => dots += 1,
            _ => return false,
        }
    }
    digits > 0 && dots <= 1
}

/// Parses a human amount. Rejects empty, non-numeric and negative input.
pub fn parse_amount(human: &str) -> Result<Decimal, TradeError> {
    let raw = human.trim();
    if raw.is_empty() {
        return Err(TradeError::InvalidAmount("amount is empty".into()));
    }
    if raw.starts_with('-') {
        return Err(TradeError::InvalidAmount(format!("{raw} is negative")));
    }
    if !is_plain_decimal(raw) {
        return Err(TradeError::InvalidAmount(format!("{raw:?} is not a number")));
    }
    // `.5` and `5.` are fine for a human, not for the decimal parser.
    let canonical = format!("0{}", raw.trim_end_matches('.'));
    let value = Decimal::from_str(&canonical)
        .map_err(|_| TradeError::InvalidAmount(format!("{raw:?} is not a number")))?;
    Ok(value.normalize())
}

/// `"1.5"`, 9 -> `1_500_000_000`.
///
/// Trailing zeros past the precision are fine; significant digits past it are not.
pub fn to_base_units(human: &str, decimals: u8) -> Result<u64, TradeError> {
    let value = parse_amount(human)?;
    if value.is_zero() {
        return Ok(0);
    }

    let scale = value.scale();
    if scale > u32::from(decimals) {
        return Err(TradeError::InvalidAmount(format!(
            "{} has more than {decimals} decimal places",
            human.trim()
        )));
    }

    let mantissa = u128::try_from(value.mantissa())
        .map_err(|_| TradeError::InvalidAmount(format!("{} is negative", human.trim())))?;
    let base = 10u128
        .checked_pow(u32::from(decimals) - scale)
        .and_then(|factor| mantissa.checked_mul(factor))
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| TradeError::InvalidAmount(format!("{} is too large", human.trim())))?;
    Ok(base)
}

/// `1_500_000_000`, 9 -> `"1.5"`. Shortest exact rendering, no exponent.
pub fn to_human_units(base: u64, decimals: u8) -> String {
    let digits = base.to_string();
    let decimals = usize::from(decimals);
    if decimals == 0 {
        return digits;
    }

    let padded = if digits.len() <= decimals {
        format!("{}{}", "0".repeat(decimals + 1 - digits.len()), digits)
    } else {
        digits
    };
    let (int_part, frac_part) = padded.split_at(padded.len() - decimals);
    let frac_part = frac_part.trim_end_matches('0');
    if frac_part.is_empty() {
        int_part.to_string()
    } else {
        format!("{int_part}.{frac_part}")
    }
}

/// Basis points as the percent string the pricing service takes: 1500 -> `"15"`, 50 -> `"0.5"`.
pub fn slippage_percent(bps: u64) -> String {
    Decimal::from_i128_with_scale(i128::from(bps), 2)
        .normalize()
        .to_string()
}
