//! Integer base units on chain, exact decimals everywhere else.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::{CustodyError, CustodyResult};

/// TRC-20 USDT decimals.
pub const USDT_DECIMALS: u32 = 6;
/// 1 TRX = 1_000_000 sun.
pub const TRX_DECIMALS: u32 = 6;

/// `raw / 10^decimals`, exact.
pub fn from_base_units(raw: u128, decimals: u32) -> CustodyResult<Decimal> {
    let raw = i128::try_from(raw).map_err(|_| CustodyError::InvalidAmount(format!("{} overflows", raw)))?;
    Decimal::try_from_i128_with_scale(raw, decimals)
        .map(|d| d.normalize())
        .map_err(|e| CustodyError::InvalidAmount(format!("{}: {}", raw, e)))
}

/// `amount * 10^decimals`, truncating anything below the smallest unit.
pub fn to_base_units(amount: Decimal, decimals: u32) -> CustodyResult<u128> {
    if amount.is_sign_negative() {
        return Err(CustodyError::InvalidAmount(format!("{} is negative", amount)));
    }
    let scaled = amount
        .round_dp_with_strategy(decimals, RoundingStrategy::ToZero)
        .checked_mul(Decimal::from(10u64.pow(decimals)))
        .ok_or_else(|| CustodyError::InvalidAmount(format!("{} overflows", amount)))?;
    scaled
        .trunc()
        .to_u128()
        .ok_or_else(|| CustodyError::InvalidAmount(format!("{} overflows", amount)))
}

/// Parse a base-unit integer the way chain APIs send it: decimal string or 0x-hex.
pub fn parse_raw_amount(value: &str) -> CustodyResult<u128> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x") {
        Some(hex) if hex.is_empty() => Ok(0),
        Some(hex) => u128::from_str_radix(hex, 16),
        None => value.parse::<u128>(),
    };
    parsed.map_err(|e| CustodyError::InvalidAmount(format!("{}: {}", value, e)))
}

/// Parse a positive amount with at most `decimals` fractional digits.
pub fn parse_amount(value: &str, decimals: u32) -> CustodyResult<Decimal> {
    let amount: Decimal = value
        .trim()
        .parse()
        .map_err(|e| CustodyError::InvalidAmount(format!("{}: {}", value, e)))?;
    if amount <= Decimal::ZERO {
        return Err(CustodyError::InvalidAmount(format!("{} must be positive", value)));
    }
    if amount.normalize().scale() > decimals {
        return Err(CustodyError::InvalidAmount(format!("{} has more than {} decimals", value, decimals)));
    }
    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn converts_usdt() {
        assert_eq!(from_base_units(10_500_000, USDT_DECIMALS).unwrap(), Decimal::from_str("10.5").unwrap());
        assert_eq!(to_base_units(Decimal::from_str("10.5").unwrap(), USDT_DECIMALS).unwrap(), 10_500_000);
        assert_eq!(to_base_units(Decimal::from_str("0.0000019").unwrap(), USDT_DECIMALS).unwrap(), 1);
    }

    #[test]
    fn rejects_negative() {
        assert!(to_base_units(Decimal::from(-1), USDT_DECIMALS).is_err());
    }

    #[test]
    fn raw_amounts() {
        assert_eq!(parse_raw_amount("1000000").unwrap(), 1_000_000);
        assert_eq!(parse_raw_amount("0x0f4240").unwrap(), 1_000_000);
        assert!(parse_raw_amount("ten").is_err());
    }

    #[test]
    fn amount_precision() {
        assert!(parse_amount("1.123456", USDT_DECIMALS).is_ok());
        assert!(parse_amount("1.1234567", USDT_DECIMALS).is_err());
        assert!(parse_amount("0", USDT_DECIMALS).is_err());
    }
}
