use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::{CustodyError, Result};

/// Satoshis per bitcoin
pub const SATS_PER_BTC: u64 = 100_000_000;

/// Ledger amounts carry at most this many decimal places
pub const BTC_DECIMALS: u32 = 8;

/// Ensure a ledger amount is positive and representable in satoshis.
pub fn validate_amount(amount: Decimal) -> Result<Decimal> {
    if amount <= Decimal::ZERO {
        return Err(CustodyError::InvalidInput(format!(
            "amount must be positive, got {amount}"
        )));
    }
    if amount.normalize().scale() > BTC_DECIMALS {
        return Err(CustodyError::InvalidInput(format!(
            "amount {amount} has more than {BTC_DECIMALS} decimal places"
        )));
    }
    Ok(amount)
}

/// Convert a BTC amount into satoshis, rejecting fractional satoshis.
pub fn btc_to_sats(amount: Decimal) -> Result<u64> {
    let sats = amount
        .checked_mul(Decimal::from(SATS_PER_BTC))
        .ok_or_else(|| CustodyError::InvalidInput(format!("amount {amount} overflows")))?;

    if !sats.fract().is_zero() {
        return Err(CustodyError::InvalidInput(format!(
            "amount {amount} is not a whole number of satoshis"
        )));
    }

    sats.to_u64()
        .ok_or_else(|| CustodyError::InvalidInput(format!("amount {amount} out of range")))
}

/// Convert satoshis into a BTC amount with 8 decimal places.
pub fn sats_to_btc(sats: u64) -> Decimal {
    Decimal::from_i128_with_scale(sats as i128, BTC_DECIMALS)
}
