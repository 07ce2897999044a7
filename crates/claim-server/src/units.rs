//! Conversion between human-readable token amounts and minor units.

use crate::error::{ClaimError, ClaimResult};
use alloy::primitives::{
    utils::{format_units, parse_units},
    U256,
};
use std::str::FromStr;

/// Parse a strictly positive decimal amount (e.g. `"12.5"`) into minor units.
///
/// Rejects signs, exponents, empty parts and more fractional digits than `decimals`.
pub fn parse_amount(amount: &str, decimals: u8) -> ClaimResult<U256> {
    let amount = amount.trim();
    let invalid = || ClaimError::InvalidAmount(amount.to_string());

    let (whole, fraction) = match amount.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (amount, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    if amount.ends_with('.') || fraction.len() > decimals as usize {
        return Err(invalid());
    }

    let normalized = if whole.is_empty() {
        format!("0{}", amount)
    } else {
        amount.to_string()
    };
    let minor = parse_units(&normalized, decimals)
        .map_err(|_| invalid())?
        .get_absolute();

    if minor.is_zero() {
        return Err(invalid());
    }
    Ok(minor)
}

/// Render minor units as a decimal string without trailing zeros (`"150"`, `"0.5"`).
pub fn format_amount(minor: U256, decimals: u8) -> String {
    let formatted = match format_units(minor, decimals) {
        Ok(formatted) => formatted,
        Err(_) => return minor.to_string(),
    };
    if formatted.contains('.') {
        formatted
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string()
    } else {
        formatted
    }
}

/// Parse a stored decimal-string minor-unit amount.
pub fn parse_minor(stored: &str) -> ClaimResult<U256> {
    U256::from_str(stored)
        .map_err(|e| ClaimError::Storage(format!("Corrupt stored amount {:?}: {}", stored, e)))
}

/// Wei to gwei for logs.
pub fn wei_to_gwei(wei: u128) -> String {
    format_amount(U256::from(wei), 9)
}
