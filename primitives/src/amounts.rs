//! Integer amount and slippage arithmetic.
//!
//! All cross-component arithmetic happens in 18-decimal canonical units;
//! conversion to an asset's native decimals happens only at adapter
//! boundaries. Slippage rates are decibasis-points (`Dbps`, 10^7 scale).
//! There is deliberately no floating point in this module.

use thiserror::Error;

use crate::{Amount, Dbps, U256};

/// The canonical decimal scale.
pub const EIGHTEEN_DECIMALS: u8 = 18;

/// 100% expressed in decibasis-points.
pub const DBPS_SCALE: u64 = 10_000_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
	#[error("amount {amount} does not cover the fee {fee}")]
	AmountBelowFee { amount: Amount, fee: Amount },
	#[error("slippage {0} dBps leaves no headroom")]
	SlippageTooHigh(Dbps),
}

pub fn pow10(exp: u8) -> U256 {
	U256::from(10u8).pow(U256::from(exp))
}

/// Converts a canonical 18-decimal amount to the asset's native decimals,
/// truncating towards zero where `decimals < 18`.
pub fn to_native(amount: Amount, decimals: u8) -> U256 {
	if decimals < EIGHTEEN_DECIMALS {
		amount / pow10(EIGHTEEN_DECIMALS - decimals)
	} else if decimals > EIGHTEEN_DECIMALS {
		amount * pow10(decimals - EIGHTEEN_DECIMALS)
	} else {
		amount
	}
}

/// Converts a native-decimal amount to canonical 18 decimals, truncating
/// towards zero where `decimals > 18` (never observed on supported assets,
/// but defined).
pub fn to_eighteen(native: U256, decimals: u8) -> Amount {
	if decimals < EIGHTEEN_DECIMALS {
		native * pow10(EIGHTEEN_DECIMALS - decimals)
	} else if decimals > EIGHTEEN_DECIMALS {
		native / pow10(decimals - EIGHTEEN_DECIMALS)
	} else {
		native
	}
}

/// Deducts a flat fee. The remainder must be strictly positive.
pub fn apply_fee(amount: Amount, fee: Amount) -> Result<Amount, AmountError> {
	if amount <= fee {
		return Err(AmountError::AmountBelowFee { amount, fee })
	}
	Ok(amount - fee)
}

/// Observed slippage of a transfer in decibasis-points.
///
/// A received amount at or above the sent amount is zero slippage.
pub fn slippage_dbps(sent: U256, received: U256) -> Dbps {
	if sent.is_zero() || received >= sent {
		return 0
	}
	// (sent - received) / sent <= 1, so the result always fits in a u32.
	((sent - received) * U256::from(DBPS_SCALE) / sent).as_u32()
}

/// The smallest amount acceptable after applying a slippage budget.
pub fn min_acceptable(amount: Amount, budget: Dbps) -> Amount {
	amount - amount * U256::from(budget) / U256::from(DBPS_SCALE)
}

/// Grosses an amount up so that, after `budget` dBps of slippage, at least
/// the original amount arrives: `amount * 1e7 / (1e7 - budget)`.
pub fn gross_up_for_slippage(amount: Amount, budget: Dbps) -> Result<Amount, AmountError> {
	if u64::from(budget) >= DBPS_SCALE {
		return Err(AmountError::SlippageTooHigh(budget))
	}
	Ok(amount * U256::from(DBPS_SCALE) / U256::from(DBPS_SCALE - u64::from(budget)))
}

/// Truncates an 18-decimal amount to the number of fractional digits a CEX
/// withdrawal API accepts. Truncation is towards zero, so the rounded value
/// is never greater than the input. Precision beyond the asset's own
/// decimals carries no information and is clamped.
pub fn round_to_precision(amount: Amount, decimals: u8, precision: u8) -> Amount {
	let kept_digits = precision.min(decimals).min(EIGHTEEN_DECIMALS);
	let modulus = pow10(EIGHTEEN_DECIMALS - kept_digits);
	amount - amount % modulus
}
