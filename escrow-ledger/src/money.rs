//! Money amounts as integer counts of currency minor units.
//!
//! Balances and transaction amounts never touch floating point. Values that
//! arrive from the outside (CLI arguments, form fields) are parsed through
//! `rust_decimal` and rejected unless they are finite, non-negative and
//! representable in whole minor units.

use crate::{error::LedgerError, LedgerResult};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Minor units per major unit (cents per dollar)
pub const MINOR_PER_MAJOR: u64 = 100;

/// Decimal places carried by a major-unit amount
const MINOR_SCALE: u32 = 2;

/// A non-negative amount of money in minor units
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_minor(minor: u64) -> Self {
        Self(minor)
    }

    /// Whole major units, e.g. `from_major(1000)` is 1000.00
    pub fn from_major(major: u64) -> LedgerResult<Self> {
        major
            .checked_mul(MINOR_PER_MAJOR)
            .map(Self)
            .ok_or_else(|| LedgerError::invalid_amount(format!("{} is out of range", major)))
    }

    pub const fn minor(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    /// Parse a major-unit decimal string such as `"400"` or `"12.50"`
    pub fn parse(input: &str) -> LedgerResult<Self> {
        let trimmed = input.trim();
        let value = Decimal::from_str(trimmed).map_err(|_| {
            LedgerError::invalid_amount(format!("'{}' is not a valid amount", trimmed))
        })?;

        if value.normalize().scale() > MINOR_SCALE {
            return Err(LedgerError::invalid_amount(format!(
                "'{}' has more than {} decimal places",
                trimmed, MINOR_SCALE
            )));
        }

        Self::from_decimal(value)
    }

    fn from_decimal(value: Decimal) -> LedgerResult<Self> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(LedgerError::invalid_amount(format!(
                "Amount cannot be negative: {}",
                value
            )));
        }

        value
            .checked_mul(Decimal::from(MINOR_PER_MAJOR))
            .and_then(|minor| minor.to_u64())
            .map(Self)
            .ok_or_else(|| LedgerError::invalid_amount(format!("{} is out of range", value)))
    }

    /// The amount as a major-unit decimal
    pub fn to_decimal(self) -> Decimal {
        Decimal::from_i128_with_scale(self.0 as i128, MINOR_SCALE)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal())
    }
}

impl FromStr for Amount {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
