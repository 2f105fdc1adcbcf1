//! # Money
//!
//! Exact monetary amounts for both legs of a trade. A [`FiatAmount`] is an
//! integer count of minor units (cents) tagged with its [`Currency`]; a
//! [`BitcoinAmount`] is an integer count of satoshi. There is no floating
//! point anywhere near money, and there is no silent rounding: every
//! operation that can drop value returns the dropped remainder alongside
//! the result (see [`Rounded`]).
//!
//! Mixed-currency arithmetic is a type error at the value level — it
//! returns [`MoneyError::CurrencyMismatch`] instead of producing garbage.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Number of satoshi in one bitcoin.
pub const SATS_PER_BTC: u64 = 100_000_000;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced by monetary arithmetic.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    /// Two amounts in different currencies were combined.
    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch {
        /// Currency of the left operand.
        left: Currency,
        /// Currency of the right operand.
        right: Currency,
    },

    /// The operation overflowed the underlying integer.
    #[error("monetary arithmetic overflow")]
    Overflow,

    /// The subtrahend was larger than the minuend. Balances never go
    /// negative; a debt is modelled explicitly or not at all.
    #[error("monetary arithmetic underflow")]
    Underflow,

    /// An amount was asked to split into zero parts.
    #[error("cannot split an amount into zero parts")]
    ZeroSplit,
}

// ---------------------------------------------------------------------------
// Currency
// ---------------------------------------------------------------------------

/// Fiat currencies the marketplace trades against.
///
/// Each currency carries a fixed decimal scale; all amounts are stored in
/// the smallest unit of that scale. Bitcoin is deliberately *not* a variant
/// here — the two legs of a trade have distinct types so they can never be
/// added to each other by accident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    /// Euro (smallest unit: cent, 10^-2).
    Eur,
    /// United States Dollar (smallest unit: cent, 10^-2).
    Usd,
    /// Pound Sterling (smallest unit: penny, 10^-2).
    Gbp,
}

impl Currency {
    /// Number of decimal places between the major unit and the minor unit.
    pub fn decimals(&self) -> u8 {
        match self {
            Self::Eur | Self::Usd | Self::Gbp => 2,
        }
    }

    /// ISO 4217 code, used on the wire and in display output.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Eur => "EUR",
            Self::Usd => "USD",
            Self::Gbp => "GBP",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

// ---------------------------------------------------------------------------
// FiatAmount
// ---------------------------------------------------------------------------

/// An exact fiat amount: integer minor units plus a currency tag.
///
/// `FiatAmount::new(1050, Currency::Eur)` is €10.50. Amounts are
/// non-negative by construction; subtraction that would go below zero is
/// an [`MoneyError::Underflow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FiatAmount {
    /// Value in minor units (cents for the supported currencies).
    units: u64,
    /// The currency denomination.
    currency: Currency,
}

impl FiatAmount {
    /// Creates an amount from minor units.
    pub fn new(units: u64, currency: Currency) -> Self {
        Self { units, currency }
    }

    /// Creates an amount from whole major units (e.g. whole euros).
    pub fn from_major(major: u64, currency: Currency) -> Self {
        let scale = 10u64.pow(currency.decimals() as u32);
        Self {
            units: major * scale,
            currency,
        }
    }

    /// The zero amount in the given currency.
    pub fn zero(currency: Currency) -> Self {
        Self { units: 0, currency }
    }

    /// Value in minor units.
    pub fn units(&self) -> u64 {
        self.units
    }

    /// The currency tag.
    pub fn currency(&self) -> Currency {
        self.currency
    }

    /// Returns `true` if the amount is zero.
    pub fn is_zero(&self) -> bool {
        self.units == 0
    }

    fn require_same_currency(&self, other: &Self) -> Result<(), MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch {
                left: self.currency,
                right: other.currency,
            });
        }
        Ok(())
    }

    /// Checked addition. Fails on currency mismatch or overflow.
    pub fn checked_add(&self, other: &Self) -> Result<Self, MoneyError> {
        self.require_same_currency(other)?;
        let units = self
            .units
            .checked_add(other.units)
            .ok_or(MoneyError::Overflow)?;
        Ok(Self {
            units,
            currency: self.currency,
        })
    }

    /// Checked subtraction. Fails on currency mismatch or underflow.
    pub fn checked_sub(&self, other: &Self) -> Result<Self, MoneyError> {
        self.require_same_currency(other)?;
        let units = self
            .units
            .checked_sub(other.units)
            .ok_or(MoneyError::Underflow)?;
        Ok(Self {
            units,
            currency: self.currency,
        })
    }

    /// Compares two amounts of the same currency.
    pub fn checked_cmp(&self, other: &Self) -> Result<std::cmp::Ordering, MoneyError> {
        self.require_same_currency(other)?;
        Ok(self.units.cmp(&other.units))
    }

    /// Splits the amount into `parts` step-sized amounts that sum exactly
    /// to the original. The division remainder is distributed one minor
    /// unit at a time over the leading parts, so the split is explicit:
    /// `€10.01 / 2 = [€5.01, €5.00]`.
    pub fn split_even(&self, parts: u32) -> Result<Vec<Self>, MoneyError> {
        if parts == 0 {
            return Err(MoneyError::ZeroSplit);
        }
        let parts64 = parts as u64;
        let base = self.units / parts64;
        let remainder = self.units % parts64;
        Ok((0..parts64)
            .map(|i| Self {
                units: base + u64::from(i < remainder),
                currency: self.currency,
            })
            .collect())
    }

    /// Human-readable decimal rendering, e.g. `"10.50 EUR"`.
    pub fn display_decimal(&self) -> String {
        let decimals = self.currency.decimals() as u32;
        let divisor = 10u64.pow(decimals);
        format!(
            "{}.{:0>width$} {}",
            self.units / divisor,
            self.units % divisor,
            self.currency,
            width = decimals as usize
        )
    }
}

impl fmt::Display for FiatAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_decimal())
    }
}

// ---------------------------------------------------------------------------
// BitcoinAmount
// ---------------------------------------------------------------------------

/// An exact bitcoin amount in satoshi (10^-8 BTC).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct BitcoinAmount(u64);

impl BitcoinAmount {
    /// Creates an amount from satoshi.
    pub fn from_sat(sat: u64) -> Self {
        Self(sat)
    }

    /// Creates an amount from whole bitcoin.
    pub fn from_btc(btc: u64) -> Self {
        Self(btc * SATS_PER_BTC)
    }

    /// The zero amount.
    pub fn zero() -> Self {
        Self(0)
    }

    /// Value in satoshi.
    pub fn as_sat(&self) -> u64 {
        self.0
    }

    /// Returns `true` if the amount is zero.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Checked addition.
    pub fn checked_add(&self, other: Self) -> Result<Self, MoneyError> {
        self.0
            .checked_add(other.0)
            .map(Self)
            .ok_or(MoneyError::Overflow)
    }

    /// Checked subtraction.
    pub fn checked_sub(&self, other: Self) -> Result<Self, MoneyError> {
        self.0
            .checked_sub(other.0)
            .map(Self)
            .ok_or(MoneyError::Underflow)
    }

    /// Splits the amount into `parts` amounts summing exactly to the
    /// original; the remainder goes to the leading parts, same policy as
    /// [`FiatAmount::split_even`].
    pub fn split_even(&self, parts: u32) -> Result<Vec<Self>, MoneyError> {
        if parts == 0 {
            return Err(MoneyError::ZeroSplit);
        }
        let parts64 = parts as u64;
        let base = self.0 / parts64;
        let remainder = self.0 % parts64;
        Ok((0..parts64)
            .map(|i| Self(base + u64::from(i < remainder)))
            .collect())
    }

    /// The completed fraction `completed / total` of this amount, rounded
    /// down to whole satoshi. Used for progress contributions of a
    /// partially completed exchange.
    pub fn scaled(&self, completed: u32, total: u32) -> Self {
        if total == 0 {
            return Self(0);
        }
        let scaled = (self.0 as u128 * completed as u128) / total as u128;
        Self(scaled as u64)
    }
}

impl fmt::Display for BitcoinAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:08} BTC",
            self.0 / SATS_PER_BTC,
            self.0 % SATS_PER_BTC
        )
    }
}

// ---------------------------------------------------------------------------
// Rounded values
// ---------------------------------------------------------------------------

/// A value produced by an operation that had to round, together with the
/// remainder that was dropped. Callers decide what to do with the dust;
/// the point is that they cannot *not* see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rounded<T> {
    /// The rounded-down result.
    pub value: T,
    /// Dropped sub-unit remainder, in the numerator scale of the division
    /// that produced it.
    pub remainder: u64,
}

impl<T> Rounded<T> {
    /// Returns `true` if the operation was in fact exact.
    pub fn is_exact(&self) -> bool {
        self.remainder == 0
    }
}

/// Computes the fiat value of `amount` at `price` (fiat per whole BTC).
///
/// The multiplication is carried out in 128-bit to avoid overflow and the
/// division by [`SATS_PER_BTC`] reports its remainder instead of hiding it.
pub fn fiat_value(
    price: &FiatAmount,
    amount: BitcoinAmount,
) -> Result<Rounded<FiatAmount>, MoneyError> {
    let numerator = price.units() as u128 * amount.as_sat() as u128;
    let value = numerator / SATS_PER_BTC as u128;
    let remainder = numerator % SATS_PER_BTC as u128;
    let units = u64::try_from(value).map_err(|_| MoneyError::Overflow)?;
    Ok(Rounded {
        value: FiatAmount::new(units, price.currency()),
        remainder: remainder as u64,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fiat_addition_same_currency() {
        let a = FiatAmount::new(1050, Currency::Eur);
        let b = FiatAmount::new(250, Currency::Eur);
        assert_eq!(
            a.checked_add(&b).unwrap(),
            FiatAmount::new(1300, Currency::Eur)
        );
    }

    #[test]
    fn fiat_addition_rejects_mixed_currencies() {
        let a = FiatAmount::new(100, Currency::Eur);
        let b = FiatAmount::new(100, Currency::Usd);
        assert_eq!(
            a.checked_add(&b),
            Err(MoneyError::CurrencyMismatch {
                left: Currency::Eur,
                right: Currency::Usd,
            })
        );
    }

    #[test]
    fn fiat_subtraction_underflow() {
        let a = FiatAmount::new(100, Currency::Gbp);
        let b = FiatAmount::new(101, Currency::Gbp);
        assert_eq!(a.checked_sub(&b), Err(MoneyError::Underflow));
    }

    #[test]
    fn fiat_split_distributes_remainder_to_leading_parts() {
        // €10.01 over 2 steps: the odd cent lands on the first step.
        let total = FiatAmount::new(1001, Currency::Eur);
        let parts = total.split_even(2).unwrap();
        assert_eq!(parts[0].units(), 501);
        assert_eq!(parts[1].units(), 500);
        let sum = parts
            .iter()
            .try_fold(FiatAmount::zero(Currency::Eur), |acc, p| {
                acc.checked_add(p)
            })
            .unwrap();
        assert_eq!(sum, total);
    }

    #[test]
    fn fiat_split_zero_parts_rejected() {
        let total = FiatAmount::new(1000, Currency::Eur);
        assert_eq!(total.split_even(0), Err(MoneyError::ZeroSplit));
    }

    #[test]
    fn bitcoin_split_sums_exactly() {
        let total = BitcoinAmount::from_sat(10);
        let parts = total.split_even(3).unwrap();
        assert_eq!(
            parts,
            vec![
                BitcoinAmount::from_sat(4),
                BitcoinAmount::from_sat(3),
                BitcoinAmount::from_sat(3),
            ]
        );
    }

    #[test]
    fn bitcoin_scaled_fraction() {
        let amount = BitcoinAmount::from_btc(10);
        assert_eq!(amount.scaled(5, 10), BitcoinAmount::from_btc(5));
        assert_eq!(amount.scaled(0, 10), BitcoinAmount::zero());
        assert_eq!(amount.scaled(10, 10), amount);
    }

    #[test]
    fn fiat_value_reports_rounding() {
        // 1 sat at 10.00 EUR/BTC: 1000 * 1 / 1e8 rounds to zero cents,
        // with the full numerator surfacing as remainder.
        let price = FiatAmount::from_major(10, Currency::Eur);
        let rounded = fiat_value(&price, BitcoinAmount::from_sat(1)).unwrap();
        assert!(rounded.value.is_zero());
        assert_eq!(rounded.remainder, 1000);
        assert!(!rounded.is_exact());
    }

    #[test]
    fn fiat_value_exact_for_whole_btc() {
        let price = FiatAmount::from_major(10, Currency::Eur);
        let rounded = fiat_value(&price, BitcoinAmount::from_btc(3)).unwrap();
        assert_eq!(rounded.value, FiatAmount::from_major(30, Currency::Eur));
        assert!(rounded.is_exact());
    }

    #[test]
    fn display_formats() {
        assert_eq!(
            FiatAmount::new(1050, Currency::Eur).to_string(),
            "10.50 EUR"
        );
        assert_eq!(
            BitcoinAmount::from_sat(150_000_000).to_string(),
            "1.50000000 BTC"
        );
    }
}
