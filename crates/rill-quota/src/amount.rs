//! Token quantity in base units.
//!
//! [`Amount`] is the single representation used by the policy, the store and
//! the wire format. On the wire it is always a string of base units so that
//! values above 2^53 survive JSON clients; human-facing decimal strings are
//! produced and parsed only at the edges via [`Amount::from_decimal_str`] and
//! [`Amount::to_decimal_string`].

use std::fmt;
use std::iter::Sum;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::AmountError;

/// A non-negative token quantity in base units.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, bincode::Encode, bincode::Decode,
)]
pub struct Amount(u128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_base_units(units: u128) -> Self {
        Self(units)
    }

    pub const fn base_units(self) -> u128 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn checked_sub(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_sub(rhs.0).map(Amount)
    }

    pub fn saturating_add(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_add(rhs.0))
    }

    pub fn saturating_sub(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_sub(rhs.0))
    }

    pub fn saturating_mul(self, factor: u128) -> Amount {
        Amount(self.0.saturating_mul(factor))
    }

    /// Parse a human decimal string such as `"12.5"` with `decimals`
    /// fractional places into base units.
    pub fn from_decimal_str(s: &str, decimals: u32) -> Result<Amount, AmountError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AmountError::Empty);
        }
        let (int_part, frac_part) = match s.split_once('.') {
            Some((i, f)) => (i, f),
            None => (s, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(AmountError::Empty);
        }
        if let Some(c) = int_part
            .chars()
            .chain(frac_part.chars())
            .find(|c| !c.is_ascii_digit())
        {
            return Err(AmountError::InvalidCharacter(c));
        }
        let frac_len = frac_part.len() as u32;
        if frac_len > decimals {
            return Err(AmountError::TooManyDecimals { max: decimals });
        }

        let scale = 10u128.checked_pow(decimals).ok_or(AmountError::Overflow)?;
        let int_value = parse_digits(int_part)?;
        let frac_value = parse_digits(frac_part)?;
        let frac_scale = 10u128
            .checked_pow(decimals - frac_len)
            .ok_or(AmountError::Overflow)?;

        int_value
            .checked_mul(scale)
            .and_then(|v| frac_value.checked_mul(frac_scale).and_then(|f| v.checked_add(f)))
            .map(Amount)
            .ok_or(AmountError::Overflow)
    }

    /// Render as a human decimal string with trailing fractional zeros trimmed.
    pub fn to_decimal_string(self, decimals: u32) -> String {
        let Some(scale) = 10u128.checked_pow(decimals) else {
            return self.0.to_string();
        };
        let whole = self.0 / scale;
        let frac = self.0 % scale;
        if frac == 0 {
            return whole.to_string();
        }
        let frac = format!("{frac:0width$}", width = decimals as usize);
        format!("{whole}.{}", frac.trim_end_matches('0'))
    }
}

fn parse_digits(digits: &str) -> Result<u128, AmountError> {
    digits.bytes().try_fold(0u128, |acc, b| {
        acc.checked_mul(10)
            .and_then(|v| v.checked_add(u128::from(b - b'0')))
            .ok_or(AmountError::Overflow)
    })
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    /// Parse a plain base-unit integer string (the transport representation).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AmountError::Empty);
        }
        if let Some(c) = s.chars().find(|c| !c.is_ascii_digit()) {
            return Err(AmountError::InvalidCharacter(c));
        }
        parse_digits(s).map(Amount)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, Amount::saturating_add)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AmountVisitor;

        impl Visitor<'_> for AmountVisitor {
            type Value = Amount;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string of base units")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_str(AmountVisitor)
    }
}
