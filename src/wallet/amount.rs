//! Integer coin amounts
//!
//! Amounts are kept in base units so sums compare exactly; the daemon's
//! decimal JSON numbers are converted at the RPC boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::str::FromStr;

/// Base units per coin
pub const COIN: u64 = 100_000_000;

/// Conventional miner fee (0.0001)
pub const DEFAULT_FEE: Amount = Amount(10_000);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_units(units: u64) -> Self {
        Amount(units)
    }

    pub const fn units(&self) -> u64 {
        self.0
    }

    /// Convert a daemon-reported decimal, rounding to the nearest unit.
    /// Negative, NaN and out-of-range values yield `None`.
    pub fn from_coins(coins: f64) -> Option<Self> {
        if !coins.is_finite() || coins < 0.0 {
            return None;
        }
        let units = (coins * COIN as f64).round();
        if units > u64::MAX as f64 {
            return None;
        }
        Some(Amount(units as u64))
    }

    pub fn to_coins(&self) -> f64 {
        self.0 as f64 / COIN as f64
    }

    pub fn is_zero(&self) -> bool {
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
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        Amount(iter.map(|a| a.0).fold(0u64, u64::saturating_add))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:08}", self.0 / COIN, self.0 % COIN)
    }
}

impl FromStr for Amount {
    type Err = String;

    /// Parse a decimal coin string such as `"1.5"` or `"0.0001"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (whole, frac) = s.split_once('.').unwrap_or((s, ""));

        if whole.is_empty() && frac.is_empty() {
            return Err("empty amount".to_string());
        }
        if frac.len() > 8 {
            return Err(format!("too many decimal places in '{}'", s));
        }
        if !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
            return Err(format!("invalid amount '{}'", s));
        }

        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| format!("invalid amount '{}'", s))?
        };
        let frac_units: u64 = if frac.is_empty() {
            0
        } else {
            format!("{:0<8}", frac)
                .parse()
                .map_err(|_| format!("invalid amount '{}'", s))?
        };

        whole
            .checked_mul(COIN)
            .and_then(|w| w.checked_add(frac_units))
            .map(Amount)
            .ok_or_else(|| format!("amount '{}' out of range", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let amount: Amount = "1.5".parse().unwrap();
        assert_eq!(amount.units(), 150_000_000);
        assert_eq!(amount.to_string(), "1.50000000");

        assert_eq!("0.0001".parse::<Amount>().unwrap(), DEFAULT_FEE);
        assert_eq!(".4".parse::<Amount>().unwrap().units(), 40_000_000);
        assert!("1.000000001".parse::<Amount>().is_err());
        assert!("-1".parse::<Amount>().is_err());
        assert!("abc".parse::<Amount>().is_err());
    }

    #[test]
    fn test_decimal_sum_is_exact() {
        let parts: Vec<Amount> = ["1.0", "0.4", "0.1"].iter().map(|s| s.parse().unwrap()).collect();
        let total: Amount = parts.into_iter().sum();
        assert_eq!(total, "1.5".parse().unwrap());
    }

    #[test]
    fn test_from_coins_rounds() {
        assert_eq!(Amount::from_coins(0.1).unwrap().units(), 10_000_000);
        assert_eq!(Amount::from_coins(1.49).unwrap().units(), 149_000_000);
        assert!(Amount::from_coins(-0.5).is_none());
        assert!(Amount::from_coins(f64::NAN).is_none());
    }
}
