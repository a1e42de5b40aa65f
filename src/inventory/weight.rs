//! Fixed-point decimal weights.
//!
//! Weights are stored as an integer count of `1e-9` units so the multiplier
//! search can compare rounding errors exactly.

use std::fmt;
use std::str::FromStr;

/// Number of weight units in `1.0`.
pub const WEIGHT_SCALE: u64 = 1_000_000_000;

/// Maximum number of fractional digits accepted when parsing a weight.
pub const WEIGHT_DIGITS: usize = 9;

/// Non-negative decimal test weight with nine fractional digits
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Weight(u64);

impl Weight {
    pub const ZERO: Weight = Weight(0);
    pub const ONE: Weight = Weight(WEIGHT_SCALE);

    /// Build a weight from raw `1e-9` units
    pub const fn from_units(units: u64) -> Self {
        Self(units)
    }

    /// Raw `1e-9` units
    pub const fn units(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Default for Weight {
    fn default() -> Self {
        Self::ONE
    }
}

impl fmt::Display for Weight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / WEIGHT_SCALE;
        let frac = self.0 % WEIGHT_SCALE;
        if frac == 0 {
            return write!(f, "{whole}");
        }
        let digits = format!("{frac:09}");
        write!(f, "{whole}.{}", digits.trim_end_matches('0'))
    }
}

/// Weight parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseWeightError {
    #[error("weight is empty")]
    Empty,

    #[error("weight must not be negative")]
    Negative,

    #[error("weight is not a decimal number")]
    NotANumber,

    #[error("weight has more than {WEIGHT_DIGITS} fractional digits")]
    TooPrecise,

    #[error("weight is too large")]
    TooLarge,
}

impl FromStr for Weight {
    type Err = ParseWeightError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseWeightError::Empty);
        }
        if s.starts_with('-') {
            return Err(ParseWeightError::Negative);
        }
        let s = s.strip_prefix('+').unwrap_or(s);

        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(ParseWeightError::NotANumber);
        }
        if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(ParseWeightError::NotANumber);
        }

        // Trailing zeros carry no precision
        let frac = frac.trim_end_matches('0');
        if frac.len() > WEIGHT_DIGITS {
            return Err(ParseWeightError::TooPrecise);
        }

        let whole_units = if whole.is_empty() {
            0
        } else {
            whole
                .parse::<u64>()
                .map_err(|_| ParseWeightError::TooLarge)?
                .checked_mul(WEIGHT_SCALE)
                .ok_or(ParseWeightError::TooLarge)?
        };

        let frac_units = if frac.is_empty() {
            0
        } else {
            let padded = format!("{frac:0<width$}", width = WEIGHT_DIGITS);
            padded.parse::<u64>().map_err(|_| ParseWeightError::NotANumber)?
        };

        whole_units
            .checked_add(frac_units)
            .map(Weight)
            .ok_or(ParseWeightError::TooLarge)
    }
}

impl TryFrom<f64> for Weight {
    type Error = ParseWeightError;

    /// Converts via the shortest decimal text of the float, so `0.1` becomes
    /// exactly one tenth rather than its binary approximation.
    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() {
            return Err(ParseWeightError::NotANumber);
        }
        if value < 0.0 {
            return Err(ParseWeightError::Negative);
        }
        value.to_string().parse()
    }
}
