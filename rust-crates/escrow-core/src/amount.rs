use serde::{
    Deserialize,
    Serialize,
};
use std::fmt;

/// Decimal places of the escrow token (USDC).
pub const TOKEN_DECIMALS: u32 = 6;
const ONE_TOKEN: u128 = 10u128.pow(TOKEN_DECIMALS);

/// Token amount in smallest units.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TokenAmount(u128);

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    #[error("amount is empty")]
    Empty,
    #[error("amount is not a decimal number")]
    NotANumber,
    #[error("amount has more than {TOKEN_DECIMALS} decimal places")]
    TooPrecise,
    #[error("amount is too large")]
    Overflow,
}

impl TokenAmount {
    pub const ZERO: Self = Self(0);

    pub const fn from_units(units: u128) -> Self {
        Self(units)
    }

    pub const fn whole_tokens(tokens: u64) -> Self {
        Self(tokens as u128 * ONE_TOKEN)
    }

    pub const fn units(self) -> u128 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Parses human input such as `"100"`, `"12.5"` or `".25"`.
    pub fn parse_decimal(input: &str) -> Result<Self, AmountError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(AmountError::Empty);
        }
        let (whole, fraction) = match input.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (input, ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return Err(AmountError::NotANumber);
        }
        let all_digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
        if !all_digits(whole) || !all_digits(fraction) {
            return Err(AmountError::NotANumber);
        }
        if fraction.len() > TOKEN_DECIMALS as usize {
            return Err(AmountError::TooPrecise);
        }

        let whole_units = if whole.is_empty() {
            0
        } else {
            whole.parse::<u128>().map_err(|_| AmountError::Overflow)?
        };
        let fraction_units = if fraction.is_empty() {
            0
        } else {
            let padded = format!("{fraction:0<width$}", width = TOKEN_DECIMALS as usize);
            padded.parse::<u128>().map_err(|_| AmountError::NotANumber)?
        };
        whole_units
            .checked_mul(ONE_TOKEN)
            .and_then(|units| units.checked_add(fraction_units))
            .map(Self)
            .ok_or(AmountError::Overflow)
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / ONE_TOKEN;
        let fractional = self.0 % ONE_TOKEN;
        if fractional == 0 {
            write!(f, "{whole}")
        } else {
            let digits = format!("{:0width$}", fractional, width = TOKEN_DECIMALS as usize);
            write!(f, "{}.{}", whole, digits.trim_end_matches('0'))
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn parse_decimal__whole_and_fractional_inputs() {
        assert_eq!(
            TokenAmount::parse_decimal("100"),
            Ok(TokenAmount::whole_tokens(100))
        );
        assert_eq!(
            TokenAmount::parse_decimal("12.5"),
            Ok(TokenAmount::from_units(12_500_000))
        );
        assert_eq!(
            TokenAmount::parse_decimal(".25"),
            Ok(TokenAmount::from_units(250_000))
        );
        assert_eq!(
            TokenAmount::parse_decimal("0.000001"),
            Ok(TokenAmount::from_units(1))
        );
    }

    #[test]
    fn parse_decimal__rejects_bad_input() {
        assert_eq!(TokenAmount::parse_decimal("  "), Err(AmountError::Empty));
        assert_eq!(TokenAmount::parse_decimal("."), Err(AmountError::NotANumber));
        assert_eq!(TokenAmount::parse_decimal("-5"), Err(AmountError::NotANumber));
        assert_eq!(TokenAmount::parse_decimal("1e3"), Err(AmountError::NotANumber));
        assert_eq!(
            TokenAmount::parse_decimal("0.0000001"),
            Err(AmountError::TooPrecise)
        );
    }

    #[test]
    fn display__trims_trailing_zeros() {
        assert_eq!(TokenAmount::from_units(8_000_000).to_string(), "8");
        assert_eq!(TokenAmount::from_units(8_250_000).to_string(), "8.25");
        assert_eq!(TokenAmount::from_units(1).to_string(), "0.000001");
    }
}
