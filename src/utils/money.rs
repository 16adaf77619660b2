//! Conversion between decimal amounts and integer minor units

use bigdecimal::{BigDecimal, ToPrimitive};
use std::str::FromStr;

use crate::types::*;

/// Minor units per major unit (two-decimal currencies)
pub const MINOR_PER_MAJOR: i64 = 100;

/// Convert a decimal major-unit amount to minor units
///
/// Amounts with more precision than one minor unit are rejected, never rounded.
pub fn to_minor_units(amount: &BigDecimal) -> LedgerResult<MinorUnits> {
    let scaled = amount * BigDecimal::from(MINOR_PER_MAJOR);
    if !scaled.is_integer() {
        return Err(LedgerError::Validation(format!(
            "Amount {} has sub-minor-unit precision",
            amount
        )));
    }
    scaled
        .to_i64()
        .ok_or_else(|| LedgerError::Validation(format!("Amount {} is out of range", amount)))
}

/// Parse a decimal string such as "1500.00" into minor units
pub fn parse_amount(text: &str) -> LedgerResult<MinorUnits> {
    let amount = BigDecimal::from_str(text.trim())
        .map_err(|e| LedgerError::Validation(format!("Invalid amount '{}': {}", text, e)))?;
    to_minor_units(&amount)
}

/// Render minor units as a two-decimal string
pub fn format_minor_units(amount: MinorUnits) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    let per = MINOR_PER_MAJOR as u64;
    format!("{}{}.{:02}", sign, abs / per, abs % per)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("1500.00").unwrap(), 150_000);
        assert_eq!(parse_amount("250").unwrap(), 25_000);
        assert_eq!(parse_amount(" 0.07 ").unwrap(), 7);
        assert_eq!(parse_amount("-12.5").unwrap(), -1_250);
    }

    #[test]
    fn test_sub_cent_amounts_are_rejected() {
        assert!(matches!(
            parse_amount("10.005"),
            Err(LedgerError::Validation(_))
        ));
        assert!(parse_amount("abc").is_err());
    }

    #[test]
    fn test_format() {
        assert_eq!(format_minor_units(150_000), "1500.00");
        assert_eq!(format_minor_units(7), "0.07");
        assert_eq!(format_minor_units(-1_250), "-12.50");
    }
}
