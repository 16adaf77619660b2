//! Validation utilities

use std::collections::HashSet;

use crate::traits::*;
use crate::types::*;

/// Validate that an account ID is well formed
pub fn validate_account_id(account_id: &str) -> LedgerResult<()> {
    if account_id.trim().is_empty() {
        return Err(LedgerError::Validation(
            "Account ID cannot be empty".to_string(),
        ));
    }

    if account_id.len() > 50 {
        return Err(LedgerError::Validation(
            "Account ID cannot exceed 50 characters".to_string(),
        ));
    }

    if !account_id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(LedgerError::Validation(
            "Account ID can only contain alphanumeric characters, dashes, and underscores"
                .to_string(),
        ));
    }

    Ok(())
}

/// Validate an entry description
pub fn validate_description(description: &str) -> LedgerResult<()> {
    if description.trim().is_empty() {
        return Err(LedgerError::Validation(
            "Entry description cannot be empty".to_string(),
        ));
    }

    if description.len() > 500 {
        return Err(LedgerError::Validation(
            "Entry description cannot exceed 500 characters".to_string(),
        ));
    }

    Ok(())
}

/// Validate a caller-supplied idempotency key
pub fn validate_idempotency_key(key: &str) -> LedgerResult<()> {
    if key.trim().is_empty() {
        return Err(LedgerError::Validation(
            "Idempotency key cannot be empty".to_string(),
        ));
    }

    if key.len() > 128 {
        return Err(LedgerError::Validation(
            "Idempotency key cannot exceed 128 characters".to_string(),
        ));
    }

    if key.chars().any(char::is_whitespace) {
        return Err(LedgerError::Validation(
            "Idempotency key cannot contain whitespace".to_string(),
        ));
    }

    Ok(())
}

/// Validate an ISO-4217 style currency code
pub fn validate_currency(currency: &str) -> LedgerResult<()> {
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(LedgerError::Validation(format!(
            "Currency '{}' must be a three-letter uppercase code",
            currency
        )));
    }
    Ok(())
}

/// Validator with description, account id and duplicate-line checks
pub struct EnhancedEntryValidator;

impl EntryValidator for EnhancedEntryValidator {
    fn validate_entry(&self, candidate: &CandidateEntry) -> LedgerResult<()> {
        validate_description(&candidate.description)?;
        validate_currency(&candidate.currency)?;

        for line in &candidate.lines {
            validate_account_id(&line.account_id)?;
        }

        // the same account cannot appear twice on the same side
        let mut seen = HashSet::new();
        for line in &candidate.lines {
            if !seen.insert((&line.account_id, line.entry_type)) {
                return Err(LedgerError::Validation(format!(
                    "Account '{}' appears multiple times with the same entry type",
                    line.account_id
                )));
            }
        }

        candidate.validate()
    }
}
