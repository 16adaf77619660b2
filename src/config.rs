//! Engine configuration
//!
//! Every section has defaults, so an empty JSON object is a valid
//! configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{LedgerError, LedgerResult};

/// Top-level configuration for [`crate::SettlementEngine`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub reconciliation: ReconciliationConfig,
    pub scoring: ScoringConfig,
    pub retry: RetryPolicy,
    pub accounts: AccountCodes,
}

impl EngineConfig {
    /// Parse and validate a JSON configuration document
    pub fn from_json_str(json: &str) -> LedgerResult<Self> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| LedgerError::Validation(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> LedgerResult<()> {
        self.reconciliation.validate()?;
        self.scoring.validate()?;
        self.retry.validate()
    }
}

/// Matching tolerances and return handling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Business days for a `date_proximity` match (settlement T+2)
    pub close_date_tolerance_days: u32,
    /// Business days beyond which no candidate is considered
    pub wide_date_tolerance_days: u32,
    /// Calendar days after settlement during which a return is auto-corrected
    pub return_window_days: i64,
    /// Raise MISSING_BANK_RECORD for processor records matched only to the ledger
    pub require_bank_settlement: bool,
    /// Currency of bank feed amounts; other currencies never pair with a bank record
    pub base_currency: String,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            close_date_tolerance_days: 2,
            wide_date_tolerance_days: 5,
            return_window_days: 60,
            require_bank_settlement: true,
            base_currency: "USD".to_string(),
        }
    }
}

impl ReconciliationConfig {
    fn validate(&self) -> LedgerResult<()> {
        if self.wide_date_tolerance_days < self.close_date_tolerance_days {
            return Err(LedgerError::Validation(format!(
                "wide date tolerance ({}) must not be below close tolerance ({})",
                self.wide_date_tolerance_days, self.close_date_tolerance_days
            )));
        }
        if self.return_window_days <= 0 {
            return Err(LedgerError::Validation(
                "return window must be positive".to_string(),
            ));
        }
        if self.base_currency.trim().is_empty() {
            return Err(LedgerError::Validation(
                "base currency cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Confidence scores (0-100) assigned to each kind of candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub exact_reference: u8,
    pub date_proximity: u8,
    pub wide_date: u8,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            exact_reference: 100,
            date_proximity: 90,
            wide_date: 60,
        }
    }
}

impl ScoringConfig {
    fn validate(&self) -> LedgerResult<()> {
        if !(self.exact_reference > self.date_proximity && self.date_proximity > self.wide_date) {
            return Err(LedgerError::Validation(
                "scores must satisfy exact_reference > date_proximity > wide_date".to_string(),
            ));
        }
        if self.exact_reference > 100 {
            return Err(LedgerError::Validation(
                "scores cannot exceed 100".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retry behaviour for gateway calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,
    /// Initial backoff delay (milliseconds)
    pub initial_backoff_ms: u64,
    /// Maximum backoff delay (milliseconds)
    pub max_backoff_ms: u64,
    /// Backoff multiplier
    pub multiplier: u32,
    /// Deadline for a single call (milliseconds)
    pub call_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            multiplier: 2,
            call_timeout_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    fn validate(&self) -> LedgerResult<()> {
        if self.max_attempts == 0 {
            return Err(LedgerError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.call_timeout_ms == 0 {
            return Err(LedgerError::Validation(
                "call_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(attempt.saturating_sub(1));
        let delay = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Chart codes used by the built-in journal templates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountCodes {
    pub cash: String,
    pub cash_in_transit: String,
    pub accounts_receivable: String,
    pub customer_refunds: String,
    pub processor_fees: String,
    pub return_fees: String,
    pub chargeback_losses: String,
}

impl Default for AccountCodes {
    fn default() -> Self {
        Self {
            cash: "1000".to_string(),
            cash_in_transit: "1150".to_string(),
            accounts_receivable: "1200".to_string(),
            customer_refunds: "4900".to_string(),
            processor_fees: "6100".to_string(),
            return_fees: "6150".to_string(),
            chargeback_losses: "6200".to_string(),
        }
    }
}
