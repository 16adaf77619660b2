//! Core types and data structures for the ledger

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::reconciliation::ExceptionStatus;

/// Amount in integer minor currency units (cents for USD)
pub type MinorUnits = i64;

/// Account types following standard accounting principles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountType {
    /// Assets - cash, clearing accounts, receivables
    Asset,
    /// Liabilities - customer balances, payables
    Liability,
    /// Equity - owner's interest in the business
    Equity,
    /// Income/Revenue - money earned by the business
    Income,
    /// Expenses - processor fees, return fees, chargeback losses
    Expense,
}

impl AccountType {
    /// Returns the normal balance type for this account type
    /// Assets and Expenses normally have debit balances
    /// Liabilities, Equity, and Income normally have credit balances
    pub fn normal_balance(&self) -> EntryType {
        match self {
            AccountType::Asset | AccountType::Expense => EntryType::Debit,
            AccountType::Liability | AccountType::Equity | AccountType::Income => EntryType::Credit,
        }
    }
}

/// Side of a journal line in double-entry bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryType {
    Debit,
    Credit,
}

impl EntryType {
    /// The opposite side, used when reversing an entry
    pub fn opposite(self) -> Self {
        match self {
            EntryType::Debit => EntryType::Credit,
            EntryType::Credit => EntryType::Debit,
        }
    }
}

/// Chart of accounts entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Internal identifier referenced by journal lines
    pub id: String,
    /// Chart code, e.g. "1150"
    pub code: String,
    pub name: String,
    pub account_type: AccountType,
}

impl Account {
    pub fn new(id: &str, code: &str, name: &str, account_type: AccountType) -> Self {
        Self {
            id: id.to_string(),
            code: code.to_string(),
            name: name.to_string(),
            account_type,
        }
    }
}

/// Monotonically increasing journal entry identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JE-{:06}", self.0)
    }
}

/// Lifecycle of a journal entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Preview output, never persisted
    Draft,
    /// Accepted for posting, not yet committed
    Pending,
    Posted,
    /// Posted and later offset by a linked reversing entry
    Reversed,
}

/// Individual line within a journal entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalLine {
    /// Account being affected
    pub account_id: String,
    /// Debit or credit
    pub entry_type: EntryType,
    /// Non-negative amount in minor units
    pub amount: MinorUnits,
    /// Optional memo for this specific line
    pub memo: Option<String>,
}

impl JournalLine {
    pub fn new(
        account_id: impl Into<String>,
        entry_type: EntryType,
        amount: MinorUnits,
        memo: Option<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            entry_type,
            amount,
            memo,
        }
    }

    /// Create a debit line
    pub fn debit(account_id: impl Into<String>, amount: MinorUnits) -> Self {
        Self::new(account_id, EntryType::Debit, amount, None)
    }

    /// Create a credit line
    pub fn credit(account_id: impl Into<String>, amount: MinorUnits) -> Self {
        Self::new(account_id, EntryType::Credit, amount, None)
    }

    /// Same line on the opposite side
    pub fn swapped(&self) -> Self {
        Self {
            entry_type: self.entry_type.opposite(),
            ..self.clone()
        }
    }

    /// Debits positive, credits negative
    pub fn signed_amount(&self) -> MinorUnits {
        match self.entry_type {
            EntryType::Debit => self.amount,
            EntryType::Credit => -self.amount,
        }
    }
}

fn sum_side(lines: &[JournalLine], side: EntryType) -> MinorUnits {
    lines
        .iter()
        .filter(|l| l.entry_type == side)
        .map(|l| l.amount)
        .sum()
}

/// Check the double-entry invariant over a set of lines
pub fn check_balance(lines: &[JournalLine]) -> LedgerResult<()> {
    let debits = sum_side(lines, EntryType::Debit);
    let credits = sum_side(lines, EntryType::Credit);
    if debits != credits {
        return Err(LedgerError::UnbalancedEntry {
            debits,
            credits,
            imbalance: debits - credits,
        });
    }
    Ok(())
}

/// Journal entry proposed for posting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateEntry {
    pub date: NaiveDate,
    pub description: String,
    /// Origin of the entry (template id, "reversal", "manual", ...)
    pub source: String,
    pub currency: String,
    /// External reference used for exact-reference matching
    pub reference: Option<String>,
    pub lines: Vec<JournalLine>,
}

impl CandidateEntry {
    pub fn new(date: NaiveDate, description: &str, source: &str, currency: &str) -> Self {
        Self {
            date,
            description: description.to_string(),
            source: source.to_string(),
            currency: currency.to_string(),
            reference: None,
            lines: Vec::new(),
        }
    }

    pub fn total_debits(&self) -> MinorUnits {
        sum_side(&self.lines, EntryType::Debit)
    }

    pub fn total_credits(&self) -> MinorUnits {
        sum_side(&self.lines, EntryType::Credit)
    }

    pub fn is_balanced(&self) -> bool {
        self.total_debits() == self.total_credits()
    }

    /// Structural and balance validation
    pub fn validate(&self) -> LedgerResult<()> {
        if self.lines.len() < 2 {
            return Err(LedgerError::Validation(
                "Entry must have at least two lines for double-entry bookkeeping".to_string(),
            ));
        }

        if let Some(line) = self.lines.iter().find(|l| l.amount < 0) {
            return Err(LedgerError::Validation(format!(
                "Line amounts must be non-negative (account {} has {})",
                line.account_id, line.amount
            )));
        }

        if self.total_debits() == 0 {
            return Err(LedgerError::Validation(
                "Entry must move a non-zero amount".to_string(),
            ));
        }

        check_balance(&self.lines)
    }
}

/// A journal entry as persisted in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: EntryId,
    pub date: NaiveDate,
    pub description: String,
    pub source: String,
    pub currency: String,
    pub reference: Option<String>,
    pub status: EntryStatus,
    pub lines: Vec<JournalLine>,
    /// Set on a reversing entry, pointing at the entry it offsets
    pub reverses: Option<EntryId>,
    pub idempotency_key: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
}

impl JournalEntry {
    /// Materialize a candidate with the given id and status
    pub fn from_candidate(id: EntryId, candidate: CandidateEntry, status: EntryStatus) -> Self {
        Self {
            id,
            date: candidate.date,
            description: candidate.description,
            source: candidate.source,
            currency: candidate.currency,
            reference: candidate.reference,
            status,
            lines: candidate.lines,
            reverses: None,
            idempotency_key: None,
            posted_at: None,
        }
    }

    pub fn total_debits(&self) -> MinorUnits {
        sum_side(&self.lines, EntryType::Debit)
    }

    pub fn total_credits(&self) -> MinorUnits {
        sum_side(&self.lines, EntryType::Credit)
    }

    pub fn is_balanced(&self) -> bool {
        self.total_debits() == self.total_credits()
    }

    /// Gross amount moved by the entry
    pub fn amount(&self) -> MinorUnits {
        self.total_debits()
    }

    pub fn is_reversal(&self) -> bool {
        self.reverses.is_some()
    }
}

/// Inclusive date range used for reconciliation runs and queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> LedgerResult<Self> {
        if end < start {
            return Err(LedgerError::Validation(format!(
                "Window end {} is before start {}",
                end, start
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    pub fn overlaps(&self, other: &DateWindow) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Window extended by `days` calendar days on both sides
    pub fn widened(&self, days: i64) -> Self {
        Self {
            start: self.start - Duration::days(days),
            end: self.end + Duration::days(days),
        }
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Balance of every account touched by posted entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialBalance {
    pub as_of_date: NaiveDate,
    /// Signed balance per account id (debits positive)
    pub balances: std::collections::BTreeMap<String, MinorUnits>,
    pub total_debits: MinorUnits,
    pub total_credits: MinorUnits,
    pub is_balanced: bool,
}

/// Errors that can occur in the ledger and reconciliation core
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Unbalanced entry: debits = {debits}, credits = {credits}, imbalance = {imbalance}")]
    UnbalancedEntry {
        debits: MinorUnits,
        credits: MinorUnits,
        imbalance: MinorUnits,
    },
    #[error("No applicable template for transaction type {0}")]
    NoApplicableTemplate(String),
    #[error("Idempotency key '{0}' was already used with a different payload")]
    DuplicateTransaction(String),
    #[error("Account not found: {0}")]
    AccountNotFound(String),
    #[error("Journal entry not found: {0}")]
    EntryNotFound(EntryId),
    #[error("Reconciliation exception not found: {0}")]
    ExceptionNotFound(u64),
    #[error("Invalid exception transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: ExceptionStatus,
        to: ExceptionStatus,
    },
    #[error("Reconciliation window {0} overlaps a running reconciliation")]
    ReconciliationWindowLocked(DateWindow),
    #[error("Return received {elapsed_days} days after settlement; window is {limit_days} days")]
    ReturnWindowExpired { elapsed_days: i64, limit_days: i64 },
    #[error("Gateway call '{operation}' timed out after {attempts} attempts")]
    ExternalGatewayTimeout { operation: String, attempts: u32 },
    #[error("Gateway error: {0}")]
    Gateway(String),
    #[error("Storage error: {0}")]
    Persistence(String),
    #[error("Operation cancelled")]
    Cancelled,
}

impl LedgerError {
    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::ReconciliationWindowLocked(_)
                | LedgerError::ExternalGatewayTimeout { .. }
                | LedgerError::Gateway(_)
        )
    }
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;
