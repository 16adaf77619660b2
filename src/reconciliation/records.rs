//! External records, matches, exceptions and run bookkeeping

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::types::*;

/// Generated id of a reconciliation exception
pub type ExceptionId = u64;

/// Status reported by the payment processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalStatus {
    Succeeded,
    Pending,
    Failed,
    /// Return notice for an earlier payment
    Returned,
}

/// Transaction as reported by the payment processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalTransactionRecord {
    pub processor_reference_id: String,
    pub amount: MinorUnits,
    pub currency: String,
    pub timestamp: DateTime<Utc>,
    pub status: ExternalStatus,
    /// Free-text reference, e.g. the merchant order id
    pub reference: String,
    /// ACH return code (R01, R02, ...) for return notices
    pub return_code: Option<String>,
    /// Processor reference of the payment being returned
    pub original_reference_id: Option<String>,
    /// Fee charged by the bank for the return
    pub return_fee: Option<MinorUnits>,
}

impl ExternalTransactionRecord {
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    pub fn is_return_notice(&self) -> bool {
        self.status == ExternalStatus::Returned && self.return_code.is_some()
    }

    /// Boundary validation before the record enters matching
    pub fn validate(&self) -> LedgerResult<()> {
        if self.processor_reference_id.trim().is_empty() {
            return Err(LedgerError::Validation(
                "processor reference id cannot be empty".to_string(),
            ));
        }
        if self.amount < 0 {
            return Err(LedgerError::Validation(format!(
                "processor record {} has negative amount",
                self.processor_reference_id
            )));
        }
        if self.is_return_notice() && self.original_reference_id.is_none() {
            return Err(LedgerError::Validation(format!(
                "return notice {} does not reference the original payment",
                self.processor_reference_id
            )));
        }
        if self.return_fee.is_some_and(|fee| fee < 0) {
            return Err(LedgerError::Validation(format!(
                "return notice {} has a negative fee",
                self.processor_reference_id
            )));
        }
        Ok(())
    }
}

/// Settlement line from the bank feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankSettlementRecord {
    pub bank_reference_id: String,
    pub amount: MinorUnits,
    pub settlement_date: NaiveDate,
    pub reference: String,
}

impl BankSettlementRecord {
    pub fn validate(&self) -> LedgerResult<()> {
        if self.bank_reference_id.trim().is_empty() {
            return Err(LedgerError::Validation(
                "bank reference id cannot be empty".to_string(),
            ));
        }
        if self.amount < 0 {
            return Err(LedgerError::Validation(format!(
                "bank record {} has negative amount",
                self.bank_reference_id
            )));
        }
        Ok(())
    }
}

/// How a match was established, strongest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    ExactReference,
    DateProximity,
    WideDate,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::ExactReference => "exact_reference",
            MatchType::DateProximity => "date_proximity",
            MatchType::WideDate => "wide_date",
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Link between one processor record and its bank / ledger counterparts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationMatch {
    pub id: Uuid,
    pub run_id: Uuid,
    pub external_id: String,
    /// Free-text reference of the processor record
    #[serde(default)]
    pub reference: String,
    pub bank_reference_id: Option<String>,
    pub entry_id: Option<EntryId>,
    pub amount: MinorUnits,
    /// Bank settlement date, or the processor date when no bank record matched
    pub settled_on: NaiveDate,
    /// Weakest link type among the matched counterparts
    pub match_type: MatchType,
    /// Confidence score 0-100
    pub confidence: u8,
    pub matched_at: DateTime<Utc>,
}

/// Why an item could not be reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExceptionReason {
    MissingLedgerEntry,
    MissingBankRecord,
    AmountMismatch,
    DuplicateRecord,
    ReturnWindowExpired,
    UnmatchedReturn,
    GatewayUnavailable,
}

/// Reference to an item involved in an exception
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ItemRef {
    External(String),
    Bank(String),
    Entry(EntryId),
    /// A gateway feed position that could not be loaded
    Feed(String),
}

/// Exception lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExceptionStatus {
    Open,
    UnderReview,
    Resolved,
    WrittenOff,
}

impl ExceptionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExceptionStatus::Resolved | ExceptionStatus::WrittenOff)
    }

    /// Allowed lifecycle moves
    pub fn can_transition_to(&self, next: ExceptionStatus) -> bool {
        matches!(
            (self, next),
            (ExceptionStatus::Open, ExceptionStatus::UnderReview)
                | (ExceptionStatus::UnderReview, ExceptionStatus::Resolved)
                | (ExceptionStatus::UnderReview, ExceptionStatus::WrittenOff)
        )
    }
}

/// How an exception was closed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resolution {
    CorrectiveEntry { entry_id: EntryId },
    /// The missing bank record arrived and was linked to the match
    BankSettlement { bank_reference_id: String },
    WriteOff { justification: String },
}

impl Resolution {
    pub fn target_status(&self) -> ExceptionStatus {
        match self {
            Resolution::CorrectiveEntry { .. } | Resolution::BankSettlement { .. } => {
                ExceptionStatus::Resolved
            }
            Resolution::WriteOff { .. } => ExceptionStatus::WrittenOff,
        }
    }
}

/// Discrepancy awaiting operator attention
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationException {
    pub id: ExceptionId,
    pub run_id: Option<Uuid>,
    pub reason: ExceptionReason,
    pub items: Vec<ItemRef>,
    pub detail: String,
    pub amount: Option<MinorUnits>,
    pub status: ExceptionStatus,
    pub assigned_to: Option<String>,
    pub resolution: Option<Resolution>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReconciliationException {
    pub fn references(&self, item: &ItemRef) -> bool {
        self.items.contains(item)
    }
}

/// Exception as raised, before the store assigns id and timestamps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewException {
    pub run_id: Option<Uuid>,
    pub reason: ExceptionReason,
    pub items: Vec<ItemRef>,
    pub detail: String,
    pub amount: Option<MinorUnits>,
}

impl NewException {
    pub fn new(reason: ExceptionReason, items: Vec<ItemRef>, detail: impl Into<String>) -> Self {
        Self {
            run_id: None,
            reason,
            items,
            detail: detail.into(),
            amount: None,
        }
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_amount(mut self, amount: MinorUnits) -> Self {
        self.amount = Some(amount);
        self
    }
}

/// Exception query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionFilter {
    pub status: Option<ExceptionStatus>,
    pub reason: Option<ExceptionReason>,
    pub item: Option<ItemRef>,
    pub run_id: Option<Uuid>,
    /// Only Open and UnderReview exceptions
    pub unresolved_only: bool,
}

impl ExceptionFilter {
    pub fn matches(&self, exception: &ReconciliationException) -> bool {
        self.status.is_none_or(|s| exception.status == s)
            && self.reason.is_none_or(|r| exception.reason == r)
            && self.item.as_ref().is_none_or(|i| exception.references(i))
            && self.run_id.is_none_or(|r| exception.run_id == Some(r))
            && (!self.unresolved_only || !exception.status.is_terminal())
    }
}

/// Reconciliation run state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Matching,
    Complete,
    Failed,
}

impl RunState {
    /// Complete and Failed runs no longer hold their window
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Complete | RunState::Failed)
    }
}

/// Counters collected during a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub external_loaded: usize,
    pub bank_loaded: usize,
    pub entries_loaded: usize,
    pub matched: usize,
    /// Matches left for a later run because another run claimed an item first
    pub deferred: usize,
    /// Bank records linked to matches stored by an earlier run
    pub late_settlements: usize,
    pub exceptions_raised: usize,
    pub returns_processed: usize,
}

/// Persisted record of a reconciliation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationRun {
    pub id: Uuid,
    pub window: DateWindow,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stats: RunStats,
    pub error: Option<String>,
}

impl ReconciliationRun {
    pub fn new(window: DateWindow) -> Self {
        Self {
            id: Uuid::new_v4(),
            window,
            state: RunState::Pending,
            started_at: Utc::now(),
            finished_at: None,
            stats: RunStats::default(),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_lifecycle_rules() {
        use ExceptionStatus::*;
        assert!(Open.can_transition_to(UnderReview));
        assert!(UnderReview.can_transition_to(Resolved));
        assert!(UnderReview.can_transition_to(WrittenOff));
        assert!(!Open.can_transition_to(Resolved));
        assert!(!Open.can_transition_to(WrittenOff));
        assert!(!Resolved.can_transition_to(UnderReview));
    }

    #[test]
    fn test_reason_serialization() {
        let json = serde_json::to_string(&ExceptionReason::ReturnWindowExpired).unwrap();
        assert_eq!(json, "\"RETURN_WINDOW_EXPIRED\"");
        assert_eq!(MatchType::DateProximity.to_string(), "date_proximity");
    }

    #[test]
    fn test_negative_return_fee_rejected() {
        let notice = ExternalTransactionRecord {
            processor_reference_id: "rt_1".to_string(),
            amount: 1_000,
            currency: "USD".to_string(),
            timestamp: Utc::now(),
            status: ExternalStatus::Returned,
            reference: String::new(),
            return_code: Some("R01".to_string()),
            original_reference_id: Some("py_1".to_string()),
            return_fee: Some(-5),
        };
        assert!(matches!(notice.validate(), Err(LedgerError::Validation(_))));

        let free = ExternalTransactionRecord {
            return_fee: Some(0),
            ..notice
        };
        assert!(free.validate().is_ok());
    }

    #[test]
    fn test_only_finished_runs_release_their_window() {
        assert!(!RunState::Pending.is_terminal());
        assert!(!RunState::Matching.is_terminal());
        assert!(RunState::Complete.is_terminal());
        assert!(RunState::Failed.is_terminal());
    }
}
