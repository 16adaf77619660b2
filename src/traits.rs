//! Traits for storage abstraction and injected capabilities

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditFilter, NewAuditEntry};
use crate::reconciliation::{
    BankSettlementRecord, ExceptionFilter, ExceptionId, ExceptionStatus,
    ExternalTransactionRecord, NewException, ReconciliationException, ReconciliationMatch,
    ReconciliationRun, SettlementLink,
};
use crate::types::*;

/// Entry handed to the store for an atomic commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub idempotency_key: Option<String>,
    pub candidate: CandidateEntry,
    pub reverses: Option<EntryId>,
}

/// Result of an atomic commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// A new entry was written with all of its lines
    Committed(JournalEntry),
    /// The idempotency key was already used; nothing was written
    Existing {
        entry: JournalEntry,
        payload: CandidateEntry,
    },
}

/// Range query over journal entries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryFilter {
    pub window: Option<DateWindow>,
    pub status: Option<EntryStatus>,
    pub account_id: Option<String>,
    pub source: Option<String>,
}

impl EntryFilter {
    pub fn matches(&self, entry: &JournalEntry) -> bool {
        self.window.is_none_or(|w| w.contains(entry.date))
            && self.status.is_none_or(|s| entry.status == s)
            && self
                .account_id
                .as_ref()
                .is_none_or(|a| entry.lines.iter().any(|l| &l.account_id == a))
            && self.source.as_ref().is_none_or(|s| &entry.source == s)
    }
}

/// Storage port for journal_entries and journal_lines
///
/// Implementations must perform each commit as a single transaction: the
/// idempotency lookup, id assignment and the write of the entry with all of
/// its lines either all happen or none do.
#[async_trait]
pub trait LedgerStorage: Send + Sync {
    /// Commit a new Posted entry, or return the entry already stored under the key
    async fn commit_entry(&self, pending: PendingEntry) -> LedgerResult<CommitOutcome>;

    /// Commit a reversing entry and mark `original` as Reversed in the same transaction
    async fn commit_reversal(
        &self,
        original: EntryId,
        reversal: PendingEntry,
    ) -> LedgerResult<CommitOutcome>;

    /// Get an entry by id
    async fn get_entry(&self, id: EntryId) -> LedgerResult<Option<JournalEntry>>;

    /// List entries matching a filter, ordered by id
    async fn list_entries(&self, filter: &EntryFilter) -> LedgerResult<Vec<JournalEntry>>;
}

/// Storage port for reconciliation runs, matches and exceptions
#[async_trait]
pub trait ReconciliationStorage: Send + Sync {
    /// Insert a new run unless an unfinished run covers an overlapping window
    ///
    /// The window stays held until the run is saved as Complete or Failed.
    /// Fails with [`LedgerError::ReconciliationWindowLocked`] otherwise.
    async fn begin_run(&self, run: &ReconciliationRun) -> LedgerResult<()>;

    /// Replace a run record
    async fn save_run(&self, run: &ReconciliationRun) -> LedgerResult<()>;

    async fn get_run(&self, run_id: Uuid) -> LedgerResult<Option<ReconciliationRun>>;

    /// Persist every match whose items are all still unmatched, in one step
    ///
    /// Matches that reuse an already matched record or entry are skipped.
    /// Returns the matches that were stored.
    async fn save_matches(
        &self,
        matches: &[ReconciliationMatch],
    ) -> LedgerResult<Vec<ReconciliationMatch>>;

    /// Attach a bank record to a stored match that has none
    ///
    /// Fails with a validation error if the match already carries a bank
    /// record or the bank record belongs to another match.
    async fn attach_bank(&self, link: &SettlementLink) -> LedgerResult<ReconciliationMatch>;

    /// List matches, optionally restricted to one run
    async fn list_matches(&self, run_id: Option<Uuid>) -> LedgerResult<Vec<ReconciliationMatch>>;

    /// Insert a new exception with status Open and a generated id
    async fn insert_exception(&self, new: NewException) -> LedgerResult<ReconciliationException>;

    async fn get_exception(&self, id: ExceptionId) -> LedgerResult<Option<ReconciliationException>>;

    /// Replace an exception if its stored status still equals `expected`
    async fn update_exception(
        &self,
        expected: ExceptionStatus,
        updated: &ReconciliationException,
    ) -> LedgerResult<()>;

    async fn list_exceptions(
        &self,
        filter: &ExceptionFilter,
    ) -> LedgerResult<Vec<ReconciliationException>>;
}

/// Storage port for the append-only audit log
#[async_trait]
pub trait AuditStorage: Send + Sync {
    /// Append an entry; the store assigns id and timestamp
    async fn append_audit(&self, entry: NewAuditEntry) -> LedgerResult<AuditEntry>;

    /// Query entries in append order
    async fn query_audit(&self, filter: &AuditFilter) -> LedgerResult<Vec<AuditEntry>>;
}

/// Everything the engine needs from a persistent backend
pub trait Store: LedgerStorage + ReconciliationStorage + AuditStorage + Clone + 'static {}

impl<T> Store for T where
    T: LedgerStorage + ReconciliationStorage + AuditStorage + Clone + 'static
{
}

/// One page of processor records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionPage {
    pub records: Vec<ExternalTransactionRecord>,
    pub next_cursor: Option<String>,
}

/// Payment processor feed
#[async_trait]
pub trait PaymentProcessorGateway: Send + Sync {
    async fn fetch_transactions(
        &self,
        since: DateTime<Utc>,
        cursor: Option<String>,
    ) -> LedgerResult<TransactionPage>;
}

/// Bank settlement feed
#[async_trait]
pub trait BankFeedGateway: Send + Sync {
    async fn fetch_settlements(&self, window: DateWindow)
        -> LedgerResult<Vec<BankSettlementRecord>>;
}

/// Chart of accounts lookup
pub trait ChartOfAccounts: Send + Sync {
    /// Resolve a chart code to the account id used on journal lines
    fn resolve_account_id(&self, code: &str) -> LedgerResult<String>;

    /// Get an account by id
    fn get_account(&self, account_id: &str) -> Option<Account>;
}

/// Trait for implementing custom entry validation rules
pub trait EntryValidator: Send + Sync {
    /// Validate a candidate before posting
    fn validate_entry(&self, candidate: &CandidateEntry) -> LedgerResult<()>;
}

/// Default validator with basic double-entry rules
pub struct DefaultEntryValidator;

impl EntryValidator for DefaultEntryValidator {
    fn validate_entry(&self, candidate: &CandidateEntry) -> LedgerResult<()> {
        candidate.validate()
    }
}
