//! Journal entry posting and reversal

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::audit::{AuditAction, AuditLog};
use crate::traits::*;
use crate::types::*;
use crate::utils::cancel::CancellationSignal;
use crate::utils::validation::{validate_idempotency_key, EnhancedEntryValidator};

/// Actor recorded for operations triggered by the engine itself
pub const SYSTEM_ACTOR: &str = "system";

/// Idempotency key used for the reversal of `original`
pub fn reversal_key(original: EntryId) -> String {
    format!("reversal:{}", original.0)
}

/// One item of a posting batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub idempotency_key: Option<String>,
    pub candidate: CandidateEntry,
}

impl BatchItem {
    pub fn new(idempotency_key: &str, candidate: CandidateEntry) -> Self {
        Self {
            idempotency_key: Some(idempotency_key.to_string()),
            candidate,
        }
    }
}

/// What happened to a single batch item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    Posted,
    /// Key already used with the same payload; the stored entry is returned
    Replayed,
    Failed,
    /// Not attempted because the batch was cancelled
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostResult {
    pub index: usize,
    pub idempotency_key: Option<String>,
    pub status: PostStatus,
    pub entry: Option<JournalEntry>,
    #[serde(skip)]
    pub error: Option<LedgerError>,
}

/// Per-item results plus aggregate counts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub results: Vec<PostResult>,
    pub posted: usize,
    pub replayed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

impl BatchReport {
    fn push(&mut self, result: PostResult) {
        match result.status {
            PostStatus::Posted => self.posted += 1,
            PostStatus::Replayed => self.replayed += 1,
            PostStatus::Failed => self.failed += 1,
            PostStatus::Skipped => self.skipped += 1,
        }
        self.results.push(result);
    }
}

/// Posting service: the only writer of journal entries
#[derive(Clone)]
pub struct PostingService<S: LedgerStorage + AuditStorage> {
    storage: S,
    chart: Arc<dyn ChartOfAccounts>,
    validator: Arc<dyn EntryValidator>,
    audit: AuditLog<S>,
}

impl<S: LedgerStorage + AuditStorage + Clone> PostingService<S> {
    /// Create a posting service with the enhanced validator
    pub fn new(storage: S, chart: Arc<dyn ChartOfAccounts>) -> Self {
        Self::with_validator(storage, chart, Arc::new(EnhancedEntryValidator))
    }

    /// Create a posting service with a custom validator
    pub fn with_validator(
        storage: S,
        chart: Arc<dyn ChartOfAccounts>,
        validator: Arc<dyn EntryValidator>,
    ) -> Self {
        Self {
            audit: AuditLog::new(storage.clone()),
            storage,
            chart,
            validator,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn chart(&self) -> &Arc<dyn ChartOfAccounts> {
        &self.chart
    }

    fn check_accounts(&self, candidate: &CandidateEntry) -> LedgerResult<()> {
        for line in &candidate.lines {
            if self.chart.get_account(&line.account_id).is_none() {
                return Err(LedgerError::AccountNotFound(line.account_id.clone()));
            }
        }
        Ok(())
    }

    /// Post a balanced entry as the system actor
    pub async fn post_entry(
        &self,
        candidate: CandidateEntry,
        idempotency_key: Option<&str>,
    ) -> LedgerResult<JournalEntry> {
        self.post_entry_as(SYSTEM_ACTOR, candidate, idempotency_key)
            .await
            .map(|(entry, _)| entry)
    }

    /// Post a balanced entry; the flag is true when an earlier post was replayed
    #[instrument(skip(self, candidate))]
    pub async fn post_entry_as(
        &self,
        actor: &str,
        candidate: CandidateEntry,
        idempotency_key: Option<&str>,
    ) -> LedgerResult<(JournalEntry, bool)> {
        if let Some(key) = idempotency_key {
            validate_idempotency_key(key)?;
        }
        self.validator.validate_entry(&candidate)?;
        self.check_accounts(&candidate)?;

        let pending = PendingEntry {
            idempotency_key: idempotency_key.map(str::to_string),
            candidate,
            reverses: None,
        };
        let submitted = pending.candidate.clone();

        match self.storage.commit_entry(pending).await? {
            CommitOutcome::Committed(entry) => {
                info!(entry_id = %entry.id, amount = entry.amount(), "journal entry posted");
                self.audit
                    .record::<JournalEntry, _>(
                        actor,
                        AuditAction::EntryPosted,
                        &entry.id.to_string(),
                        None,
                        Some(&entry),
                    )
                    .await;
                Ok((entry, false))
            }
            CommitOutcome::Existing { entry, payload } => {
                if payload != submitted {
                    warn!(entry_id = %entry.id, "idempotency key reused with a different payload");
                    return Err(LedgerError::DuplicateTransaction(
                        idempotency_key.unwrap_or_default().to_string(),
                    ));
                }
                info!(entry_id = %entry.id, "idempotent replay");
                Ok((entry, true))
            }
        }
    }

    /// Post items in order; each item succeeds or fails on its own
    #[instrument(skip_all, fields(items = items.len()))]
    pub async fn post_batch(
        &self,
        actor: &str,
        items: Vec<BatchItem>,
        cancel: &CancellationSignal,
    ) -> BatchReport {
        let mut report = BatchReport::default();

        for (index, item) in items.into_iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                report.push(PostResult {
                    index,
                    idempotency_key: item.idempotency_key,
                    status: PostStatus::Skipped,
                    entry: None,
                    error: Some(LedgerError::Cancelled),
                });
                continue;
            }

            let result = self
                .post_entry_as(actor, item.candidate, item.idempotency_key.as_deref())
                .await;
            let (status, entry, error) = match result {
                Ok((entry, false)) => (PostStatus::Posted, Some(entry), None),
                Ok((entry, true)) => (PostStatus::Replayed, Some(entry), None),
                Err(e) => {
                    warn!(index, error = %e, "batch item failed");
                    (PostStatus::Failed, None, Some(e))
                }
            };
            report.push(PostResult {
                index,
                idempotency_key: item.idempotency_key,
                status,
                entry,
                error,
            });
        }

        info!(
            posted = report.posted,
            replayed = report.replayed,
            failed = report.failed,
            skipped = report.skipped,
            "batch finished"
        );
        self.audit
            .record::<serde_json::Value, _>(
                actor,
                AuditAction::BatchCompleted,
                "batch",
                None,
                Some(&serde_json::json!({
                    "posted": report.posted,
                    "replayed": report.replayed,
                    "failed": report.failed,
                    "skipped": report.skipped,
                    "cancelled": report.cancelled,
                })),
            )
            .await;
        report
    }

    /// Reverse a posted entry, dated today
    pub async fn reverse_entry(
        &self,
        original: EntryId,
        reason: &str,
    ) -> LedgerResult<JournalEntry> {
        self.reverse_entry_on(original, reason, Utc::now().date_naive(), SYSTEM_ACTOR)
            .await
    }

    /// Reverse a posted entry with an explicit date and actor
    #[instrument(skip(self, reason))]
    pub async fn reverse_entry_on(
        &self,
        original: EntryId,
        reason: &str,
        date: NaiveDate,
        actor: &str,
    ) -> LedgerResult<JournalEntry> {
        if reason.trim().is_empty() {
            return Err(LedgerError::Validation(
                "reversal reason cannot be empty".to_string(),
            ));
        }

        let entry = self
            .storage
            .get_entry(original)
            .await?
            .ok_or(LedgerError::EntryNotFound(original))?;
        if entry.is_reversal() {
            return Err(LedgerError::Validation(format!(
                "Entry {} is itself a reversal and cannot be reversed",
                original
            )));
        }
        if entry.status != EntryStatus::Posted {
            return Err(LedgerError::Validation(format!(
                "Entry {} is {:?} and cannot be reversed",
                original, entry.status
            )));
        }

        let mut candidate = CandidateEntry::new(
            date,
            &format!("Reversal of {}: {}", original, reason),
            "reversal",
            &entry.currency,
        );
        candidate.reference = entry.reference.clone();
        candidate.lines = entry.lines.iter().map(JournalLine::swapped).collect();
        check_balance(&candidate.lines)?;

        let pending = PendingEntry {
            idempotency_key: Some(reversal_key(original)),
            candidate,
            reverses: Some(original),
        };
        let reversal = match self.storage.commit_reversal(original, pending).await? {
            CommitOutcome::Committed(reversal) => reversal,
            CommitOutcome::Existing { entry, .. } => return Ok(entry),
        };

        info!(reversal_id = %reversal.id, "journal entry reversed");
        self.audit
            .record(
                actor,
                AuditAction::EntryReversed,
                &original.to_string(),
                Some(&entry),
                Some(&reversal),
            )
            .await;
        Ok(reversal)
    }

    pub async fn get_entry(&self, id: EntryId) -> LedgerResult<Option<JournalEntry>> {
        self.storage.get_entry(id).await
    }

    pub async fn list_entries(&self, filter: &EntryFilter) -> LedgerResult<Vec<JournalEntry>> {
        self.storage.list_entries(filter).await
    }
}

/// Builder for manually composed entries
#[derive(Debug)]
pub struct JournalEntryBuilder {
    candidate: CandidateEntry,
}

impl JournalEntryBuilder {
    /// Start a USD entry with source "manual"
    pub fn new(date: NaiveDate, description: &str) -> Self {
        Self {
            candidate: CandidateEntry::new(date, description, "manual", "USD"),
        }
    }

    pub fn source(mut self, source: &str) -> Self {
        self.candidate.source = source.to_string();
        self
    }

    pub fn currency(mut self, currency: &str) -> Self {
        self.candidate.currency = currency.to_string();
        self
    }

    pub fn reference(mut self, reference: &str) -> Self {
        self.candidate.reference = Some(reference.to_string());
        self
    }

    pub fn debit(mut self, account_id: &str, amount: MinorUnits, memo: Option<&str>) -> Self {
        self.candidate.lines.push(JournalLine::new(
            account_id,
            EntryType::Debit,
            amount,
            memo.map(str::to_string),
        ));
        self
    }

    pub fn credit(mut self, account_id: &str, amount: MinorUnits, memo: Option<&str>) -> Self {
        self.candidate.lines.push(JournalLine::new(
            account_id,
            EntryType::Credit,
            amount,
            memo.map(str::to_string),
        ));
        self
    }

    pub fn line(mut self, line: JournalLine) -> Self {
        self.candidate.lines.push(line);
        self
    }

    /// Validate and return the candidate
    pub fn build(self) -> LedgerResult<CandidateEntry> {
        self.candidate.validate()?;
        Ok(self.candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccountCodes;
    use crate::ledger::account::InMemoryChart;
    use crate::utils::memory_storage::MemoryStorage;

    fn service() -> PostingService<MemoryStorage> {
        let chart = InMemoryChart::standard(&AccountCodes::default()).unwrap();
        PostingService::new(MemoryStorage::new(), Arc::new(chart))
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 3).unwrap()
    }

    fn payment(amount: MinorUnits) -> CandidateEntry {
        JournalEntryBuilder::new(date(), "ACH payment")
            .reference("py_1")
            .debit("cash_in_transit", amount, None)
            .credit("accounts_receivable", amount, None)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_post_and_replay() {
        let service = service();
        let first = service.post_entry(payment(150_000), Some("py_1")).await.unwrap();
        let again = service.post_entry(payment(150_000), Some("py_1")).await.unwrap();

        assert_eq!(first, again);
        assert_eq!(first.status, EntryStatus::Posted);
        assert_eq!(service.storage().entry_count().await, 1);
    }

    #[tokio::test]
    async fn test_key_reuse_with_different_payload() {
        let service = service();
        service.post_entry(payment(100), Some("k")).await.unwrap();
        let result = service.post_entry(payment(200), Some("k")).await;
        assert_eq!(result, Err(LedgerError::DuplicateTransaction("k".to_string())));
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let service = service();
        let candidate = JournalEntryBuilder::new(date(), "bad")
            .debit("suspense", 10, None)
            .credit("cash", 10, None)
            .build()
            .unwrap();
        let result = service.post_entry(candidate, None).await;
        assert_eq!(result, Err(LedgerError::AccountNotFound("suspense".to_string())));
    }

    #[test]
    fn test_builder_rejects_unbalanced() {
        let result = JournalEntryBuilder::new(date(), "bad")
            .debit("cash", 100, None)
            .credit("accounts_receivable", 90, None)
            .build();
        assert_eq!(
            result,
            Err(LedgerError::UnbalancedEntry {
                debits: 100,
                credits: 90,
                imbalance: 10
            })
        );
    }

    #[tokio::test]
    async fn test_reverse_swaps_lines() {
        let service = service();
        let original = service.post_entry(payment(500), Some("p")).await.unwrap();
        let reversal = service.reverse_entry(original.id, "customer dispute").await.unwrap();

        assert_eq!(reversal.reverses, Some(original.id));
        assert_eq!(reversal.lines[0].account_id, "cash_in_transit");
        assert_eq!(reversal.lines[0].entry_type, EntryType::Credit);
        assert_eq!(reversal.lines[1].entry_type, EntryType::Debit);

        let stored = service.get_entry(original.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EntryStatus::Reversed);

        let again = service.reverse_entry(original.id, "again").await;
        assert!(matches!(again, Err(LedgerError::Validation(_))));
        let of_reversal = service.reverse_entry(reversal.id, "undo").await;
        assert!(matches!(of_reversal, Err(LedgerError::Validation(_))));
    }

    #[tokio::test]
    async fn test_reverse_unknown_entry() {
        let service = service();
        let result = service.reverse_entry(EntryId(42), "missing").await;
        assert_eq!(result, Err(LedgerError::EntryNotFound(EntryId(42))));
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let service = service();
        let bad = JournalEntryBuilder::new(date(), "bad")
            .debit("suspense", 10, None)
            .credit("cash", 10, None)
            .build()
            .unwrap();
        let items = vec![
            BatchItem::new("a", payment(100)),
            BatchItem::new("b", bad),
            BatchItem::new("c", payment(300)),
            BatchItem::new("a", payment(100)),
        ];

        let report = service
            .post_batch("ops", items, &CancellationSignal::new())
            .await;
        assert_eq!(report.posted, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.replayed, 1);
        assert_eq!(report.results[1].status, PostStatus::Failed);
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn test_cancelled_batch_skips_remaining() {
        let service = service();
        let cancel = CancellationSignal::new();
        cancel.cancel();
        let report = service
            .post_batch("ops", vec![BatchItem::new("a", payment(100))], &cancel)
            .await;
        assert!(report.cancelled);
        assert_eq!(report.skipped, 1);
        assert_eq!(service.storage().entry_count().await, 0);
    }
}
