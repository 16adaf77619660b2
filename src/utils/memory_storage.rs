//! In-memory storage implementation for testing and development

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditFilter, NewAuditEntry};
use crate::reconciliation::{
    ExceptionFilter, ExceptionId, ExceptionStatus, NewException, ReconciliationException,
    ReconciliationMatch, ReconciliationRun, SettlementLink,
};
use crate::traits::*;
use crate::types::*;

#[derive(Debug, Default)]
struct LedgerTables {
    last_entry_id: u64,
    entries: BTreeMap<EntryId, JournalEntry>,
    idempotency: HashMap<String, (EntryId, CandidateEntry)>,
}

impl LedgerTables {
    fn replay(&self, key: Option<&String>) -> LedgerResult<Option<CommitOutcome>> {
        let Some((id, payload)) = key.and_then(|k| self.idempotency.get(k)) else {
            return Ok(None);
        };
        let entry = self.entries.get(id).cloned().ok_or_else(|| {
            LedgerError::Persistence(format!("idempotency index points at missing entry {}", id))
        })?;
        Ok(Some(CommitOutcome::Existing {
            entry,
            payload: payload.clone(),
        }))
    }

    fn insert(&mut self, pending: PendingEntry) -> JournalEntry {
        self.last_entry_id += 1;
        let id = EntryId(self.last_entry_id);

        let mut entry =
            JournalEntry::from_candidate(id, pending.candidate.clone(), EntryStatus::Posted);
        entry.reverses = pending.reverses;
        entry.idempotency_key = pending.idempotency_key.clone();
        entry.posted_at = Some(Utc::now());

        if let Some(key) = pending.idempotency_key {
            self.idempotency.insert(key, (id, pending.candidate));
        }
        self.entries.insert(id, entry.clone());
        entry
    }
}

#[derive(Debug, Default)]
struct ReconciliationTables {
    runs: HashMap<Uuid, ReconciliationRun>,
    matches: Vec<ReconciliationMatch>,
    matched_external: HashSet<String>,
    matched_bank: HashSet<String>,
    matched_entries: HashSet<EntryId>,
    last_exception_id: ExceptionId,
    exceptions: BTreeMap<ExceptionId, ReconciliationException>,
}

#[derive(Debug, Default)]
struct AuditTable {
    last_id: u64,
    entries: Vec<AuditEntry>,
}

/// In-memory storage for testing and development
///
/// Each table group sits behind one lock, so every commit observes and
/// mutates its rows in a single critical section.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    ledger: Arc<RwLock<LedgerTables>>,
    reconciliation: Arc<RwLock<ReconciliationTables>>,
    audit: Arc<RwLock<AuditTable>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStorage {
    /// Create a new memory storage instance
    pub fn new() -> Self {
        Self {
            ledger: Arc::new(RwLock::new(LedgerTables::default())),
            reconciliation: Arc::new(RwLock::new(ReconciliationTables::default())),
            audit: Arc::new(RwLock::new(AuditTable::default())),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every ledger and reconciliation write fail with a persistence error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of journal entries written so far
    pub async fn entry_count(&self) -> usize {
        self.ledger.read().await.entries.len()
    }

    fn check_writable(&self) -> LedgerResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LedgerError::Persistence(
                "store rejected the transaction".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStorage for MemoryStorage {
    async fn commit_entry(&self, pending: PendingEntry) -> LedgerResult<CommitOutcome> {
        let mut tables = self.ledger.write().await;
        if let Some(existing) = tables.replay(pending.idempotency_key.as_ref())? {
            return Ok(existing);
        }
        self.check_writable()?;
        Ok(CommitOutcome::Committed(tables.insert(pending)))
    }

    async fn commit_reversal(
        &self,
        original: EntryId,
        reversal: PendingEntry,
    ) -> LedgerResult<CommitOutcome> {
        let mut tables = self.ledger.write().await;
        if let Some(existing) = tables.replay(reversal.idempotency_key.as_ref())? {
            return Ok(existing);
        }

        let status = tables
            .entries
            .get(&original)
            .map(|e| e.status)
            .ok_or(LedgerError::EntryNotFound(original))?;
        if status != EntryStatus::Posted {
            return Err(LedgerError::Validation(format!(
                "Entry {} is {:?} and cannot be reversed",
                original, status
            )));
        }
        self.check_writable()?;

        let entry = tables.insert(reversal);
        if let Some(original_entry) = tables.entries.get_mut(&original) {
            original_entry.status = EntryStatus::Reversed;
        }
        Ok(CommitOutcome::Committed(entry))
    }

    async fn get_entry(&self, id: EntryId) -> LedgerResult<Option<JournalEntry>> {
        Ok(self.ledger.read().await.entries.get(&id).cloned())
    }

    async fn list_entries(&self, filter: &EntryFilter) -> LedgerResult<Vec<JournalEntry>> {
        let tables = self.ledger.read().await;
        Ok(tables
            .entries
            .values()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ReconciliationStorage for MemoryStorage {
    async fn begin_run(&self, run: &ReconciliationRun) -> LedgerResult<()> {
        let mut tables = self.reconciliation.write().await;
        self.check_writable()?;
        let held = tables
            .runs
            .values()
            .any(|r| !r.state.is_terminal() && r.window.overlaps(&run.window));
        if held {
            return Err(LedgerError::ReconciliationWindowLocked(run.window));
        }
        tables.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn save_run(&self, run: &ReconciliationRun) -> LedgerResult<()> {
        let mut tables = self.reconciliation.write().await;
        self.check_writable()?;
        tables.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> LedgerResult<Option<ReconciliationRun>> {
        Ok(self.reconciliation.read().await.runs.get(&run_id).cloned())
    }

    async fn save_matches(
        &self,
        matches: &[ReconciliationMatch],
    ) -> LedgerResult<Vec<ReconciliationMatch>> {
        let mut tables = self.reconciliation.write().await;
        self.check_writable()?;

        let mut saved = Vec::with_capacity(matches.len());
        for m in matches {
            let reused = tables.matched_external.contains(&m.external_id)
                || m.bank_reference_id
                    .as_ref()
                    .is_some_and(|b| tables.matched_bank.contains(b))
                || m.entry_id.is_some_and(|e| tables.matched_entries.contains(&e));
            if reused {
                continue;
            }

            tables.matched_external.insert(m.external_id.clone());
            if let Some(b) = &m.bank_reference_id {
                tables.matched_bank.insert(b.clone());
            }
            if let Some(e) = m.entry_id {
                tables.matched_entries.insert(e);
            }
            tables.matches.push(m.clone());
            saved.push(m.clone());
        }
        Ok(saved)
    }

    async fn attach_bank(&self, link: &SettlementLink) -> LedgerResult<ReconciliationMatch> {
        let mut guard = self.reconciliation.write().await;
        self.check_writable()?;
        let tables = &mut *guard;

        if tables.matched_bank.contains(&link.bank_reference_id) {
            return Err(LedgerError::Validation(format!(
                "bank record {} is already matched",
                link.bank_reference_id
            )));
        }
        let stored = tables
            .matches
            .iter_mut()
            .find(|m| m.id == link.match_id)
            .ok_or_else(|| LedgerError::Validation(format!("match {} not found", link.match_id)))?;
        if stored.bank_reference_id.is_some() {
            return Err(LedgerError::Validation(format!(
                "match for {} already has a bank record",
                stored.external_id
            )));
        }

        stored.bank_reference_id = Some(link.bank_reference_id.clone());
        stored.settled_on = link.settled_on;
        stored.match_type = link.match_type;
        stored.confidence = link.confidence;
        let updated = stored.clone();
        tables.matched_bank.insert(link.bank_reference_id.clone());
        Ok(updated)
    }

    async fn list_matches(&self, run_id: Option<Uuid>) -> LedgerResult<Vec<ReconciliationMatch>> {
        let tables = self.reconciliation.read().await;
        Ok(tables
            .matches
            .iter()
            .filter(|m| run_id.is_none_or(|r| m.run_id == r))
            .cloned()
            .collect())
    }

    async fn insert_exception(&self, new: NewException) -> LedgerResult<ReconciliationException> {
        let mut tables = self.reconciliation.write().await;
        self.check_writable()?;

        tables.last_exception_id += 1;
        let now = Utc::now();
        let exception = ReconciliationException {
            id: tables.last_exception_id,
            run_id: new.run_id,
            reason: new.reason,
            items: new.items,
            detail: new.detail,
            amount: new.amount,
            status: ExceptionStatus::Open,
            assigned_to: None,
            resolution: None,
            created_at: now,
            updated_at: now,
        };
        tables.exceptions.insert(exception.id, exception.clone());
        Ok(exception)
    }

    async fn get_exception(
        &self,
        id: ExceptionId,
    ) -> LedgerResult<Option<ReconciliationException>> {
        Ok(self.reconciliation.read().await.exceptions.get(&id).cloned())
    }

    async fn update_exception(
        &self,
        expected: ExceptionStatus,
        updated: &ReconciliationException,
    ) -> LedgerResult<()> {
        let mut tables = self.reconciliation.write().await;
        self.check_writable()?;

        let stored = tables
            .exceptions
            .get_mut(&updated.id)
            .ok_or(LedgerError::ExceptionNotFound(updated.id))?;
        if stored.status != expected {
            return Err(LedgerError::InvalidTransition {
                from: stored.status,
                to: updated.status,
            });
        }
        *stored = updated.clone();
        Ok(())
    }

    async fn list_exceptions(
        &self,
        filter: &ExceptionFilter,
    ) -> LedgerResult<Vec<ReconciliationException>> {
        let tables = self.reconciliation.read().await;
        Ok(tables
            .exceptions
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AuditStorage for MemoryStorage {
    async fn append_audit(&self, entry: NewAuditEntry) -> LedgerResult<AuditEntry> {
        let mut table = self.audit.write().await;
        table.last_id += 1;
        let stored = AuditEntry {
            id: table.last_id,
            actor: entry.actor,
            action: entry.action,
            target_id: entry.target_id,
            before: entry.before,
            after: entry.after,
            timestamp: Utc::now(),
        };
        table.entries.push(stored.clone());
        Ok(stored)
    }

    async fn query_audit(&self, filter: &AuditFilter) -> LedgerResult<Vec<AuditEntry>> {
        let table = self.audit.read().await;
        Ok(table
            .entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn pending(key: Option<&str>, amount: MinorUnits) -> PendingEntry {
        let mut candidate = CandidateEntry::new(
            NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            "test",
            "manual",
            "USD",
        );
        candidate.lines.push(JournalLine::debit("cash", amount));
        candidate.lines.push(JournalLine::credit("revenue", amount));
        PendingEntry {
            idempotency_key: key.map(str::to_string),
            candidate,
            reverses: None,
        }
    }

    #[tokio::test]
    async fn test_ids_increase_monotonically() {
        let storage = MemoryStorage::new();
        let mut last = EntryId(0);
        for _ in 0..5 {
            match storage.commit_entry(pending(None, 100)).await.unwrap() {
                CommitOutcome::Committed(entry) => {
                    assert!(entry.id > last);
                    assert_eq!(entry.status, EntryStatus::Posted);
                    last = entry.id;
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_replayed_key_returns_existing() {
        let storage = MemoryStorage::new();
        storage.commit_entry(pending(Some("k1"), 100)).await.unwrap();
        let outcome = storage.commit_entry(pending(Some("k1"), 200)).await.unwrap();

        match outcome {
            CommitOutcome::Existing { entry, payload } => {
                assert_eq!(entry.amount(), 100);
                assert_eq!(payload.total_debits(), 100);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(storage.entry_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_rows() {
        let storage = MemoryStorage::new();
        storage.set_fail_writes(true);
        let result = storage.commit_entry(pending(Some("k1"), 100)).await;

        assert!(matches!(result, Err(LedgerError::Persistence(_))));
        assert_eq!(storage.entry_count().await, 0);

        storage.set_fail_writes(false);
        assert!(matches!(
            storage.commit_entry(pending(Some("k1"), 100)).await.unwrap(),
            CommitOutcome::Committed(_)
        ));
    }

    #[tokio::test]
    async fn test_update_exception_is_compare_and_swap() {
        let storage = MemoryStorage::new();
        let exception = storage
            .insert_exception(NewException::new(
                crate::reconciliation::ExceptionReason::MissingBankRecord,
                vec![],
                "missing",
            ))
            .await
            .unwrap();

        let mut claimed = exception.clone();
        claimed.status = ExceptionStatus::UnderReview;
        storage
            .update_exception(ExceptionStatus::Open, &claimed)
            .await
            .unwrap();

        let result = storage.update_exception(ExceptionStatus::Open, &claimed).await;
        assert!(matches!(result, Err(LedgerError::InvalidTransition { .. })));
    }

    fn window(start: u32, end: u32) -> DateWindow {
        DateWindow::new(
            NaiveDate::from_ymd_opt(2024, 1, start).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, end).unwrap(),
        )
        .unwrap()
    }

    fn stored_match(external: &str, bank: Option<&str>, entry: u64) -> ReconciliationMatch {
        ReconciliationMatch {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            external_id: external.to_string(),
            reference: String::new(),
            bank_reference_id: bank.map(str::to_string),
            entry_id: Some(EntryId(entry)),
            amount: 1_000,
            settled_on: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            match_type: crate::reconciliation::MatchType::DateProximity,
            confidence: 90,
            matched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_unfinished_run_holds_its_window() {
        let storage = MemoryStorage::new();
        let other = storage.clone();
        let mut first = ReconciliationRun::new(window(1, 5));
        storage.begin_run(&first).await.unwrap();

        let overlapping = ReconciliationRun::new(window(5, 9));
        assert!(matches!(
            other.begin_run(&overlapping).await,
            Err(LedgerError::ReconciliationWindowLocked(_))
        ));
        let disjoint = ReconciliationRun::new(window(8, 12));
        other.begin_run(&disjoint).await.unwrap();

        first.state = crate::reconciliation::RunState::Failed;
        storage.save_run(&first).await.unwrap();
        other.begin_run(&ReconciliationRun::new(window(1, 5))).await.unwrap();
    }

    #[tokio::test]
    async fn test_save_matches_skips_claimed_items() {
        let storage = MemoryStorage::new();
        let saved = storage
            .save_matches(&[stored_match("py_a", None, 1)])
            .await
            .unwrap();
        assert_eq!(saved.len(), 1);

        let saved = storage
            .save_matches(&[stored_match("py_b", None, 1), stored_match("py_c", None, 2)])
            .await
            .unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].external_id, "py_c");

        let all = storage.list_matches(None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|m| m.external_id != "py_b"));
    }

    #[tokio::test]
    async fn test_attach_bank_is_compare_and_swap() {
        let storage = MemoryStorage::new();
        let waiting = stored_match("py_a", None, 1);
        let settled = stored_match("py_b", Some("b2"), 2);
        storage
            .save_matches(&[waiting.clone(), settled.clone()])
            .await
            .unwrap();

        let link = |match_id, bank: &str| SettlementLink {
            match_id,
            external_id: "py_a".to_string(),
            bank_reference_id: bank.to_string(),
            settled_on: NaiveDate::from_ymd_opt(2024, 1, 4).unwrap(),
            match_type: crate::reconciliation::MatchType::DateProximity,
            confidence: 90,
        };

        assert!(matches!(
            storage.attach_bank(&link(waiting.id, "b2")).await,
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            storage.attach_bank(&link(settled.id, "b1")).await,
            Err(LedgerError::Validation(_))
        ));

        let updated = storage.attach_bank(&link(waiting.id, "b1")).await.unwrap();
        assert_eq!(updated.bank_reference_id.as_deref(), Some("b1"));
        assert_eq!(updated.settled_on, NaiveDate::from_ymd_opt(2024, 1, 4).unwrap());
        assert!(matches!(
            storage.attach_bank(&link(waiting.id, "b3")).await,
            Err(LedgerError::Validation(_))
        ));
    }
}
