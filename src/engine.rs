//! Settlement engine facade
//!
//! Wires the template registry, posting service, reconciliation engine,
//! exception queue and audit log over one store. Every dependency is passed
//! in at construction; the engine holds no global state.

use chrono::NaiveDate;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditFilter, AuditLog};
use crate::config::EngineConfig;
use crate::exceptions::ExceptionService;
use crate::ledger::{
    BatchItem, BatchReport, Ledger, Preview, TemplateRegistry, TransactionData, TransactionType,
};
use crate::reconciliation::*;
use crate::traits::*;
use crate::types::*;
use crate::utils::cancel::CancellationSignal;

/// Entry point for posting, reconciliation and exception handling
#[derive(Clone)]
pub struct SettlementEngine<S: Store> {
    storage: S,
    config: EngineConfig,
    ledger: Ledger<S>,
    exceptions: ExceptionService<S>,
    reconciliation: ReconciliationEngine<S>,
    audit: AuditLog<S>,
}

impl<S: Store> SettlementEngine<S> {
    /// Build an engine; fails on invalid configuration or an incomplete chart
    pub fn new(
        storage: S,
        chart: Arc<dyn ChartOfAccounts>,
        processor: Arc<dyn PaymentProcessorGateway>,
        bank: Arc<dyn BankFeedGateway>,
        config: EngineConfig,
    ) -> LedgerResult<Self> {
        config.validate()?;
        let templates = Arc::new(TemplateRegistry::standard(config.accounts.clone())?);
        let ledger = Ledger::new(storage.clone(), chart, templates)?;
        let reconciliation =
            ReconciliationEngine::new(storage.clone(), ledger.clone(), processor, bank, &config);

        Ok(Self {
            exceptions: ExceptionService::new(storage.clone()),
            audit: AuditLog::new(storage.clone()),
            storage,
            config,
            ledger,
            reconciliation,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger<S> {
        &self.ledger
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn reconciliation(&self) -> &ReconciliationEngine<S> {
        &self.reconciliation
    }

    // Ledger operations

    /// Post a manually composed entry
    pub async fn post_journal_entry(
        &self,
        actor: &str,
        candidate: CandidateEntry,
        idempotency_key: Option<&str>,
    ) -> LedgerResult<JournalEntry> {
        self.ledger
            .posting()
            .post_entry_as(actor, candidate, idempotency_key)
            .await
            .map(|(entry, _)| entry)
    }

    pub async fn post_batch(
        &self,
        actor: &str,
        items: Vec<BatchItem>,
        cancel: &CancellationSignal,
    ) -> BatchReport {
        self.ledger.posting().post_batch(actor, items, cancel).await
    }

    /// Reverse a posted entry, dated today
    pub async fn reverse_entry(
        &self,
        actor: &str,
        entry_id: EntryId,
        reason: &str,
    ) -> LedgerResult<JournalEntry> {
        self.ledger
            .posting()
            .reverse_entry_on(entry_id, reason, chrono::Utc::now().date_naive(), actor)
            .await
    }

    pub fn preview(
        &self,
        transaction_type: TransactionType,
        data: &TransactionData,
    ) -> LedgerResult<Preview> {
        self.ledger.preview(transaction_type, data)
    }

    /// Template a payment event and post it, keyed by its transaction id
    pub async fn post_transaction(
        &self,
        actor: &str,
        transaction_type: TransactionType,
        data: &TransactionData,
    ) -> LedgerResult<JournalEntry> {
        self.ledger
            .post_transaction(actor, transaction_type, data, None)
            .await
    }

    pub async fn get_entry(&self, entry_id: EntryId) -> LedgerResult<JournalEntry> {
        self.ledger.get_entry_required(entry_id).await
    }

    pub async fn trial_balance(&self, as_of_date: NaiveDate) -> LedgerResult<TrialBalance> {
        self.ledger.trial_balance(as_of_date).await
    }

    // Reconciliation

    pub async fn run_reconciliation(
        &self,
        actor: &str,
        window: DateWindow,
    ) -> LedgerResult<ReconciliationReport> {
        self.reconciliation.run(window, actor).await
    }

    pub async fn get_run(&self, run_id: Uuid) -> LedgerResult<Option<ReconciliationRun>> {
        self.storage.get_run(run_id).await
    }

    pub async fn list_matches(
        &self,
        run_id: Option<Uuid>,
    ) -> LedgerResult<Vec<ReconciliationMatch>> {
        self.storage.list_matches(run_id).await
    }

    /// Apply a return notice outside of a scheduled run
    pub async fn process_return(
        &self,
        actor: &str,
        record: &ExternalTransactionRecord,
    ) -> LedgerResult<ReturnOutcome> {
        let notice = ReturnNotice::from_record(record)?;
        self.reconciliation.returns().process(&notice, actor).await
    }

    // Exceptions

    pub async fn list_exceptions(
        &self,
        filter: &ExceptionFilter,
    ) -> LedgerResult<Vec<ReconciliationException>> {
        self.exceptions.list(filter).await
    }

    pub async fn claim_exception(
        &self,
        id: ExceptionId,
        assignee: &str,
    ) -> LedgerResult<ReconciliationException> {
        self.exceptions.claim(id, assignee).await
    }

    pub async fn resolve_exception(
        &self,
        id: ExceptionId,
        resolution: Resolution,
        actor: &str,
    ) -> LedgerResult<ReconciliationException> {
        self.exceptions.resolve(id, resolution, actor).await
    }

    // Audit

    pub async fn audit_trail(&self, target_id: &str) -> LedgerResult<Vec<AuditEntry>> {
        self.audit.trail_for(target_id).await
    }

    pub async fn query_audit(&self, filter: &AuditFilter) -> LedgerResult<Vec<AuditEntry>> {
        self.audit.query(filter).await
    }
}
