//! Reconciliation runs
//!
//! A run walks PENDING -> MATCHING -> COMPLETE | FAILED and is persisted at
//! every step. The store refuses to begin a run whose window overlaps an
//! unfinished one, so overlapping runs exclude each other across engines.

use chrono::{NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditLog};
use crate::config::{EngineConfig, RetryPolicy};
use crate::exceptions::ExceptionService;
use crate::ledger::templates::TransactionType;
use crate::ledger::Ledger;
use crate::reconciliation::gateway::{
    feed_unavailable, load_bank_records, load_processor_records,
};
use crate::reconciliation::matching::{link_settlements, match_records, MatchPolicy};
use crate::reconciliation::records::*;
use crate::reconciliation::returns::{ReturnNotice, ReturnOutcome, ReturnProcessor};
use crate::traits::*;
use crate::types::*;
use crate::utils::calendar::calendar_span;

/// Everything a finished run produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub run: ReconciliationRun,
    pub matches: Vec<ReconciliationMatch>,
    /// Earlier matches that received their bank record in this run
    pub settlements: Vec<ReconciliationMatch>,
    /// Exceptions newly raised by this run
    pub exceptions: Vec<ReconciliationException>,
    pub returns: Vec<ReturnOutcome>,
}

#[derive(Debug, Default)]
struct RunOutput {
    matches: Vec<ReconciliationMatch>,
    settlements: Vec<ReconciliationMatch>,
    exceptions: Vec<ReconciliationException>,
    returns: Vec<ReturnOutcome>,
}

/// Reconciliation engine
#[derive(Clone)]
pub struct ReconciliationEngine<S: Store> {
    storage: S,
    processor: Arc<dyn PaymentProcessorGateway>,
    bank: Arc<dyn BankFeedGateway>,
    ledger: Ledger<S>,
    exceptions: ExceptionService<S>,
    returns: ReturnProcessor<S>,
    audit: AuditLog<S>,
    policy: MatchPolicy,
    retry: RetryPolicy,
}

impl<S: Store> ReconciliationEngine<S> {
    pub fn new(
        storage: S,
        ledger: Ledger<S>,
        processor: Arc<dyn PaymentProcessorGateway>,
        bank: Arc<dyn BankFeedGateway>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            exceptions: ExceptionService::new(storage.clone()),
            returns: ReturnProcessor::new(
                storage.clone(),
                ledger.clone(),
                config.reconciliation.return_window_days,
            ),
            audit: AuditLog::new(storage.clone()),
            storage,
            processor,
            bank,
            ledger,
            policy: MatchPolicy::from_config(config),
            retry: config.retry.clone(),
        }
    }

    pub fn returns(&self) -> &ReturnProcessor<S> {
        &self.returns
    }

    /// Reconcile processor records dated inside `window`
    #[instrument(skip(self), fields(window = %window))]
    pub async fn run(&self, window: DateWindow, actor: &str) -> LedgerResult<ReconciliationReport> {
        let mut run = ReconciliationRun::new(window);
        self.storage.begin_run(&run).await?;
        self.audit
            .record::<ReconciliationRun, _>(
                actor,
                AuditAction::ReconciliationStarted,
                &run.id.to_string(),
                None,
                Some(&run),
            )
            .await;

        run.state = RunState::Matching;
        let result = match self.storage.save_run(&run).await {
            Ok(()) => self.execute(&mut run, actor).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(output) => {
                run.state = RunState::Complete;
                run.finished_at = Some(Utc::now());
                self.storage.save_run(&run).await?;
                info!(
                    run_id = %run.id,
                    matched = run.stats.matched,
                    deferred = run.stats.deferred,
                    late_settlements = run.stats.late_settlements,
                    exceptions = run.stats.exceptions_raised,
                    returns = run.stats.returns_processed,
                    "reconciliation complete"
                );
                self.audit
                    .record::<ReconciliationRun, _>(
                        actor,
                        AuditAction::ReconciliationCompleted,
                        &run.id.to_string(),
                        None,
                        Some(&run),
                    )
                    .await;
                Ok(ReconciliationReport {
                    run,
                    matches: output.matches,
                    settlements: output.settlements,
                    exceptions: output.exceptions,
                    returns: output.returns,
                })
            }
            Err(e) => {
                error!(run_id = %run.id, error = %e, "reconciliation failed");
                run.state = RunState::Failed;
                run.finished_at = Some(Utc::now());
                run.error = Some(e.to_string());
                if let Err(save_error) = self.storage.save_run(&run).await {
                    error!(run_id = %run.id, error = %save_error, "failed to record run failure");
                }
                self.audit
                    .record::<ReconciliationRun, _>(
                        actor,
                        AuditAction::ReconciliationFailed,
                        &run.id.to_string(),
                        None,
                        Some(&run),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn execute(&self, run: &mut ReconciliationRun, actor: &str) -> LedgerResult<RunOutput> {
        let window = run.window;
        let wide = window.widened(calendar_span(self.policy.wide_date_tolerance_days));
        let mut pending_exceptions = Vec::new();

        let since = window.start.and_time(NaiveTime::MIN).and_utc();
        let externals =
            match load_processor_records(self.processor.as_ref(), &self.retry, since).await {
                Ok(records) => Some(records),
                Err(e @ (LedgerError::ExternalGatewayTimeout { .. } | LedgerError::Gateway(_))) => {
                    pending_exceptions.push(feed_unavailable("processor", &window, &e));
                    None
                }
                Err(e) => return Err(e),
            };
        let banks = match load_bank_records(self.bank.as_ref(), &self.retry, wide).await {
            Ok(records) => Some(records),
            Err(e @ (LedgerError::ExternalGatewayTimeout { .. } | LedgerError::Gateway(_))) => {
                pending_exceptions.push(feed_unavailable("bank", &window, &e));
                None
            }
            Err(e) => return Err(e),
        };

        let persisted = self.storage.list_matches(None).await?;
        let matched_external: HashSet<&str> =
            persisted.iter().map(|m| m.external_id.as_str()).collect();
        let matched_bank: HashSet<&str> = persisted
            .iter()
            .filter_map(|m| m.bank_reference_id.as_deref())
            .collect();
        let matched_entries: HashSet<EntryId> =
            persisted.iter().filter_map(|m| m.entry_id).collect();

        let mut payments = Vec::new();
        let mut notices = Vec::new();
        for record in externals.unwrap_or_default() {
            if !window.contains(record.date()) {
                continue;
            }
            if let Err(e) = record.validate() {
                warn!(
                    record = %record.processor_reference_id,
                    error = %e,
                    "dropping invalid processor record"
                );
                continue;
            }
            if record.is_return_notice() {
                notices.push(record);
            } else if record.status == ExternalStatus::Succeeded
                && !matched_external.contains(record.processor_reference_id.as_str())
            {
                payments.push(record);
            }
        }

        let bank_available = banks.is_some();
        let banks: Vec<BankSettlementRecord> = banks
            .unwrap_or_default()
            .into_iter()
            .filter(|b| match b.validate() {
                Ok(()) => !matched_bank.contains(b.bank_reference_id.as_str()),
                Err(e) => {
                    warn!(
                        record = %b.bank_reference_id,
                        error = %e,
                        "dropping invalid bank record"
                    );
                    false
                }
            })
            .collect();

        let entries: Vec<JournalEntry> = self
            .ledger
            .list_entries(&EntryFilter {
                window: Some(wide),
                status: Some(EntryStatus::Posted),
                ..EntryFilter::default()
            })
            .await?
            .into_iter()
            .filter(|e| !matched_entries.contains(&e.id) && self.is_reconcilable(e))
            .collect();

        run.stats.external_loaded = payments.len() + notices.len();
        run.stats.bank_loaded = banks.len();
        run.stats.entries_loaded = entries.len();

        let mut policy = self.policy.clone();
        if !bank_available {
            policy.require_bank_settlement = false;
        }
        let mut outcome = match_records(&policy, &window, payments, banks, entries);

        let now = Utc::now();
        let proposed: Vec<ReconciliationMatch> = outcome
            .matches
            .into_iter()
            .filter(|m| m.entry_id.is_some())
            .map(|m| ReconciliationMatch {
                id: Uuid::new_v4(),
                run_id: run.id,
                external_id: m.external_id,
                reference: m.reference,
                bank_reference_id: m.bank_reference_id,
                entry_id: m.entry_id,
                amount: m.amount,
                settled_on: m.settled_on,
                match_type: m.match_type,
                confidence: m.confidence,
                matched_at: now,
            })
            .collect();
        let matches = self.storage.save_matches(&proposed).await?;
        for m in &matches {
            self.audit
                .record::<ReconciliationMatch, _>(
                    actor,
                    AuditAction::MatchRecorded,
                    &m.external_id,
                    None,
                    Some(m),
                )
                .await;
        }
        run.stats.matched = matches.len();

        // items claimed by a concurrent run are left for the next run
        let saved: HashSet<Uuid> = matches.iter().map(|m| m.id).collect();
        let deferred: Vec<ItemRef> = proposed
            .iter()
            .filter(|m| !saved.contains(&m.id))
            .map(|m| ItemRef::External(m.external_id.clone()))
            .collect();
        for item in &deferred {
            warn!(item = ?item, run_id = %run.id, "match deferred, item matched concurrently");
        }
        outcome
            .exceptions
            .retain(|e| !e.items.iter().any(|i| deferred.contains(i)));
        run.stats.deferred = deferred.len();

        let awaiting: Vec<ReconciliationMatch> = persisted
            .iter()
            .filter(|m| m.bank_reference_id.is_none())
            .cloned()
            .collect();
        let settlements = self
            .link_late_settlements(&policy, &awaiting, &outcome.unmatched_banks, actor)
            .await?;
        let linked: HashSet<ItemRef> = settlements
            .iter()
            .filter_map(|m| m.bank_reference_id.clone().map(ItemRef::Bank))
            .collect();
        outcome.exceptions.retain(|e| {
            !(e.reason == ExceptionReason::MissingLedgerEntry
                && e.items.len() == 1
                && linked.contains(&e.items[0]))
        });
        run.stats.late_settlements = settlements.len();

        pending_exceptions.extend(outcome.exceptions);
        let mut raised = Vec::new();
        for new in pending_exceptions {
            let (exception, created) =
                self.exceptions.raise_unique(actor, new.with_run(run.id)).await?;
            if created {
                raised.push(exception);
            }
        }

        notices.sort_by(|a, b| {
            (a.timestamp, &a.processor_reference_id).cmp(&(b.timestamp, &b.processor_reference_id))
        });
        let mut returns = Vec::new();
        for record in &notices {
            let notice = match ReturnNotice::from_record(record) {
                Ok(notice) => notice,
                Err(e) => {
                    warn!(
                        record = %record.processor_reference_id,
                        error = %e,
                        "skipping malformed return notice"
                    );
                    continue;
                }
            };
            let (outcome, exception) = self.returns.process_tracked(&notice, actor).await?;
            raised.extend(exception);
            returns.push(outcome);
        }
        run.stats.returns_processed = returns.len();
        run.stats.exceptions_raised = raised.len();

        Ok(RunOutput {
            matches,
            settlements,
            exceptions: raised,
            returns,
        })
    }

    /// Attach bank records that settled after their payment was matched
    async fn link_late_settlements(
        &self,
        policy: &MatchPolicy,
        awaiting: &[ReconciliationMatch],
        banks: &[BankSettlementRecord],
        actor: &str,
    ) -> LedgerResult<Vec<ReconciliationMatch>> {
        let mut settled = Vec::new();
        for link in link_settlements(policy, awaiting, banks) {
            let updated = match self.storage.attach_bank(&link).await {
                Ok(updated) => updated,
                Err(LedgerError::Validation(reason)) => {
                    warn!(
                        bank = %link.bank_reference_id,
                        external = %link.external_id,
                        %reason,
                        "bank record not linked"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            let before = awaiting.iter().find(|m| m.id == link.match_id);
            self.audit
                .record(
                    actor,
                    AuditAction::SettlementLinked,
                    &updated.external_id,
                    before,
                    Some(&updated),
                )
                .await;
            self.exceptions
                .resolve_settled(&updated.external_id, &link.bank_reference_id, actor)
                .await?;
            info!(
                external = %updated.external_id,
                bank = %link.bank_reference_id,
                "late bank settlement linked"
            );
            settled.push(updated);
        }
        Ok(settled)
    }

    /// Entries that stand for a processor payment
    fn is_reconcilable(&self, entry: &JournalEntry) -> bool {
        if entry.is_reversal() {
            return false;
        }
        !self
            .ledger
            .templates()
            .get(&entry.source)
            .is_some_and(|t| matches!(t.transaction_type, TransactionType::AchReturn))
    }
}
