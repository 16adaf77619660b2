//! Reconciliation exception queue
//!
//! Exceptions move Open -> UnderReview -> Resolved | WrittenOff. Every
//! transition is written with a compare-and-swap on the previous status, so
//! two operators racing on the same exception cannot both succeed.

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::audit::{AuditAction, AuditLog};
use crate::reconciliation::records::*;
use crate::traits::*;
use crate::types::*;

/// Exception lifecycle service
#[derive(Debug, Clone)]
pub struct ExceptionService<S: LedgerStorage + ReconciliationStorage + AuditStorage> {
    storage: S,
    audit: AuditLog<S>,
}

impl<S: LedgerStorage + ReconciliationStorage + AuditStorage + Clone> ExceptionService<S> {
    pub fn new(storage: S) -> Self {
        Self {
            audit: AuditLog::new(storage.clone()),
            storage,
        }
    }

    /// Record a new Open exception
    pub async fn raise(
        &self,
        actor: &str,
        new: NewException,
    ) -> LedgerResult<ReconciliationException> {
        let exception = self.storage.insert_exception(new).await?;
        warn!(
            exception_id = exception.id,
            reason = ?exception.reason,
            detail = %exception.detail,
            "reconciliation exception raised"
        );
        self.audit
            .record::<ReconciliationException, _>(
                actor,
                AuditAction::ExceptionRaised,
                &exception_target(exception.id),
                None,
                Some(&exception),
            )
            .await;
        Ok(exception)
    }

    /// Raise unless an unresolved exception with the same reason and items exists
    ///
    /// Returns the exception and whether it was newly created.
    pub async fn raise_unique(
        &self,
        actor: &str,
        new: NewException,
    ) -> LedgerResult<(ReconciliationException, bool)> {
        let filter = ExceptionFilter {
            reason: Some(new.reason),
            item: new.items.first().cloned(),
            unresolved_only: true,
            ..ExceptionFilter::default()
        };
        let existing = self.storage.list_exceptions(&filter).await?;
        if let Some(found) = existing.into_iter().find(|e| e.items == new.items) {
            return Ok((found, false));
        }
        Ok((self.raise(actor, new).await?, true))
    }

    pub async fn list(
        &self,
        filter: &ExceptionFilter,
    ) -> LedgerResult<Vec<ReconciliationException>> {
        self.storage.list_exceptions(filter).await
    }

    pub async fn get(&self, id: ExceptionId) -> LedgerResult<ReconciliationException> {
        self.storage
            .get_exception(id)
            .await?
            .ok_or(LedgerError::ExceptionNotFound(id))
    }

    /// Move an Open exception to UnderReview and assign it
    #[instrument(skip(self))]
    pub async fn claim(
        &self,
        id: ExceptionId,
        assignee: &str,
    ) -> LedgerResult<ReconciliationException> {
        if assignee.trim().is_empty() {
            return Err(LedgerError::Validation("assignee cannot be empty".to_string()));
        }

        let current = self.get(id).await?;
        let next = ExceptionStatus::UnderReview;
        if !current.status.can_transition_to(next) {
            return Err(LedgerError::InvalidTransition {
                from: current.status,
                to: next,
            });
        }

        let mut updated = current.clone();
        updated.status = next;
        updated.assigned_to = Some(assignee.to_string());
        updated.updated_at = Utc::now();
        self.storage.update_exception(current.status, &updated).await?;

        info!(exception_id = id, assignee, "exception claimed");
        self.audit
            .record(
                assignee,
                AuditAction::ExceptionClaimed,
                &exception_target(id),
                Some(&current),
                Some(&updated),
            )
            .await;
        Ok(updated)
    }

    /// Close an UnderReview exception with a corrective entry or a write-off
    #[instrument(skip(self, resolution))]
    pub async fn resolve(
        &self,
        id: ExceptionId,
        resolution: Resolution,
        actor: &str,
    ) -> LedgerResult<ReconciliationException> {
        let current = self.get(id).await?;
        let next = resolution.target_status();
        if !current.status.can_transition_to(next) {
            return Err(LedgerError::InvalidTransition {
                from: current.status,
                to: next,
            });
        }

        match &resolution {
            Resolution::CorrectiveEntry { entry_id } => {
                let entry = self
                    .storage
                    .get_entry(*entry_id)
                    .await?
                    .ok_or(LedgerError::EntryNotFound(*entry_id))?;
                if entry.status != EntryStatus::Posted {
                    return Err(LedgerError::Validation(format!(
                        "corrective entry {} is {:?}, expected Posted",
                        entry_id, entry.status
                    )));
                }
            }
            Resolution::BankSettlement { bank_reference_id } => {
                let linked = self
                    .storage
                    .list_matches(None)
                    .await?
                    .iter()
                    .any(|m| m.bank_reference_id.as_ref() == Some(bank_reference_id));
                if !linked {
                    return Err(LedgerError::Validation(format!(
                        "bank record {} is not linked to any match",
                        bank_reference_id
                    )));
                }
            }
            Resolution::WriteOff { justification } => {
                if justification.trim().is_empty() {
                    return Err(LedgerError::Validation(
                        "write-off requires a justification".to_string(),
                    ));
                }
            }
        }

        let mut updated = current.clone();
        updated.status = next;
        updated.resolution = Some(resolution);
        updated.updated_at = Utc::now();
        self.storage.update_exception(current.status, &updated).await?;

        let action = match next {
            ExceptionStatus::WrittenOff => AuditAction::ExceptionWrittenOff,
            _ => AuditAction::ExceptionResolved,
        };
        info!(exception_id = id, status = ?next, "exception closed");
        self.audit
            .record(actor, action, &exception_target(id), Some(&current), Some(&updated))
            .await;
        Ok(updated)
    }

    /// Resolve every unresolved exception referencing `item` with `entry_id`
    ///
    /// Open exceptions are claimed by `actor` first, so the lifecycle is the
    /// same as for an operator.
    pub async fn auto_resolve(
        &self,
        item: &ItemRef,
        entry_id: EntryId,
        actor: &str,
    ) -> LedgerResult<Vec<ExceptionId>> {
        let filter = ExceptionFilter {
            item: Some(item.clone()),
            unresolved_only: true,
            ..ExceptionFilter::default()
        };
        self.close_all(&filter, Resolution::CorrectiveEntry { entry_id }, actor)
            .await
    }

    /// Close MISSING_BANK_RECORD exceptions of a payment whose bank record arrived
    pub async fn resolve_settled(
        &self,
        external_id: &str,
        bank_reference_id: &str,
        actor: &str,
    ) -> LedgerResult<Vec<ExceptionId>> {
        let filter = ExceptionFilter {
            reason: Some(ExceptionReason::MissingBankRecord),
            item: Some(ItemRef::External(external_id.to_string())),
            unresolved_only: true,
            ..ExceptionFilter::default()
        };
        let resolution = Resolution::BankSettlement {
            bank_reference_id: bank_reference_id.to_string(),
        };
        self.close_all(&filter, resolution, actor).await
    }

    async fn close_all(
        &self,
        filter: &ExceptionFilter,
        resolution: Resolution,
        actor: &str,
    ) -> LedgerResult<Vec<ExceptionId>> {
        let mut resolved = Vec::new();
        for exception in self.storage.list_exceptions(filter).await? {
            if exception.status == ExceptionStatus::Open {
                self.claim(exception.id, actor).await?;
            }
            self.resolve(exception.id, resolution.clone(), actor).await?;
            resolved.push(exception.id);
        }
        Ok(resolved)
    }
}

/// Audit target id of an exception
pub fn exception_target(id: ExceptionId) -> String {
    format!("EX-{}", id)
}
