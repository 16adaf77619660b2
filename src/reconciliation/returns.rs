//! ACH return handling
//!
//! A return notice inside the return window reverses the ledger entry of the
//! matched payment, books the bank's return fee through the `AchReturn`
//! template and resolves the open exceptions of that payment. A notice past
//! the window, or one without a matched payment, goes to the exception queue.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::audit::{AuditAction, AuditLog};
use crate::exceptions::ExceptionService;
use crate::ledger::templates::{TransactionData, TransactionType};
use crate::ledger::Ledger;
use crate::reconciliation::records::*;
use crate::traits::*;
use crate::types::*;

/// Validated return notice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnNotice {
    /// Processor id of the notice itself
    pub notice_id: String,
    /// Processor id of the returned payment
    pub original_reference_id: String,
    pub return_code: String,
    pub amount: MinorUnits,
    pub fee: MinorUnits,
    pub currency: String,
    pub received_on: NaiveDate,
}

impl ReturnNotice {
    pub fn from_record(record: &ExternalTransactionRecord) -> LedgerResult<Self> {
        record.validate()?;
        let (Some(return_code), Some(original)) =
            (&record.return_code, &record.original_reference_id)
        else {
            return Err(LedgerError::Validation(format!(
                "record {} is not a return notice",
                record.processor_reference_id
            )));
        };
        Ok(Self {
            notice_id: record.processor_reference_id.clone(),
            original_reference_id: original.clone(),
            return_code: return_code.clone(),
            amount: record.amount,
            fee: record.return_fee.unwrap_or(0),
            currency: record.currency.clone(),
            received_on: record.date(),
        })
    }

    /// Idempotency key of the fee adjustment entry
    pub fn fee_key(&self) -> String {
        format!("return-fee:{}", self.notice_id)
    }
}

/// Calendar days elapsed since settlement, if still inside the window
pub fn check_return_window(
    settled_on: NaiveDate,
    received_on: NaiveDate,
    limit_days: i64,
) -> LedgerResult<i64> {
    let elapsed_days = (received_on - settled_on).num_days();
    if elapsed_days < 0 {
        return Err(LedgerError::Validation(format!(
            "return received on {} precedes settlement on {}",
            received_on, settled_on
        )));
    }
    if elapsed_days > limit_days {
        return Err(LedgerError::ReturnWindowExpired {
            elapsed_days,
            limit_days,
        });
    }
    Ok(elapsed_days)
}

/// Result of processing one return notice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReturnOutcome {
    Corrected {
        original_entry: EntryId,
        reversal_entry: EntryId,
        fee_entry: Option<EntryId>,
        resolved_exceptions: Vec<ExceptionId>,
    },
    WindowExpired {
        exception: ExceptionId,
        elapsed_days: i64,
    },
    Unmatched {
        exception: ExceptionId,
    },
}

/// Applies return notices to the ledger and the exception queue
#[derive(Clone)]
pub struct ReturnProcessor<S: Store> {
    storage: S,
    ledger: Ledger<S>,
    exceptions: ExceptionService<S>,
    audit: AuditLog<S>,
    return_window_days: i64,
}

impl<S: Store> ReturnProcessor<S> {
    pub fn new(storage: S, ledger: Ledger<S>, return_window_days: i64) -> Self {
        Self {
            exceptions: ExceptionService::new(storage.clone()),
            audit: AuditLog::new(storage.clone()),
            storage,
            ledger,
            return_window_days,
        }
    }

    /// Apply one return notice
    pub async fn process(&self, notice: &ReturnNotice, actor: &str) -> LedgerResult<ReturnOutcome> {
        self.process_tracked(notice, actor)
            .await
            .map(|(outcome, _)| outcome)
    }

    /// Apply one return notice, also returning the exception it newly raised
    #[instrument(
        skip(self, notice),
        fields(notice = %notice.notice_id, original = %notice.original_reference_id)
    )]
    pub async fn process_tracked(
        &self,
        notice: &ReturnNotice,
        actor: &str,
    ) -> LedgerResult<(ReturnOutcome, Option<ReconciliationException>)> {
        let original = ItemRef::External(notice.original_reference_id.clone());
        let notice_ref = ItemRef::External(notice.notice_id.clone());

        let matched = self
            .storage
            .list_matches(None)
            .await?
            .into_iter()
            .find(|m| m.external_id == notice.original_reference_id && m.entry_id.is_some());

        let (outcome, raised) = match matched {
            None => {
                let (exception, created) = self
                    .exceptions
                    .raise_unique(
                        actor,
                        NewException::new(
                            ExceptionReason::UnmatchedReturn,
                            vec![original, notice_ref],
                            format!(
                                "return {} ({}) references payment {} with no matched ledger entry",
                                notice.notice_id, notice.return_code, notice.original_reference_id
                            ),
                        )
                        .with_amount(notice.amount),
                    )
                    .await?;
                let outcome = ReturnOutcome::Unmatched {
                    exception: exception.id,
                };
                (outcome, created.then_some(exception))
            }
            Some(m) => self.apply(notice, &m, original, notice_ref, actor).await?,
        };

        self.audit
            .record::<ReturnNotice, _>(
                actor,
                AuditAction::ReturnProcessed,
                &notice.notice_id,
                Some(notice),
                Some(&outcome),
            )
            .await;
        Ok((outcome, raised))
    }

    async fn apply(
        &self,
        notice: &ReturnNotice,
        matched: &ReconciliationMatch,
        original: ItemRef,
        notice_ref: ItemRef,
        actor: &str,
    ) -> LedgerResult<(ReturnOutcome, Option<ReconciliationException>)> {
        let entry_id = matched.entry_id.ok_or_else(|| {
            LedgerError::Persistence(format!("match {} has no ledger entry", matched.id))
        })?;

        let elapsed_days = match check_return_window(
            matched.settled_on,
            notice.received_on,
            self.return_window_days,
        ) {
            Ok(days) => days,
            Err(LedgerError::ReturnWindowExpired { elapsed_days, .. }) => {
                warn!(elapsed_days, "return received after the return window");
                let (exception, created) = self
                    .exceptions
                    .raise_unique(
                        actor,
                        NewException::new(
                            ExceptionReason::ReturnWindowExpired,
                            vec![original, notice_ref, ItemRef::Entry(entry_id)],
                            format!(
                                "return {} ({}) arrived {} days after settlement; limit is {}",
                                notice.notice_id,
                                notice.return_code,
                                elapsed_days,
                                self.return_window_days
                            ),
                        )
                        .with_amount(notice.amount),
                    )
                    .await?;
                let outcome = ReturnOutcome::WindowExpired {
                    exception: exception.id,
                    elapsed_days,
                };
                return Ok((outcome, created.then_some(exception)));
            }
            Err(e) => return Err(e),
        };

        let reversal_entry = self.reverse_once(entry_id, notice, actor).await?;

        let fee_entry = if notice.fee > 0 {
            let data = TransactionData::new(&notice.notice_id, notice.received_on, &notice.currency)
                .fee(notice.fee)
                .description(&format!(
                    "ACH return fee {} for {}",
                    notice.return_code, notice.original_reference_id
                ));
            let entry = self
                .ledger
                .post_transaction(actor, TransactionType::AchReturn, &data, Some(&notice.fee_key()))
                .await?;
            Some(entry.id)
        } else {
            None
        };

        let resolved_exceptions = self
            .exceptions
            .auto_resolve(&original, reversal_entry, actor)
            .await?;

        info!(
            elapsed_days,
            %reversal_entry,
            resolved = resolved_exceptions.len(),
            "return corrected"
        );
        let outcome = ReturnOutcome::Corrected {
            original_entry: entry_id,
            reversal_entry,
            fee_entry,
            resolved_exceptions,
        };
        Ok((outcome, None))
    }

    /// Reverse the payment entry, or find the reversal of an earlier delivery
    async fn reverse_once(
        &self,
        entry_id: EntryId,
        notice: &ReturnNotice,
        actor: &str,
    ) -> LedgerResult<EntryId> {
        let entry = self.ledger.get_entry_required(entry_id).await?;
        if entry.status == EntryStatus::Reversed {
            let filter = EntryFilter {
                source: Some("reversal".to_string()),
                ..EntryFilter::default()
            };
            return self
                .ledger
                .list_entries(&filter)
                .await?
                .into_iter()
                .find(|e| e.reverses == Some(entry_id))
                .map(|e| e.id)
                .ok_or_else(|| {
                    LedgerError::Persistence(format!(
                        "entry {} is Reversed without a reversal",
                        entry_id
                    ))
                });
        }

        let reversal = self
            .ledger
            .posting()
            .reverse_entry_on(
                entry_id,
                &format!("ACH return {} ({})", notice.return_code, notice.notice_id),
                notice.received_on,
                actor,
            )
            .await?;
        Ok(reversal.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, d).unwrap()
    }

    #[test]
    fn test_return_window() {
        assert_eq!(check_return_window(date(1, 2), date(1, 12), 60), Ok(10));
        assert_eq!(check_return_window(date(1, 2), date(3, 2), 60), Ok(60));
        assert_eq!(
            check_return_window(date(1, 2), date(3, 17), 60),
            Err(LedgerError::ReturnWindowExpired {
                elapsed_days: 75,
                limit_days: 60
            })
        );
        assert!(matches!(
            check_return_window(date(1, 12), date(1, 2), 60),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn test_notice_requires_return_fields() {
        use chrono::{TimeZone, Utc};

        let mut record = ExternalTransactionRecord {
            processor_reference_id: "rt_1".to_string(),
            amount: 150_000,
            currency: "USD".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 12, 9, 0, 0).unwrap(),
            status: ExternalStatus::Returned,
            reference: "order-1".to_string(),
            return_code: Some("R01".to_string()),
            original_reference_id: Some("py_1".to_string()),
            return_fee: Some(500),
        };
        let notice = ReturnNotice::from_record(&record).unwrap();
        assert_eq!(notice.received_on, date(1, 12));
        assert_eq!(notice.fee, 500);
        assert_eq!(notice.fee_key(), "return-fee:rt_1");

        record.return_code = None;
        assert!(ReturnNotice::from_record(&record).is_err());
    }
}
