//! Ledger orchestrator tying templates to the posting service

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;

use crate::ledger::posting::PostingService;
use crate::ledger::templates::{
    Preview, Template, TemplateRegistry, TransactionData, TransactionType,
};
use crate::traits::*;
use crate::types::*;

/// Main ledger system: template selection, posting and balances
#[derive(Clone)]
pub struct Ledger<S: LedgerStorage + AuditStorage> {
    templates: Arc<TemplateRegistry>,
    posting: PostingService<S>,
}

impl<S: LedgerStorage + AuditStorage + Clone> Ledger<S> {
    /// Create a ledger; fails if a template posts to an account missing from the chart
    pub fn new(
        storage: S,
        chart: Arc<dyn ChartOfAccounts>,
        templates: Arc<TemplateRegistry>,
    ) -> LedgerResult<Self> {
        templates.verify_accounts(chart.as_ref())?;
        Ok(Self {
            templates,
            posting: PostingService::new(storage, chart),
        })
    }

    /// Create a ledger around an already configured posting service
    pub fn with_posting(
        posting: PostingService<S>,
        templates: Arc<TemplateRegistry>,
    ) -> LedgerResult<Self> {
        templates.verify_accounts(posting.chart().as_ref())?;
        Ok(Self { templates, posting })
    }

    pub fn posting(&self) -> &PostingService<S> {
        &self.posting
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    pub fn find_applicable_templates(
        &self,
        transaction_type: TransactionType,
        data: &TransactionData,
    ) -> LedgerResult<Vec<&Template>> {
        self.templates.find_applicable_templates(transaction_type, data)
    }

    /// Preview with a specific template
    pub fn generate_preview(
        &self,
        template_id: &str,
        data: &TransactionData,
    ) -> LedgerResult<Preview> {
        self.templates
            .generate_preview(template_id, data, self.posting.chart().as_ref())
    }

    /// Preview with the highest-priority applicable template
    pub fn preview(
        &self,
        transaction_type: TransactionType,
        data: &TransactionData,
    ) -> LedgerResult<Preview> {
        self.templates
            .prepare(transaction_type, data, self.posting.chart().as_ref())
    }

    /// Template an event and post the result
    ///
    /// The idempotency key defaults to the event's transaction id, so a
    /// redelivered event posts at most once.
    pub async fn post_transaction(
        &self,
        actor: &str,
        transaction_type: TransactionType,
        data: &TransactionData,
        idempotency_key: Option<&str>,
    ) -> LedgerResult<JournalEntry> {
        let preview = self.preview(transaction_type, data)?;
        if !preview.validation.is_valid {
            return Err(LedgerError::Validation(preview.validation.errors.join("; ")));
        }

        let key = idempotency_key.unwrap_or(&data.transaction_id);
        info!(template = %preview.template_id, key, "posting templated entry");
        self.posting
            .post_entry_as(actor, preview.candidate, Some(key))
            .await
            .map(|(entry, _)| entry)
    }

    pub async fn get_entry(&self, id: EntryId) -> LedgerResult<Option<JournalEntry>> {
        self.posting.get_entry(id).await
    }

    /// Get an entry by id, returning an error if not found
    pub async fn get_entry_required(&self, id: EntryId) -> LedgerResult<JournalEntry> {
        self.posting
            .get_entry(id)
            .await?
            .ok_or(LedgerError::EntryNotFound(id))
    }

    pub async fn list_entries(&self, filter: &EntryFilter) -> LedgerResult<Vec<JournalEntry>> {
        self.posting.list_entries(filter).await
    }

    /// Committed entries up to a date; reversed originals still count since
    /// their reversing entries offset them
    async fn committed_entries(
        &self,
        as_of_date: Option<NaiveDate>,
    ) -> LedgerResult<Vec<JournalEntry>> {
        let entries = self.list_entries(&EntryFilter::default()).await?;
        Ok(entries
            .into_iter()
            .filter(|e| matches!(e.status, EntryStatus::Posted | EntryStatus::Reversed))
            .filter(|e| as_of_date.is_none_or(|d| e.date <= d))
            .collect())
    }

    /// Balance of one account in its normal direction
    pub async fn account_balance(
        &self,
        account_id: &str,
        as_of_date: Option<NaiveDate>,
    ) -> LedgerResult<MinorUnits> {
        let account = self
            .posting
            .chart()
            .get_account(account_id)
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))?;

        let signed: MinorUnits = self
            .committed_entries(as_of_date)
            .await?
            .iter()
            .flat_map(|e| e.lines.iter())
            .filter(|l| l.account_id == account_id)
            .map(JournalLine::signed_amount)
            .sum();

        Ok(match account.account_type.normal_balance() {
            EntryType::Debit => signed,
            EntryType::Credit => -signed,
        })
    }

    /// Signed balance of every account touched up to `as_of_date`
    pub async fn trial_balance(&self, as_of_date: NaiveDate) -> LedgerResult<TrialBalance> {
        let mut balances: BTreeMap<String, MinorUnits> = BTreeMap::new();
        for entry in self.committed_entries(Some(as_of_date)).await? {
            for line in &entry.lines {
                *balances.entry(line.account_id.clone()).or_default() += line.signed_amount();
            }
        }

        let total_debits: MinorUnits = balances.values().filter(|b| **b > 0).sum();
        let total_credits: MinorUnits = balances.values().filter(|b| **b < 0).map(|b| -b).sum();

        Ok(TrialBalance {
            as_of_date,
            balances,
            total_debits,
            total_credits,
            is_balanced: total_debits == total_credits,
        })
    }

    /// Check the double-entry and reversal invariants over the stored ledger
    pub async fn validate_integrity(
        &self,
        as_of_date: NaiveDate,
    ) -> LedgerResult<LedgerIntegrityReport> {
        let trial_balance = self.trial_balance(as_of_date).await?;
        let entries = self.list_entries(&EntryFilter::default()).await?;
        let mut issues = Vec::new();

        if !trial_balance.is_balanced {
            issues.push(format!(
                "Trial balance is not balanced: debits = {}, credits = {}",
                trial_balance.total_debits, trial_balance.total_credits
            ));
        }

        let by_id: HashMap<EntryId, &JournalEntry> = entries.iter().map(|e| (e.id, e)).collect();
        let mut reversals: HashMap<EntryId, usize> = HashMap::new();

        for entry in &entries {
            if !entry.is_balanced() {
                issues.push(format!(
                    "Entry {} is unbalanced: debits = {}, credits = {}",
                    entry.id,
                    entry.total_debits(),
                    entry.total_credits()
                ));
            }
            if let Some(original) = entry.reverses {
                *reversals.entry(original).or_default() += 1;
                match by_id.get(&original) {
                    Some(o) if o.status == EntryStatus::Reversed => {}
                    Some(o) => issues.push(format!(
                        "Entry {} reverses {} which is {:?}",
                        entry.id, original, o.status
                    )),
                    None => issues.push(format!(
                        "Entry {} reverses unknown entry {}",
                        entry.id, original
                    )),
                }
            }
        }

        for entry in entries.iter().filter(|e| e.status == EntryStatus::Reversed) {
            let count = reversals.get(&entry.id).copied().unwrap_or(0);
            if count != 1 {
                issues.push(format!(
                    "Entry {} is Reversed but has {} reversing entries",
                    entry.id, count
                ));
            }
        }

        Ok(LedgerIntegrityReport {
            as_of_date,
            is_valid: issues.is_empty(),
            issues,
            total_debits: trial_balance.total_debits,
            total_credits: trial_balance.total_credits,
            entries_checked: entries.len(),
        })
    }
}

/// Report on ledger integrity and validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerIntegrityReport {
    pub as_of_date: NaiveDate,
    pub is_valid: bool,
    pub issues: Vec<String>,
    pub total_debits: MinorUnits,
    pub total_credits: MinorUnits,
    pub entries_checked: usize,
}
