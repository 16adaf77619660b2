//! Candidate scoring and greedy assignment
//!
//! Matching is a pure function of its inputs. Records are first put in a
//! canonical order, every admissible (record, counterpart) pair is scored,
//! and pairs are taken greedily in a total order so the same record sets
//! always produce the same assignment regardless of input order.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use uuid::Uuid;

use crate::config::{EngineConfig, ScoringConfig};
use crate::reconciliation::records::*;
use crate::types::*;
use crate::utils::calendar::business_days_between;
use crate::utils::money::format_minor_units;

/// Tolerances and scores used when pairing records
#[derive(Debug, Clone, PartialEq)]
pub struct MatchPolicy {
    pub close_date_tolerance_days: u32,
    pub wide_date_tolerance_days: u32,
    pub scoring: ScoringConfig,
    pub require_bank_settlement: bool,
    /// Currency of the bank feed amounts
    pub base_currency: String,
}

impl MatchPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            close_date_tolerance_days: config.reconciliation.close_date_tolerance_days,
            wide_date_tolerance_days: config.reconciliation.wide_date_tolerance_days,
            scoring: config.scoring.clone(),
            require_bank_settlement: config.reconciliation.require_bank_settlement,
            base_currency: config.reconciliation.base_currency.clone(),
        }
    }

    /// Match type and score for a pair with equal amounts, or None when too far apart
    pub fn classify(&self, business_days: u32, exact_reference: bool) -> Option<(MatchType, u8)> {
        if business_days > self.wide_date_tolerance_days {
            None
        } else if exact_reference {
            Some((MatchType::ExactReference, self.scoring.exact_reference))
        } else if business_days <= self.close_date_tolerance_days {
            Some((MatchType::DateProximity, self.scoring.date_proximity))
        } else {
            Some((MatchType::WideDate, self.scoring.wide_date))
        }
    }

    /// Bank records carry no currency and only settle base-currency payments
    fn settles_at_bank(&self, external: &ExternalTransactionRecord) -> bool {
        external.currency == self.base_currency
    }
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Match produced by one matching pass, before it is persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedMatch {
    pub external_id: String,
    pub reference: String,
    pub bank_reference_id: Option<String>,
    pub entry_id: Option<EntryId>,
    pub amount: MinorUnits,
    pub settled_on: NaiveDate,
    pub match_type: MatchType,
    pub confidence: u8,
}

/// Assignments plus everything that could not be reconciled
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchOutcome {
    pub matches: Vec<ProposedMatch>,
    pub exceptions: Vec<NewException>,
    /// Bank records left without a processor record, in canonical order
    pub unmatched_banks: Vec<BankSettlementRecord>,
}

/// Bank record to attach to a match stored without one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementLink {
    pub match_id: Uuid,
    pub external_id: String,
    pub bank_reference_id: String,
    pub settled_on: NaiveDate,
    pub match_type: MatchType,
    pub confidence: u8,
}

#[derive(Debug, Clone)]
struct Candidate<C> {
    confidence: u8,
    amount: MinorUnits,
    date: NaiveDate,
    reference: String,
    external_id: String,
    counterpart: C,
    match_type: MatchType,
}

impl<C: Ord> Candidate<C> {
    #[allow(clippy::type_complexity)]
    fn sort_key(&self) -> (Reverse<u8>, MinorUnits, NaiveDate, &str, &str, &C) {
        (
            Reverse(self.confidence),
            self.amount,
            self.date,
            self.reference.as_str(),
            self.external_id.as_str(),
            &self.counterpart,
        )
    }
}

/// Greedy one-to-one assignment over candidates taken in sort-key order
fn assign<C: Ord + Clone + Hash>(
    mut candidates: Vec<Candidate<C>>,
) -> BTreeMap<String, Candidate<C>> {
    candidates.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    let mut used_counterparts = HashSet::new();
    let mut assigned = BTreeMap::new();
    for candidate in candidates {
        if assigned.contains_key(&candidate.external_id)
            || used_counterparts.contains(&candidate.counterpart)
        {
            continue;
        }
        used_counterparts.insert(candidate.counterpart.clone());
        assigned.insert(candidate.external_id.clone(), candidate);
    }
    assigned
}

fn references_match(external: &ExternalTransactionRecord, reference: &str) -> bool {
    !reference.is_empty()
        && (reference == external.processor_reference_id || reference == external.reference)
}

#[allow(clippy::type_complexity)]
fn external_key(
    r: &ExternalTransactionRecord,
) -> (
    &str,
    DateTime<Utc>,
    MinorUnits,
    &str,
    ExternalStatus,
    &str,
    Option<&str>,
    Option<&str>,
    Option<MinorUnits>,
) {
    (
        r.processor_reference_id.as_str(),
        r.timestamp,
        r.amount,
        r.currency.as_str(),
        r.status,
        r.reference.as_str(),
        r.return_code.as_deref(),
        r.original_reference_id.as_deref(),
        r.return_fee,
    )
}

fn bank_key(r: &BankSettlementRecord) -> (&str, NaiveDate, MinorUnits, &str) {
    (
        r.bank_reference_id.as_str(),
        r.settlement_date,
        r.amount,
        r.reference.as_str(),
    )
}

/// Drop repeated ids, keeping the first in canonical order
fn dedup_by_id<T, K: Eq + Hash + Clone>(
    items: Vec<T>,
    id: impl Fn(&T) -> K,
) -> (Vec<T>, Vec<(K, usize)>) {
    let mut seen: BTreeMap<usize, usize> = BTreeMap::new();
    let mut index = HashMap::new();
    let mut kept = Vec::with_capacity(items.len());
    let mut keys = Vec::new();
    for item in items {
        let key = id(&item);
        match index.get(&key) {
            Some(slot) => *seen.entry(*slot).or_default() += 1,
            None => {
                index.insert(key.clone(), keys.len());
                keys.push(key);
                kept.push(item);
            }
        }
    }
    let duplicates = seen
        .into_iter()
        .map(|(slot, extra)| (keys[slot].clone(), extra))
        .collect();
    (kept, duplicates)
}

/// Match processor records against bank settlements and ledger entries
///
/// `externals` are the settled processor records under reconciliation;
/// `banks` and `entries` are the unmatched counterparts loaded for the
/// widened window. Leftover bank records raise exceptions only when they
/// settled inside `window`.
pub fn match_records(
    policy: &MatchPolicy,
    window: &DateWindow,
    externals: Vec<ExternalTransactionRecord>,
    banks: Vec<BankSettlementRecord>,
    entries: Vec<JournalEntry>,
) -> MatchOutcome {
    let mut outcome = MatchOutcome::default();

    let mut externals = externals;
    externals.sort_by(|a, b| external_key(a).cmp(&external_key(b)));
    let mut banks = banks;
    banks.sort_by(|a, b| bank_key(a).cmp(&bank_key(b)));
    let mut entries = entries;
    entries.sort_by_key(|e| e.id);
    entries.dedup_by_key(|e| e.id);

    let (externals, ext_duplicates) =
        dedup_by_id(externals, |r| r.processor_reference_id.clone());
    let (banks, bank_duplicates) = dedup_by_id(banks, |r| r.bank_reference_id.clone());
    for (id, extra) in ext_duplicates {
        outcome.exceptions.push(NewException::new(
            ExceptionReason::DuplicateRecord,
            vec![ItemRef::External(id.clone())],
            format!("processor record {} delivered {} extra time(s)", id, extra),
        ));
    }
    for (id, extra) in bank_duplicates {
        outcome.exceptions.push(NewException::new(
            ExceptionReason::DuplicateRecord,
            vec![ItemRef::Bank(id.clone())],
            format!("bank record {} delivered {} extra time(s)", id, extra),
        ));
    }

    let mut bank_candidates = Vec::new();
    let mut entry_candidates = Vec::new();
    for external in &externals {
        let date = external.date();
        let settles_at_bank = policy.settles_at_bank(external);
        for bank in banks
            .iter()
            .filter(|b| settles_at_bank && b.amount == external.amount)
        {
            let days = business_days_between(date, bank.settlement_date);
            if let Some((match_type, confidence)) =
                policy.classify(days, references_match(external, &bank.reference))
            {
                bank_candidates.push(Candidate {
                    confidence,
                    amount: external.amount,
                    date,
                    reference: external.reference.clone(),
                    external_id: external.processor_reference_id.clone(),
                    counterpart: bank.bank_reference_id.clone(),
                    match_type,
                });
            }
        }
        for entry in entries
            .iter()
            .filter(|e| e.amount() == external.amount && e.currency == external.currency)
        {
            let days = business_days_between(date, entry.date);
            let exact = entry
                .reference
                .as_deref()
                .is_some_and(|r| references_match(external, r));
            if let Some((match_type, confidence)) = policy.classify(days, exact) {
                entry_candidates.push(Candidate {
                    confidence,
                    amount: external.amount,
                    date,
                    reference: external.reference.clone(),
                    external_id: external.processor_reference_id.clone(),
                    counterpart: entry.id,
                    match_type,
                });
            }
        }
    }

    let bank_links = assign(bank_candidates);
    let entry_links = assign(entry_candidates);

    let mut used_banks: HashSet<String> =
        bank_links.values().map(|c| c.counterpart.clone()).collect();
    let mut used_entries: HashSet<EntryId> =
        entry_links.values().map(|c| c.counterpart).collect();
    let settlement_dates: BTreeMap<&str, NaiveDate> = banks
        .iter()
        .map(|b| (b.bank_reference_id.as_str(), b.settlement_date))
        .collect();

    for external in &externals {
        let id = &external.processor_reference_id;
        let bank_link = bank_links.get(id);
        let entry_link = entry_links.get(id);

        match (bank_link, entry_link) {
            (bank, Some(entry)) => {
                let (match_type, confidence) = match bank {
                    Some(b) => (
                        b.match_type.max(entry.match_type),
                        b.confidence.min(entry.confidence),
                    ),
                    None => (entry.match_type, entry.confidence),
                };
                let bank_id = bank.map(|b| b.counterpart.clone());
                let settled_on = bank_id
                    .as_deref()
                    .and_then(|b| settlement_dates.get(b).copied())
                    .unwrap_or_else(|| external.date());

                if bank.is_none() && policy.require_bank_settlement {
                    let mismatch =
                        find_amount_mismatch_bank(external, &banks, &used_banks, policy);
                    let exception = match mismatch {
                        Some(bank) => {
                            used_banks.insert(bank.bank_reference_id.clone());
                            amount_mismatch(
                                external,
                                ItemRef::Bank(bank.bank_reference_id.clone()),
                                bank.amount,
                            )
                        }
                        None => NewException::new(
                            ExceptionReason::MissingBankRecord,
                            vec![ItemRef::External(id.clone()), ItemRef::Entry(entry.counterpart)],
                            format!("no bank settlement found for processor record {}", id),
                        )
                        .with_amount(external.amount),
                    };
                    outcome.exceptions.push(exception);
                }

                outcome.matches.push(ProposedMatch {
                    external_id: id.clone(),
                    reference: external.reference.clone(),
                    bank_reference_id: bank_id,
                    entry_id: Some(entry.counterpart),
                    amount: external.amount,
                    settled_on,
                    match_type,
                    confidence,
                });
            }
            (bank, None) => {
                let mismatch =
                    find_amount_mismatch_entry(external, &entries, &used_entries, policy);
                let exception = match mismatch {
                    Some(entry) => {
                        used_entries.insert(entry.id);
                        amount_mismatch(external, ItemRef::Entry(entry.id), entry.amount())
                    }
                    None => {
                        let mut items = vec![ItemRef::External(id.clone())];
                        items.extend(bank.map(|b| ItemRef::Bank(b.counterpart.clone())));
                        NewException::new(
                            ExceptionReason::MissingLedgerEntry,
                            items,
                            format!("no ledger entry found for processor record {}", id),
                        )
                        .with_amount(external.amount)
                    }
                };
                outcome.exceptions.push(exception);
            }
        }
    }

    for bank in banks
        .into_iter()
        .filter(|b| !used_banks.contains(&b.bank_reference_id))
    {
        if window.contains(bank.settlement_date) {
            outcome.exceptions.push(
                NewException::new(
                    ExceptionReason::MissingLedgerEntry,
                    vec![ItemRef::Bank(bank.bank_reference_id.clone())],
                    format!(
                        "bank settlement {} has no processor record or ledger entry",
                        bank.bank_reference_id
                    ),
                )
                .with_amount(bank.amount),
            );
        }
        outcome.unmatched_banks.push(bank);
    }

    outcome
}

/// Pair leftover bank records with stored matches that are still waiting for one
///
/// Scoring and greedy order are the same as in [`match_records`]. A link
/// keeps the weaker of the stored and the new match type and confidence.
pub fn link_settlements(
    policy: &MatchPolicy,
    awaiting: &[ReconciliationMatch],
    banks: &[BankSettlementRecord],
) -> Vec<SettlementLink> {
    let mut banks: Vec<&BankSettlementRecord> = banks.iter().collect();
    banks.sort_by(|a, b| bank_key(a).cmp(&bank_key(b)));
    banks.dedup_by(|a, b| a.bank_reference_id == b.bank_reference_id);

    let mut candidates = Vec::new();
    for stored in awaiting.iter().filter(|m| m.bank_reference_id.is_none()) {
        for bank in banks.iter().filter(|b| b.amount == stored.amount) {
            let days = business_days_between(stored.settled_on, bank.settlement_date);
            let exact = !bank.reference.is_empty()
                && (bank.reference == stored.external_id || bank.reference == stored.reference);
            if let Some((match_type, confidence)) = policy.classify(days, exact) {
                candidates.push(Candidate {
                    confidence,
                    amount: stored.amount,
                    date: stored.settled_on,
                    reference: stored.reference.clone(),
                    external_id: stored.external_id.clone(),
                    counterpart: bank.bank_reference_id.clone(),
                    match_type,
                });
            }
        }
    }

    let by_external: HashMap<&str, &ReconciliationMatch> = awaiting
        .iter()
        .map(|m| (m.external_id.as_str(), m))
        .collect();
    let settlement_dates: HashMap<&str, NaiveDate> = banks
        .iter()
        .map(|b| (b.bank_reference_id.as_str(), b.settlement_date))
        .collect();

    assign(candidates)
        .into_values()
        .filter_map(|c| {
            let existing = by_external.get(c.external_id.as_str())?;
            let settled_on = *settlement_dates.get(c.counterpart.as_str())?;
            Some(SettlementLink {
                match_id: existing.id,
                external_id: c.external_id,
                bank_reference_id: c.counterpart,
                settled_on,
                match_type: existing.match_type.max(c.match_type),
                confidence: existing.confidence.min(c.confidence),
            })
        })
        .collect()
}

fn amount_mismatch(
    external: &ExternalTransactionRecord,
    counterpart: ItemRef,
    amount: MinorUnits,
) -> NewException {
    NewException::new(
        ExceptionReason::AmountMismatch,
        vec![ItemRef::External(external.processor_reference_id.clone()), counterpart],
        format!(
            "processor record {} is {} but its counterpart is {}",
            external.processor_reference_id,
            format_minor_units(external.amount),
            format_minor_units(amount)
        ),
    )
    .with_amount(external.amount - amount)
}

fn find_amount_mismatch_entry<'a>(
    external: &ExternalTransactionRecord,
    entries: &'a [JournalEntry],
    used: &HashSet<EntryId>,
    policy: &MatchPolicy,
) -> Option<&'a JournalEntry> {
    entries.iter().find(|e| {
        !used.contains(&e.id)
            && e.amount() != external.amount
            && e.reference.as_deref().is_some_and(|r| references_match(external, r))
            && business_days_between(external.date(), e.date) <= policy.wide_date_tolerance_days
    })
}

fn find_amount_mismatch_bank<'a>(
    external: &ExternalTransactionRecord,
    banks: &'a [BankSettlementRecord],
    used: &HashSet<String>,
    policy: &MatchPolicy,
) -> Option<&'a BankSettlementRecord> {
    if !policy.settles_at_bank(external) {
        return None;
    }
    banks.iter().find(|b| {
        !used.contains(&b.bank_reference_id)
            && b.amount != external.amount
            && references_match(external, &b.reference)
            && business_days_between(external.date(), b.settlement_date)
                <= policy.wide_date_tolerance_days
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn window() -> DateWindow {
        DateWindow::new(day(1), day(31)).unwrap()
    }

    fn external(
        id: &str,
        amount: MinorUnits,
        d: u32,
        reference: &str,
    ) -> ExternalTransactionRecord {
        ExternalTransactionRecord {
            processor_reference_id: id.to_string(),
            amount,
            currency: "USD".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, d, 15, 30, 0).unwrap(),
            status: ExternalStatus::Succeeded,
            reference: reference.to_string(),
            return_code: None,
            original_reference_id: None,
            return_fee: None,
        }
    }

    fn bank(id: &str, amount: MinorUnits, d: u32, reference: &str) -> BankSettlementRecord {
        BankSettlementRecord {
            bank_reference_id: id.to_string(),
            amount,
            settlement_date: day(d),
            reference: reference.to_string(),
        }
    }

    fn entry(id: u64, amount: MinorUnits, d: u32, reference: Option<&str>) -> JournalEntry {
        let mut candidate = CandidateEntry::new(day(d), "payment", "ach_payment", "USD");
        candidate.reference = reference.map(str::to_string);
        candidate.lines = vec![
            JournalLine::debit("cash_in_transit", amount),
            JournalLine::credit("accounts_receivable", amount),
        ];
        JournalEntry::from_candidate(EntryId(id), candidate, EntryStatus::Posted)
    }

    #[test]
    fn test_date_proximity_match() {
        // Friday processor record, Thursday ledger entry
        let outcome = match_records(
            &MatchPolicy {
                require_bank_settlement: false,
                ..MatchPolicy::default()
            },
            &window(),
            vec![external("py_1", 25_000, 5, "order-1")],
            vec![],
            vec![entry(1, 25_000, 4, None)],
        );

        assert_eq!(outcome.matches.len(), 1);
        let m = &outcome.matches[0];
        assert_eq!(m.entry_id, Some(EntryId(1)));
        assert_eq!(m.match_type, MatchType::DateProximity);
        assert_eq!(m.confidence, 90);
        assert!(outcome.exceptions.is_empty());
    }

    #[test]
    fn test_exact_reference_beats_closer_date() {
        let outcome = match_records(
            &MatchPolicy::default(),
            &window(),
            vec![external("py_1", 1_000, 10, "order-1")],
            vec![bank("b1", 1_000, 10, "other"), bank("b2", 1_000, 12, "order-1")],
            vec![entry(1, 1_000, 10, Some("py_1"))],
        );

        let m = &outcome.matches[0];
        assert_eq!(m.bank_reference_id.as_deref(), Some("b2"));
        assert_eq!(m.settled_on, day(12));
        assert_eq!(m.match_type, MatchType::ExactReference);
        assert_eq!(m.confidence, 100);

        // b1 settled in the window with nothing to match
        assert_eq!(outcome.exceptions.len(), 1);
        assert_eq!(outcome.exceptions[0].reason, ExceptionReason::MissingLedgerEntry);
        assert_eq!(outcome.exceptions[0].items, vec![ItemRef::Bank("b1".to_string())]);
    }

    #[test]
    fn test_weakest_link_sets_match_type() {
        let outcome = match_records(
            &MatchPolicy::default(),
            &window(),
            vec![external("py_1", 1_000, 8, "order-1")],
            vec![bank("b1", 1_000, 12, "x")],
            vec![entry(1, 1_000, 8, Some("py_1"))],
        );
        let m = &outcome.matches[0];
        assert_eq!(m.match_type, MatchType::WideDate);
        assert_eq!(m.confidence, 60);
    }

    #[test]
    fn test_outside_wide_tolerance_is_missing() {
        let outcome = match_records(
            &MatchPolicy::default(),
            &window(),
            vec![external("py_1", 1_000, 2, "order-1")],
            vec![],
            vec![entry(1, 1_000, 22, None)],
        );
        assert!(outcome.matches.is_empty());
        assert_eq!(outcome.exceptions[0].reason, ExceptionReason::MissingLedgerEntry);
    }

    #[test]
    fn test_missing_bank_record_when_required() {
        let outcome = match_records(
            &MatchPolicy::default(),
            &window(),
            vec![external("py_1", 1_000, 3, "order-1")],
            vec![],
            vec![entry(7, 1_000, 3, None)],
        );
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.exceptions.len(), 1);
        assert_eq!(outcome.exceptions[0].reason, ExceptionReason::MissingBankRecord);
        assert_eq!(
            outcome.exceptions[0].items,
            vec![ItemRef::External("py_1".to_string()), ItemRef::Entry(EntryId(7))]
        );
    }

    #[test]
    fn test_amount_mismatch_by_reference() {
        let outcome = match_records(
            &MatchPolicy::default(),
            &window(),
            vec![external("py_1", 1_000, 3, "order-1")],
            vec![bank("b1", 1_000, 4, "order-1")],
            vec![entry(3, 990, 3, Some("py_1"))],
        );
        assert!(outcome.matches.is_empty());
        assert_eq!(outcome.exceptions.len(), 1);
        let exception = &outcome.exceptions[0];
        assert_eq!(exception.reason, ExceptionReason::AmountMismatch);
        assert_eq!(exception.amount, Some(10));
    }

    #[test]
    fn test_duplicate_records_flagged_once() {
        let record = external("py_1", 1_000, 3, "order-1");
        let outcome = match_records(
            &MatchPolicy::default(),
            &window(),
            vec![record.clone(), record],
            vec![bank("b1", 1_000, 4, "order-1")],
            vec![entry(1, 1_000, 3, None)],
        );
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.exceptions.len(), 1);
        assert_eq!(outcome.exceptions[0].reason, ExceptionReason::DuplicateRecord);
    }

    #[test]
    fn test_duplicates_differing_in_currency_dedup_the_same_way() {
        let usd = external("py_1", 1_000, 3, "order-1");
        let mut eur = usd.clone();
        eur.currency = "EUR".to_string();

        let forward = match_records(
            &MatchPolicy::default(),
            &window(),
            vec![usd.clone(), eur.clone()],
            vec![],
            vec![entry(1, 1_000, 3, None)],
        );
        let backward = match_records(
            &MatchPolicy::default(),
            &window(),
            vec![eur, usd],
            vec![],
            vec![entry(1, 1_000, 3, None)],
        );

        assert_eq!(forward, backward);
        assert!(forward
            .exceptions
            .iter()
            .any(|e| e.reason == ExceptionReason::DuplicateRecord));
    }

    #[test]
    fn test_foreign_currency_never_pairs_with_bank() {
        let mut record = external("py_1", 1_000, 3, "order-1");
        record.currency = "EUR".to_string();
        let mut eur_entry = entry(1, 1_000, 3, Some("py_1"));
        eur_entry.currency = "EUR".to_string();

        let outcome = match_records(
            &MatchPolicy::default(),
            &window(),
            vec![record],
            vec![bank("b1", 1_000, 4, "order-1")],
            vec![eur_entry],
        );

        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].bank_reference_id, None);
        let reasons: Vec<_> = outcome.exceptions.iter().map(|e| e.reason).collect();
        assert_eq!(
            reasons,
            vec![ExceptionReason::MissingBankRecord, ExceptionReason::MissingLedgerEntry]
        );
        assert_eq!(outcome.unmatched_banks.len(), 1);
    }

    fn stored_match(external_id: &str, amount: MinorUnits, d: u32) -> ReconciliationMatch {
        ReconciliationMatch {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            external_id: external_id.to_string(),
            reference: "order-1".to_string(),
            bank_reference_id: None,
            entry_id: Some(EntryId(1)),
            amount,
            settled_on: day(d),
            match_type: MatchType::ExactReference,
            confidence: 100,
            matched_at: Utc::now(),
        }
    }

    #[test]
    fn test_late_bank_record_links_to_stored_match() {
        let stored = stored_match("py_1", 1_000, 2);
        let links = link_settlements(
            &MatchPolicy::default(),
            std::slice::from_ref(&stored),
            &[bank("b0", 2_000, 4, "order-1"), bank("b1", 1_000, 4, "order-1")],
        );

        assert_eq!(
            links,
            vec![SettlementLink {
                match_id: stored.id,
                external_id: "py_1".to_string(),
                bank_reference_id: "b1".to_string(),
                settled_on: day(4),
                match_type: MatchType::ExactReference,
                confidence: 100,
            }]
        );
    }

    #[test]
    fn test_late_link_keeps_weakest_type_and_one_bank_per_match() {
        let mut first = stored_match("py_1", 1_000, 2);
        first.match_type = MatchType::DateProximity;
        first.confidence = 90;
        let mut second = stored_match("py_2", 1_000, 2);
        second.reference = "order-2".to_string();
        let mut settled = stored_match("py_3", 1_000, 2);
        settled.bank_reference_id = Some("b9".to_string());

        let links = link_settlements(
            &MatchPolicy::default(),
            &[first, second, settled],
            &[bank("b1", 1_000, 4, "order-1")],
        );

        assert_eq!(links.len(), 1);
        assert_eq!(links[0].external_id, "py_1");
        assert_eq!(links[0].match_type, MatchType::DateProximity);
        assert_eq!(links[0].confidence, 90);
    }

    #[test]
    fn test_currency_must_agree() {
        let mut record = external("py_1", 1_000, 3, "order-1");
        record.currency = "EUR".to_string();
        let outcome = match_records(
            &MatchPolicy::default(),
            &window(),
            vec![record],
            vec![],
            vec![entry(1, 1_000, 3, None)],
        );
        assert!(outcome.matches.is_empty());
    }

    type Inputs = (
        Vec<ExternalTransactionRecord>,
        Vec<BankSettlementRecord>,
        Vec<JournalEntry>,
    );

    fn arb_inputs() -> impl Strategy<Value = Inputs> {
        let amounts = prop::sample::select(vec![1_000i64, 2_500, 5_000]);
        let externals = prop::collection::vec((amounts.clone(), 1u32..28), 1..8).prop_map(|v| {
            v.into_iter()
                .enumerate()
                .map(|(i, (amount, d))| {
                    external(&format!("py_{}", i), amount, d, &format!("order-{}", i))
                })
                .collect::<Vec<_>>()
        });
        let banks = prop::collection::vec((amounts.clone(), 1u32..28, 0usize..10), 0..8)
            .prop_map(|v| {
                v.into_iter()
                    .enumerate()
                    .map(|(i, (amount, d, r))| {
                        bank(&format!("b{}", i), amount, d, &format!("order-{}", r))
                    })
                    .collect::<Vec<_>>()
            });
        let references = prop::option::of(0usize..10);
        let entries = prop::collection::vec((amounts, 1u32..28, references), 0..8)
            .prop_map(|v| {
                v.into_iter()
                    .enumerate()
                    .map(|(i, (amount, d, r))| {
                        let reference = r.map(|r| format!("py_{}", r));
                        entry(i as u64 + 1, amount, d, reference.as_deref())
                    })
                    .collect::<Vec<_>>()
            });
        (externals, banks, entries)
    }

    proptest! {
        #[test]
        fn prop_assignment_is_order_independent(
            (inputs, shuffled) in arb_inputs().prop_flat_map(|(e, b, j)| {
                let shuffled = (
                    Just(e.clone()).prop_shuffle(),
                    Just(b.clone()).prop_shuffle(),
                    Just(j.clone()).prop_shuffle(),
                );
                (Just((e, b, j)), shuffled)
            })
        ) {
            let policy = MatchPolicy::default();
            let a = match_records(&policy, &window(), inputs.0, inputs.1, inputs.2);
            let b = match_records(&policy, &window(), shuffled.0, shuffled.1, shuffled.2);
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_matches_are_injective((externals, banks, entries) in arb_inputs()) {
            let outcome =
                match_records(&MatchPolicy::default(), &window(), externals, banks, entries);
            let mut seen_ext = HashSet::new();
            let mut seen_bank = HashSet::new();
            let mut seen_entry = HashSet::new();
            for m in &outcome.matches {
                prop_assert!(seen_ext.insert(m.external_id.clone()));
                if let Some(b) = &m.bank_reference_id {
                    prop_assert!(seen_bank.insert(b.clone()));
                }
                if let Some(e) = m.entry_id {
                    prop_assert!(seen_entry.insert(e));
                }
            }
        }
    }
}
