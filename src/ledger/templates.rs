//! Journal templates: from a payment event to balanced candidate lines
//!
//! Each [`TransactionType`] is bound to its templates by an exhaustive
//! `match` in [`standard_templates`], so adding a transaction type without
//! line rules does not compile. The registry is built once at startup and
//! shared immutably; generating a preview has no side effects.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::config::AccountCodes;
use crate::traits::ChartOfAccounts;
use crate::types::*;
use crate::utils::money::parse_amount;

/// Payment event kinds the engine knows how to journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    AchPayment,
    CardPayment,
    Refund,
    Chargeback,
    /// Fee adjustment booked when an ACH payment is returned
    AchReturn,
    /// Settlement sweep from the clearing account into cash
    Payout,
}

impl TransactionType {
    pub const ALL: [TransactionType; 6] = [
        TransactionType::AchPayment,
        TransactionType::CardPayment,
        TransactionType::Refund,
        TransactionType::Chargeback,
        TransactionType::AchReturn,
        TransactionType::Payout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::AchPayment => "ach_payment",
            TransactionType::CardPayment => "card_payment",
            TransactionType::Refund => "refund",
            TransactionType::Chargeback => "chargeback",
            TransactionType::AchReturn => "ach_return",
            TransactionType::Payout => "payout",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields a template may require from the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataField {
    Amount,
    Fee,
}

impl DataField {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataField::Amount => "amount",
            DataField::Fee => "fee",
        }
    }
}

/// Event payload read by templates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionData {
    /// Processor transaction id; becomes the entry reference
    pub transaction_id: String,
    pub date: NaiveDate,
    pub currency: String,
    pub amount: Option<MinorUnits>,
    pub fee: Option<MinorUnits>,
    pub description: Option<String>,
}

impl TransactionData {
    pub fn new(transaction_id: &str, date: NaiveDate, currency: &str) -> Self {
        Self {
            transaction_id: transaction_id.to_string(),
            date,
            currency: currency.to_string(),
            amount: None,
            fee: None,
            description: None,
        }
    }

    pub fn amount(mut self, amount: MinorUnits) -> Self {
        self.amount = Some(amount);
        self
    }

    /// Gross amount from a decimal string such as "1500.00"
    pub fn decimal_amount(self, text: &str) -> LedgerResult<Self> {
        Ok(self.amount(parse_amount(text)?))
    }

    pub fn fee(mut self, fee: MinorUnits) -> Self {
        self.fee = Some(fee);
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    fn has(&self, field: DataField) -> bool {
        match field {
            DataField::Amount => self.amount.is_some(),
            DataField::Fee => self.fee.is_some(),
        }
    }

    fn has_positive_fee(&self) -> bool {
        self.fee.is_some_and(|fee| fee > 0)
    }
}

/// Ledger account a rule posts to, resolved through the chart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountRole {
    Cash,
    CashInTransit,
    AccountsReceivable,
    CustomerRefunds,
    ProcessorFees,
    ReturnFees,
    ChargebackLosses,
}

impl AccountRole {
    pub fn code<'a>(&self, codes: &'a AccountCodes) -> &'a str {
        match self {
            AccountRole::Cash => &codes.cash,
            AccountRole::CashInTransit => &codes.cash_in_transit,
            AccountRole::AccountsReceivable => &codes.accounts_receivable,
            AccountRole::CustomerRefunds => &codes.customer_refunds,
            AccountRole::ProcessorFees => &codes.processor_fees,
            AccountRole::ReturnFees => &codes.return_fees,
            AccountRole::ChargebackLosses => &codes.chargeback_losses,
        }
    }
}

/// Where a line takes its amount from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmountSource {
    Gross,
    Fee,
    /// Gross minus fee
    Net,
    /// Gross plus fee
    GrossWithFee,
}

impl AmountSource {
    fn resolve(&self, data: &TransactionData) -> LedgerResult<MinorUnits> {
        let gross = || {
            data.amount.ok_or_else(|| {
                LedgerError::Validation("missing required field(s): amount".to_string())
            })
        };
        let fee = || {
            data.fee.ok_or_else(|| {
                LedgerError::Validation("missing required field(s): fee".to_string())
            })
        };
        match self {
            AmountSource::Gross => gross(),
            AmountSource::Fee => fee(),
            AmountSource::Net => {
                let (gross, fee) = (gross()?, fee()?);
                if fee > gross {
                    return Err(LedgerError::Validation(format!(
                        "fee {} exceeds gross amount {}",
                        fee, gross
                    )));
                }
                Ok(gross - fee)
            }
            AmountSource::GrossWithFee => gross()?
                .checked_add(fee()?)
                .ok_or_else(|| LedgerError::Validation("amount overflow".to_string())),
        }
    }
}

/// One line produced by a template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRule {
    pub role: AccountRole,
    pub side: EntryType,
    pub amount: AmountSource,
    pub memo: &'static str,
}

const fn debit(role: AccountRole, amount: AmountSource, memo: &'static str) -> LineRule {
    LineRule {
        role,
        side: EntryType::Debit,
        amount,
        memo,
    }
}

const fn credit(role: AccountRole, amount: AmountSource, memo: &'static str) -> LineRule {
    LineRule {
        role,
        side: EntryType::Credit,
        amount,
        memo,
    }
}

/// Journal template: predicate, priority and ordered line rules
#[derive(Debug, Clone)]
pub struct Template {
    pub id: &'static str,
    pub transaction_type: TransactionType,
    pub description: &'static str,
    /// Higher wins when several templates apply
    pub priority: i32,
    pub required_fields: &'static [DataField],
    predicate: fn(&TransactionData) -> bool,
    rules: &'static [LineRule],
}

impl Template {
    pub fn new(
        id: &'static str,
        transaction_type: TransactionType,
        description: &'static str,
        priority: i32,
        required_fields: &'static [DataField],
        predicate: fn(&TransactionData) -> bool,
        rules: &'static [LineRule],
    ) -> Self {
        Self {
            id,
            transaction_type,
            description,
            priority,
            required_fields,
            predicate,
            rules,
        }
    }

    pub fn applies_to(&self, data: &TransactionData) -> bool {
        (self.predicate)(data)
    }

    pub fn rules(&self) -> &[LineRule] {
        self.rules
    }

    fn missing_fields(&self, data: &TransactionData) -> Vec<&'static str> {
        self.required_fields
            .iter()
            .filter(|f| !data.has(**f))
            .map(DataField::as_str)
            .collect()
    }
}

fn always(_: &TransactionData) -> bool {
    true
}

fn with_fee(data: &TransactionData) -> bool {
    data.has_positive_fee()
}

const PAYMENT_GROSS: &[LineRule] = &[
    debit(AccountRole::CashInTransit, AmountSource::Gross, "funds in transit"),
    credit(AccountRole::AccountsReceivable, AmountSource::Gross, "receivable settled"),
];

const PAYMENT_NET_OF_FEE: &[LineRule] = &[
    debit(AccountRole::CashInTransit, AmountSource::Net, "funds in transit"),
    debit(AccountRole::ProcessorFees, AmountSource::Fee, "processor fee"),
    credit(AccountRole::AccountsReceivable, AmountSource::Gross, "receivable settled"),
];

const REFUND: &[LineRule] = &[
    debit(AccountRole::CustomerRefunds, AmountSource::Gross, "refund issued"),
    credit(AccountRole::CashInTransit, AmountSource::Gross, "refund paid out"),
];

const CHARGEBACK: &[LineRule] = &[
    debit(AccountRole::ChargebackLosses, AmountSource::Gross, "disputed amount"),
    credit(AccountRole::CashInTransit, AmountSource::Gross, "funds withdrawn"),
];

const CHARGEBACK_WITH_FEE: &[LineRule] = &[
    debit(AccountRole::ChargebackLosses, AmountSource::Gross, "disputed amount"),
    debit(AccountRole::ProcessorFees, AmountSource::Fee, "chargeback fee"),
    credit(AccountRole::CashInTransit, AmountSource::GrossWithFee, "funds withdrawn"),
];

const RETURN_FEE: &[LineRule] = &[
    debit(AccountRole::ReturnFees, AmountSource::Fee, "return fee"),
    credit(AccountRole::Cash, AmountSource::Fee, "fee debited by bank"),
];

const PAYOUT: &[LineRule] = &[
    debit(AccountRole::Cash, AmountSource::Gross, "settled to bank"),
    credit(AccountRole::CashInTransit, AmountSource::Gross, "clearing released"),
];

/// Built-in templates for one transaction type
pub fn standard_templates(transaction_type: TransactionType) -> Vec<Template> {
    use DataField::*;
    use TransactionType as T;

    match transaction_type {
        T::AchPayment => vec![
            Template::new(
                "ach_payment",
                T::AchPayment,
                "ACH payment",
                10,
                &[Amount],
                always,
                PAYMENT_GROSS,
            ),
            Template::new(
                "ach_payment_net_of_fee",
                T::AchPayment,
                "ACH payment net of processor fee",
                20,
                &[Amount, Fee],
                with_fee,
                PAYMENT_NET_OF_FEE,
            ),
        ],
        T::CardPayment => vec![
            Template::new(
                "card_payment",
                T::CardPayment,
                "Card payment",
                10,
                &[Amount],
                always,
                PAYMENT_GROSS,
            ),
            Template::new(
                "card_payment_net_of_fee",
                T::CardPayment,
                "Card payment net of processor fee",
                20,
                &[Amount, Fee],
                with_fee,
                PAYMENT_NET_OF_FEE,
            ),
        ],
        T::Refund => vec![Template::new(
            "refund",
            T::Refund,
            "Customer refund",
            10,
            &[Amount],
            always,
            REFUND,
        )],
        T::Chargeback => vec![
            Template::new(
                "chargeback",
                T::Chargeback,
                "Chargeback",
                10,
                &[Amount],
                always,
                CHARGEBACK,
            ),
            Template::new(
                "chargeback_with_fee",
                T::Chargeback,
                "Chargeback with dispute fee",
                20,
                &[Amount, Fee],
                with_fee,
                CHARGEBACK_WITH_FEE,
            ),
        ],
        T::AchReturn => vec![Template::new(
            "ach_return_fee",
            T::AchReturn,
            "ACH return fee adjustment",
            10,
            &[Fee],
            with_fee,
            RETURN_FEE,
        )],
        T::Payout => vec![Template::new(
            "payout",
            T::Payout,
            "Processor payout",
            10,
            &[Amount],
            always,
            PAYOUT,
        )],
    }
}

/// Candidate lines for one template plus their validation result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preview {
    pub template_id: String,
    pub transaction_type: TransactionType,
    pub candidate: CandidateEntry,
    pub validation: PreviewValidation,
}

impl Preview {
    /// The preview as an unpersisted Draft entry
    pub fn as_draft(&self) -> JournalEntry {
        JournalEntry::from_candidate(EntryId(0), self.candidate.clone(), EntryStatus::Draft)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewValidation {
    pub is_valid: bool,
    pub total_debits: MinorUnits,
    pub total_credits: MinorUnits,
    pub errors: Vec<String>,
}

/// Immutable set of templates
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: Vec<Template>,
    codes: AccountCodes,
}

impl TemplateRegistry {
    /// Registry holding the built-in templates for every transaction type
    pub fn standard(codes: AccountCodes) -> LedgerResult<Self> {
        let templates = TransactionType::ALL
            .iter()
            .flat_map(|t| standard_templates(*t))
            .collect();
        Self::new(templates, codes)
    }

    /// Registry over custom templates; ids must be unique
    pub fn new(templates: Vec<Template>, codes: AccountCodes) -> LedgerResult<Self> {
        let mut ids = HashSet::new();
        for template in &templates {
            if !ids.insert(template.id) {
                return Err(LedgerError::Validation(format!(
                    "duplicate template id '{}'",
                    template.id
                )));
            }
            if template.rules.is_empty() {
                return Err(LedgerError::Validation(format!(
                    "template '{}' has no line rules",
                    template.id
                )));
            }
        }
        Ok(Self { templates, codes })
    }

    pub fn get(&self, template_id: &str) -> Option<&Template> {
        self.templates.iter().find(|t| t.id == template_id)
    }

    pub fn templates(&self) -> &[Template] {
        &self.templates
    }

    pub fn codes(&self) -> &AccountCodes {
        &self.codes
    }

    /// Check that every account role used by a template resolves in the chart
    pub fn verify_accounts(&self, chart: &dyn ChartOfAccounts) -> LedgerResult<()> {
        for template in &self.templates {
            for rule in template.rules {
                chart.resolve_account_id(rule.role.code(&self.codes))?;
            }
        }
        Ok(())
    }

    /// Templates whose predicate accepts `data`, highest priority first
    pub fn find_applicable_templates(
        &self,
        transaction_type: TransactionType,
        data: &TransactionData,
    ) -> LedgerResult<Vec<&Template>> {
        let mut applicable: Vec<&Template> = self
            .templates
            .iter()
            .filter(|t| t.transaction_type == transaction_type && t.applies_to(data))
            .collect();

        if applicable.is_empty() {
            return Err(LedgerError::NoApplicableTemplate(
                transaction_type.to_string(),
            ));
        }

        applicable.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(b.id)));
        Ok(applicable)
    }

    /// Generate candidate lines for one template
    pub fn generate_preview(
        &self,
        template_id: &str,
        data: &TransactionData,
        chart: &dyn ChartOfAccounts,
    ) -> LedgerResult<Preview> {
        let template = self.get(template_id).ok_or_else(|| {
            LedgerError::Validation(format!("unknown template '{}'", template_id))
        })?;

        let missing = template.missing_fields(data);
        if !missing.is_empty() {
            return Err(LedgerError::Validation(format!(
                "missing required field(s): {}",
                missing.join(", ")
            )));
        }
        if data.transaction_id.trim().is_empty() {
            return Err(LedgerError::Validation(
                "transaction id cannot be empty".to_string(),
            ));
        }
        if data.amount.is_some_and(|a| a < 0) || data.fee.is_some_and(|f| f < 0) {
            return Err(LedgerError::Validation(
                "amounts must be non-negative".to_string(),
            ));
        }

        let mut lines = Vec::with_capacity(template.rules.len());
        for rule in template.rules {
            let account_id = chart.resolve_account_id(rule.role.code(&self.codes))?;
            let amount = rule.amount.resolve(data)?;
            lines.push(JournalLine::new(
                account_id,
                rule.side,
                amount,
                Some(rule.memo.to_string()),
            ));
        }

        check_balance(&lines)?;

        let description = data
            .description
            .clone()
            .unwrap_or_else(|| format!("{} {}", template.description, data.transaction_id));
        let mut candidate =
            CandidateEntry::new(data.date, &description, template.id, &data.currency);
        candidate.reference = Some(data.transaction_id.clone());
        candidate.lines = lines;

        let errors = match candidate.validate() {
            Ok(()) => Vec::new(),
            Err(e) => vec![e.to_string()],
        };

        Ok(Preview {
            template_id: template.id.to_string(),
            transaction_type: template.transaction_type,
            validation: PreviewValidation {
                is_valid: errors.is_empty(),
                total_debits: candidate.total_debits(),
                total_credits: candidate.total_credits(),
                errors,
            },
            candidate,
        })
    }

    /// Preview using the highest-priority applicable template
    pub fn prepare(
        &self,
        transaction_type: TransactionType,
        data: &TransactionData,
        chart: &dyn ChartOfAccounts,
    ) -> LedgerResult<Preview> {
        let template_id = self.find_applicable_templates(transaction_type, data)?[0].id;
        self.generate_preview(template_id, data, chart)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::account::InMemoryChart;

    fn setup() -> (TemplateRegistry, InMemoryChart) {
        let codes = AccountCodes::default();
        (
            TemplateRegistry::standard(codes.clone()).unwrap(),
            InMemoryChart::standard(&codes).unwrap(),
        )
    }

    fn data() -> TransactionData {
        TransactionData::new("py_1", NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(), "USD")
    }

    #[test]
    fn test_every_type_has_a_template() {
        let (registry, chart) = setup();
        registry.verify_accounts(&chart).unwrap();
        for t in TransactionType::ALL {
            assert!(registry.templates().iter().any(|tpl| tpl.transaction_type == t));
        }
    }

    #[test]
    fn test_ach_payment_lines() {
        let (registry, chart) = setup();
        let preview = registry
            .prepare(TransactionType::AchPayment, &data().amount(150_000), &chart)
            .unwrap();

        assert_eq!(preview.template_id, "ach_payment");
        assert!(preview.validation.is_valid);
        let lines = &preview.candidate.lines;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].account_id, "cash_in_transit");
        assert_eq!(lines[0].entry_type, EntryType::Debit);
        assert_eq!(lines[0].amount, 150_000);
        assert_eq!(lines[1].account_id, "accounts_receivable");
        assert_eq!(lines[1].entry_type, EntryType::Credit);
        assert_eq!(preview.candidate.reference.as_deref(), Some("py_1"));
    }

    #[test]
    fn test_priority_ordering() {
        let (registry, _) = setup();
        let found = registry
            .find_applicable_templates(TransactionType::AchPayment, &data().amount(1_000).fee(25))
            .unwrap();
        let ids: Vec<_> = found.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["ach_payment_net_of_fee", "ach_payment"]);

        let without_fee = registry
            .find_applicable_templates(TransactionType::AchPayment, &data().amount(1_000))
            .unwrap();
        assert_eq!(without_fee.len(), 1);
    }

    #[test]
    fn test_net_of_fee_balances() {
        let (registry, chart) = setup();
        let preview = registry
            .prepare(TransactionType::CardPayment, &data().amount(10_000).fee(320), &chart)
            .unwrap();
        assert_eq!(preview.validation.total_debits, 10_000);
        assert_eq!(preview.validation.total_credits, 10_000);
        assert_eq!(preview.candidate.lines[0].amount, 9_680);
    }

    #[test]
    fn test_no_applicable_template() {
        let (registry, _) = setup();
        let result = registry.find_applicable_templates(TransactionType::AchReturn, &data().fee(0));
        assert_eq!(
            result.err(),
            Some(LedgerError::NoApplicableTemplate("ach_return".to_string()))
        );
    }

    #[test]
    fn test_missing_required_field() {
        let (registry, chart) = setup();
        let result = registry.generate_preview("ach_payment", &data(), &chart);
        assert_eq!(
            result.err(),
            Some(LedgerError::Validation(
                "missing required field(s): amount".to_string()
            ))
        );
    }

    #[test]
    fn test_unbalanced_template_is_rejected() {
        const LOPSIDED: &[LineRule] = &[
            debit(AccountRole::Cash, AmountSource::GrossWithFee, "in"),
            credit(AccountRole::AccountsReceivable, AmountSource::Gross, "out"),
        ];
        let codes = AccountCodes::default();
        let chart = InMemoryChart::standard(&codes).unwrap();
        let registry = TemplateRegistry::new(
            vec![Template::new(
                "lopsided",
                TransactionType::Payout,
                "broken",
                1,
                &[DataField::Amount, DataField::Fee],
                always,
                LOPSIDED,
            )],
            codes,
        )
        .unwrap();

        let result = registry.generate_preview("lopsided", &data().amount(1_000).fee(7), &chart);
        assert_eq!(
            result.err(),
            Some(LedgerError::UnbalancedEntry {
                debits: 1_007,
                credits: 1_000,
                imbalance: 7
            })
        );
    }

    #[test]
    fn test_fee_larger_than_amount() {
        let (registry, chart) = setup();
        let inverted = data().amount(10).fee(20);
        let result = registry.generate_preview("ach_payment_net_of_fee", &inverted, &chart);
        assert!(matches!(result, Err(LedgerError::Validation(_))));
    }

    #[test]
    fn test_preview_is_draft() {
        let (registry, chart) = setup();
        let preview = registry
            .prepare(TransactionType::Payout, &data().amount(500), &chart)
            .unwrap();
        assert_eq!(preview.as_draft().status, EntryStatus::Draft);
    }
}
