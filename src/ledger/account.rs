//! Chart of accounts

use std::collections::HashMap;

use crate::config::AccountCodes;
use crate::traits::*;
use crate::types::*;
use crate::utils::validation::validate_account_id;

/// Chart of accounts held in memory, loaded once at startup
#[derive(Debug, Clone, Default)]
pub struct InMemoryChart {
    by_code: HashMap<String, Account>,
    by_id: HashMap<String, Account>,
}

impl InMemoryChart {
    /// Create an empty chart
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an account; ids and codes must be unique
    pub fn add_account(&mut self, account: Account) -> LedgerResult<()> {
        validate_account_id(&account.id)?;

        if account.name.trim().is_empty() {
            return Err(LedgerError::Validation(
                "Account name cannot be empty".to_string(),
            ));
        }

        if self.by_id.contains_key(&account.id) {
            return Err(LedgerError::Validation(format!(
                "Account with ID '{}' already exists",
                account.id
            )));
        }

        if self.by_code.contains_key(&account.code) {
            return Err(LedgerError::Validation(format!(
                "Account code '{}' is already assigned",
                account.code
            )));
        }

        self.by_code.insert(account.code.clone(), account.clone());
        self.by_id.insert(account.id.clone(), account);
        Ok(())
    }

    /// Standard chart for a merchant taking ACH and card payments
    pub fn standard(codes: &AccountCodes) -> LedgerResult<Self> {
        let mut chart = Self::new();
        let accounts = [
            ("cash", &codes.cash, "Cash", AccountType::Asset),
            (
                "cash_in_transit",
                &codes.cash_in_transit,
                "Cash in Transit",
                AccountType::Asset,
            ),
            (
                "accounts_receivable",
                &codes.accounts_receivable,
                "Accounts Receivable",
                AccountType::Asset,
            ),
            (
                "customer_refunds",
                &codes.customer_refunds,
                "Refunds and Returns",
                AccountType::Income,
            ),
            (
                "processor_fees",
                &codes.processor_fees,
                "Payment Processing Fees",
                AccountType::Expense,
            ),
            (
                "return_fees",
                &codes.return_fees,
                "ACH Return Fees",
                AccountType::Expense,
            ),
            (
                "chargeback_losses",
                &codes.chargeback_losses,
                "Chargeback Losses",
                AccountType::Expense,
            ),
        ];

        for (id, code, name, account_type) in accounts {
            chart.add_account(Account::new(id, code, name, account_type))?;
        }
        Ok(chart)
    }

    /// All accounts ordered by code
    pub fn accounts(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> = self.by_code.values().cloned().collect();
        accounts.sort_by(|a, b| a.code.cmp(&b.code));
        accounts
    }
}

impl ChartOfAccounts for InMemoryChart {
    fn resolve_account_id(&self, code: &str) -> LedgerResult<String> {
        self.by_code
            .get(code)
            .map(|account| account.id.clone())
            .ok_or_else(|| LedgerError::AccountNotFound(code.to_string()))
    }

    fn get_account(&self, account_id: &str) -> Option<Account> {
        self.by_id.get(account_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_chart_resolves_codes() {
        let chart = InMemoryChart::standard(&AccountCodes::default()).unwrap();

        assert_eq!(chart.resolve_account_id("1150").unwrap(), "cash_in_transit");
        assert_eq!(chart.resolve_account_id("1200").unwrap(), "accounts_receivable");
        assert_eq!(
            chart.get_account("processor_fees").unwrap().account_type,
            AccountType::Expense
        );
        assert_eq!(chart.accounts().len(), 7);
    }

    #[test]
    fn test_unknown_code() {
        let chart = InMemoryChart::standard(&AccountCodes::default()).unwrap();
        assert_eq!(
            chart.resolve_account_id("9999"),
            Err(LedgerError::AccountNotFound("9999".to_string()))
        );
    }

    #[test]
    fn test_duplicate_code_rejected() {
        let mut chart = InMemoryChart::new();
        chart
            .add_account(Account::new("cash", "1000", "Cash", AccountType::Asset))
            .unwrap();
        let result = chart.add_account(Account::new("petty", "1000", "Petty", AccountType::Asset));
        assert!(matches!(result, Err(LedgerError::Validation(_))));
    }
}
