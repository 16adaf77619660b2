//! In-memory processor and bank feeds for testing and development

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::reconciliation::{BankSettlementRecord, ExternalTransactionRecord};
use crate::traits::*;
use crate::types::*;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Failure injection shared by both feeds
#[derive(Debug, Default)]
struct Faults {
    failures_left: AtomicU32,
    delay: Mutex<Option<Duration>>,
    calls: AtomicU32,
}

impl Faults {
    async fn enter(&self, feed: &str) -> LedgerResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LedgerError::Gateway(format!("{} temporarily unavailable", feed)));
        }
        Ok(())
    }
}

/// Processor feed serving records in insertion order, `page_size` at a time
#[derive(Debug, Clone)]
pub struct MemoryProcessorGateway {
    records: Arc<Mutex<Vec<ExternalTransactionRecord>>>,
    page_size: usize,
    faults: Arc<Faults>,
}

impl MemoryProcessorGateway {
    pub fn new(page_size: usize) -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
            page_size: page_size.max(1),
            faults: Arc::new(Faults::default()),
        }
    }

    pub fn push(&self, record: ExternalTransactionRecord) {
        lock(&self.records).push(record);
    }

    pub fn extend(&self, records: impl IntoIterator<Item = ExternalTransactionRecord>) {
        lock(&self.records).extend(records);
    }

    /// Fail the next `count` calls with a transient gateway error
    pub fn fail_next(&self, count: u32) {
        self.faults.failures_left.store(count, Ordering::SeqCst);
    }

    /// Delay every call, e.g. to trip the per-call deadline
    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.faults.delay) = delay;
    }

    /// Number of fetch calls received so far
    pub fn calls(&self) -> u32 {
        self.faults.calls.load(Ordering::SeqCst)
    }
}

impl Default for MemoryProcessorGateway {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl PaymentProcessorGateway for MemoryProcessorGateway {
    async fn fetch_transactions(
        &self,
        since: DateTime<Utc>,
        cursor: Option<String>,
    ) -> LedgerResult<TransactionPage> {
        self.faults.enter("processor").await?;

        let offset = match cursor {
            Some(cursor) => cursor
                .parse::<usize>()
                .map_err(|_| LedgerError::Gateway(format!("invalid cursor '{}'", cursor)))?,
            None => 0,
        };

        let records = lock(&self.records);
        let eligible: Vec<&ExternalTransactionRecord> =
            records.iter().filter(|r| r.timestamp >= since).collect();
        let end = (offset + self.page_size).min(eligible.len());
        let page = eligible
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|r| (*r).clone())
            .collect();

        Ok(TransactionPage {
            records: page,
            next_cursor: (end < eligible.len()).then(|| end.to_string()),
        })
    }
}

/// Bank feed returning every settlement dated inside the requested window
#[derive(Debug, Clone, Default)]
pub struct MemoryBankFeed {
    records: Arc<Mutex<Vec<BankSettlementRecord>>>,
    faults: Arc<Faults>,
}

impl MemoryBankFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: BankSettlementRecord) {
        lock(&self.records).push(record);
    }

    pub fn extend(&self, records: impl IntoIterator<Item = BankSettlementRecord>) {
        lock(&self.records).extend(records);
    }

    pub fn fail_next(&self, count: u32) {
        self.faults.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.faults.delay) = delay;
    }

    pub fn calls(&self) -> u32 {
        self.faults.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BankFeedGateway for MemoryBankFeed {
    async fn fetch_settlements(
        &self,
        window: DateWindow,
    ) -> LedgerResult<Vec<BankSettlementRecord>> {
        self.faults.enter("bank feed").await?;
        Ok(lock(&self.records)
            .iter()
            .filter(|r| window.contains(r.settlement_date))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciliation::ExternalStatus;
    use chrono::{NaiveDate, TimeZone};

    fn record(id: &str, day: u32) -> ExternalTransactionRecord {
        ExternalTransactionRecord {
            processor_reference_id: id.to_string(),
            amount: 1_000,
            currency: "USD".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap(),
            status: ExternalStatus::Succeeded,
            reference: format!("order-{}", id),
            return_code: None,
            original_reference_id: None,
            return_fee: None,
        }
    }

    #[tokio::test]
    async fn test_paging_follows_cursor() {
        let gateway = MemoryProcessorGateway::new(2);
        gateway.extend((1..=5).map(|d| record(&format!("py_{}", d), d)));
        let since = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        let mut ids = Vec::new();
        let mut cursor = None;
        loop {
            let page = gateway.fetch_transactions(since, cursor).await.unwrap();
            ids.extend(page.records.into_iter().map(|r| r.processor_reference_id));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(ids, vec!["py_2", "py_3", "py_4", "py_5"]);
        assert_eq!(gateway.calls(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let feed = MemoryBankFeed::new();
        let d = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        feed.push(BankSettlementRecord {
            bank_reference_id: "b1".to_string(),
            amount: 1_000,
            settlement_date: d,
            reference: "order-1".to_string(),
        });
        feed.fail_next(1);
        let window = DateWindow::new(d, d).unwrap();

        assert!(matches!(
            feed.fetch_settlements(window).await,
            Err(LedgerError::Gateway(_))
        ));
        assert_eq!(feed.fetch_settlements(window).await.unwrap().len(), 1);
    }
}
