//! Gateway calls under a deadline with exponential backoff

use chrono::{DateTime, Utc};
use std::future::Future;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::reconciliation::records::*;
use crate::traits::*;
use crate::types::*;

/// Run `call` until it succeeds, fails permanently, or attempts run out
///
/// Each attempt is bounded by the policy's per-call deadline. Transient
/// failures (see [`LedgerError::is_retryable`]) and deadline overruns are
/// retried; once `max_attempts` is reached the result is
/// [`LedgerError::ExternalGatewayTimeout`]. Other errors return at once.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> LedgerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LedgerResult<T>>,
{
    let deadline = policy.call_timeout();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(deadline, call()).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Gateway(format!(
                "{} exceeded its {}ms deadline",
                operation, policy.call_timeout_ms
            ))),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if attempt >= policy.max_attempts => {
                warn!(operation, attempt, error = %e, "gateway retries exhausted");
                return Err(LedgerError::ExternalGatewayTimeout {
                    operation: operation.to_string(),
                    attempts: attempt,
                });
            }
            Err(e) => {
                let delay = policy.backoff(attempt);
                warn!(operation, attempt, ?delay, error = %e, "gateway call failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Fetch every page of processor records since `since`
pub async fn load_processor_records(
    gateway: &dyn PaymentProcessorGateway,
    policy: &RetryPolicy,
    since: DateTime<Utc>,
) -> LedgerResult<Vec<ExternalTransactionRecord>> {
    let mut records = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = call_with_retry(policy, "fetch_transactions", || {
            gateway.fetch_transactions(since, cursor.clone())
        })
        .await?;
        debug!(count = page.records.len(), cursor = ?cursor, "processor page loaded");
        records.extend(page.records);
        match page.next_cursor {
            Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
            Some(next) => {
                return Err(LedgerError::Gateway(format!(
                    "processor returned the same cursor '{}' twice",
                    next
                )))
            }
            None => return Ok(records),
        }
    }
}

/// Fetch bank settlements for `window`
pub async fn load_bank_records(
    gateway: &dyn BankFeedGateway,
    policy: &RetryPolicy,
    window: DateWindow,
) -> LedgerResult<Vec<BankSettlementRecord>> {
    call_with_retry(policy, "fetch_settlements", || gateway.fetch_settlements(window)).await
}

/// Exception raised when a feed stays unavailable after all retries
pub fn feed_unavailable(feed: &str, window: &DateWindow, error: &LedgerError) -> NewException {
    NewException::new(
        ExceptionReason::GatewayUnavailable,
        vec![ItemRef::Feed(format!("{}:{}", feed, window))],
        format!("{} feed unavailable for {}: {}", feed, window, error),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::memory_gateway::{MemoryBankFeed, MemoryProcessorGateway};
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2,
            call_timeout_ms: 50,
        }
    }

    fn window() -> DateWindow {
        let d = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        DateWindow::new(d, d).unwrap()
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let feed = MemoryBankFeed::new();
        feed.fail_next(2);
        let records = load_bank_records(&feed, &fast_policy(), window()).await.unwrap();
        assert!(records.is_empty());
        assert_eq!(feed.calls(), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_timeout() {
        let feed = MemoryBankFeed::new();
        feed.fail_next(10);
        let result = load_bank_records(&feed, &fast_policy(), window()).await;
        assert_eq!(
            result,
            Err(LedgerError::ExternalGatewayTimeout {
                operation: "fetch_settlements".to_string(),
                attempts: 3
            })
        );
    }

    #[tokio::test]
    async fn test_deadline_counts_as_transient() {
        let gateway = MemoryProcessorGateway::new(10);
        gateway.set_delay(Some(Duration::from_millis(500)));
        let result = load_processor_records(&gateway, &fast_policy(), Utc::now()).await;
        assert!(matches!(result, Err(LedgerError::ExternalGatewayTimeout { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: LedgerResult<()> = call_with_retry(&fast_policy(), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LedgerError::Validation("bad request".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(LedgerError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
