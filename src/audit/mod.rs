//! Append-only audit trail
//!
//! Every state-mutating operation of the posting service, the reconciliation
//! engine and the exception service records an [`AuditEntry`] carrying
//! before/after JSON snapshots of the affected entity. Entries are never
//! updated or deleted; the storage port exposes no such operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::traits::AuditStorage;
use crate::types::*;

/// Kind of mutation being recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    EntryPosted,
    EntryReversed,
    BatchCompleted,
    ReconciliationStarted,
    ReconciliationCompleted,
    ReconciliationFailed,
    MatchRecorded,
    SettlementLinked,
    ExceptionRaised,
    ExceptionClaimed,
    ExceptionResolved,
    ExceptionWrittenOff,
    ReturnProcessed,
}

/// Immutable audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: u64,
    pub actor: String,
    pub action: AuditAction,
    pub target_id: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// Audit record before the store assigns id and timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAuditEntry {
    pub actor: String,
    pub action: AuditAction,
    pub target_id: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// Audit query; all set fields must match
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditFilter {
    pub target_id: Option<String>,
    pub action: Option<AuditAction>,
    /// Inclusive lower bound on the timestamp
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the timestamp
    pub to: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn for_target(target_id: impl Into<String>) -> Self {
        Self {
            target_id: Some(target_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.target_id.as_ref().is_none_or(|t| &entry.target_id == t)
            && self.action.is_none_or(|a| entry.action == a)
            && self.from.is_none_or(|f| entry.timestamp >= f)
            && self.to.is_none_or(|t| entry.timestamp <= t)
    }
}

fn snapshot<T: Serialize>(value: Option<&T>) -> LedgerResult<Option<Value>> {
    value
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| LedgerError::Persistence(format!("audit snapshot failed: {}", e)))
}

/// Audit log service
#[derive(Debug, Clone)]
pub struct AuditLog<S: AuditStorage> {
    storage: S,
}

impl<S: AuditStorage> AuditLog<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Append an entry with serialized before/after snapshots
    pub async fn append<B: Serialize, A: Serialize>(
        &self,
        actor: &str,
        action: AuditAction,
        target_id: &str,
        before: Option<&B>,
        after: Option<&A>,
    ) -> LedgerResult<AuditEntry> {
        let entry = NewAuditEntry {
            actor: actor.to_string(),
            action,
            target_id: target_id.to_string(),
            before: snapshot(before)?,
            after: snapshot(after)?,
        };
        self.storage.append_audit(entry).await
    }

    /// Append after a mutation has already been committed
    ///
    /// The committed change stays authoritative; an audit failure is logged
    /// and does not turn the operation into an error.
    pub async fn record<B: Serialize, A: Serialize>(
        &self,
        actor: &str,
        action: AuditAction,
        target_id: &str,
        before: Option<&B>,
        after: Option<&A>,
    ) {
        if let Err(e) = self.append(actor, action, target_id, before, after).await {
            error!(?action, target_id, error = %e, "failed to append audit entry");
        }
    }

    pub async fn query(&self, filter: &AuditFilter) -> LedgerResult<Vec<AuditEntry>> {
        self.storage.query_audit(filter).await
    }

    /// Full history of one entity
    pub async fn trail_for(&self, target_id: &str) -> LedgerResult<Vec<AuditEntry>> {
        self.query(&AuditFilter::for_target(target_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::memory_storage::MemoryStorage;
    use chrono::Duration;

    #[tokio::test]
    async fn test_append_and_filter() {
        let log = AuditLog::new(MemoryStorage::new());

        log.append::<Value, _>(
            "alice",
            AuditAction::EntryPosted,
            "JE-000001",
            None,
            Some(&serde_json::json!({"status": "posted"})),
        )
        .await
        .unwrap();
        log.append::<_, Value>(
            "bob",
            AuditAction::ExceptionClaimed,
            "EX-1",
            Some(&"OPEN"),
            None,
        )
        .await
        .unwrap();

        let trail = log.trail_for("JE-000001").await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].actor, "alice");
        assert_eq!(trail[0].after.as_ref().unwrap()["status"], "posted");

        let claimed = log
            .query(&AuditFilter {
                action: Some(AuditAction::ExceptionClaimed),
                ..AuditFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].target_id, "EX-1");
    }

    #[tokio::test]
    async fn test_date_range_filter() {
        let log = AuditLog::new(MemoryStorage::new());
        let appended = log
            .append::<Value, Value>("sys", AuditAction::BatchCompleted, "batch", None, None)
            .await
            .unwrap();

        let future = AuditFilter {
            from: Some(appended.timestamp + Duration::hours(1)),
            ..AuditFilter::default()
        };
        assert!(log.query(&future).await.unwrap().is_empty());

        let around = AuditFilter {
            from: Some(appended.timestamp - Duration::hours(1)),
            to: Some(appended.timestamp + Duration::hours(1)),
            ..AuditFilter::default()
        };
        assert_eq!(log.query(&around).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ids_are_sequential() {
        let log = AuditLog::new(MemoryStorage::new());
        let a = log
            .append::<Value, Value>("sys", AuditAction::MatchRecorded, "m1", None, None)
            .await
            .unwrap();
        let b = log
            .append::<Value, Value>("sys", AuditAction::MatchRecorded, "m2", None, None)
            .await
            .unwrap();
        assert!(b.id > a.id);
    }
}
