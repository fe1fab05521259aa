//! Record Committer and the persistence collaborator it writes through.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::{FormError, Result},
    event::OwnerId,
    fields::Fields,
    retry::RetryPolicy,
    schema::FormSchema,
    session::Session,
};

/// Fully assembled data ready for persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftRecord {
    pub owner_id: OwnerId,
    pub fields: Fields,
}

/// A persisted record with its server-assigned identity and timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub kind: String,
    pub owner_id: OwnerId,
    pub fields: Fields,
    pub created_at: DateTime<Utc>,
}

/// Persistence collaborator
///
/// `commit_batch` writes records in order. When it stops partway it reports
/// [`FormError::PartialCommit`]; records already written are not retracted.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn commit_batch(&self, kind: &str, records: &[DraftRecord]) -> Result<usize>;
    async fn list(&self, kind: &str) -> Result<Vec<Record>>;
}

/// Outcome of committing one finished session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    pub written: usize,
    pub total: usize,
}

impl CommitOutcome {
    pub fn is_complete(&self) -> bool {
        self.written == self.total
    }
}

/// Turns a completed session into draft records and hands them over as one batch
#[derive(Clone)]
pub struct RecordCommitter {
    store: Arc<dyn RecordStore>,
    retry: RetryPolicy,
}

impl RecordCommitter {
    pub fn new(store: Arc<dyn RecordStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// One draft per group item merged over the shared fields, or a single draft
    pub fn drafts(session: &Session) -> Vec<DraftRecord> {
        if session.items.is_empty() {
            return vec![DraftRecord {
                owner_id: session.owner_id,
                fields: session.fields.clone(),
            }];
        }
        session
            .items
            .iter()
            .map(|item| DraftRecord {
                owner_id: session.owner_id,
                fields: session.fields.merged(item),
            })
            .collect()
    }

    /// Commits the session's drafts.
    ///
    /// A partial write is returned as an incomplete [`CommitOutcome`], not an error,
    /// so the caller can warn the user. Errors mean nothing was written.
    pub async fn commit(&self, schema: &FormSchema, session: &Session) -> Result<CommitOutcome> {
        let drafts = Self::drafts(session);
        let total = drafts.len();
        let kind = schema.record_kind.as_str();

        let result = self
            .retry
            .run("commit_batch", || self.store.commit_batch(kind, &drafts))
            .await;

        match result {
            Ok(written) => {
                info!(
                    owner_id = %session.owner_id,
                    kind,
                    written,
                    "Committed form records"
                );
                Ok(CommitOutcome { written, total })
            }
            Err(FormError::PartialCommit { written, reason, .. }) if written > 0 => {
                warn!(
                    owner_id = %session.owner_id,
                    kind,
                    written,
                    total,
                    reason = %reason,
                    "Form records only partially committed"
                );
                Ok(CommitOutcome { written, total })
            }
            Err(FormError::PartialCommit { reason, .. }) => {
                Err(FormError::UpstreamUnavailable(reason))
            }
            Err(e) => Err(e),
        }
    }
}

/// In-memory record store with failure injection for exercising the partial-commit path
pub struct InMemoryRecordStore {
    records: Arc<DashMap<String, Vec<Record>>>,
    fail_after: AtomicUsize,
    unavailable_calls: AtomicUsize,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            fail_after: AtomicUsize::new(usize::MAX),
            unavailable_calls: AtomicUsize::new(0),
        }
    }

    /// The next batch stops after writing `n` records
    pub fn fail_after(&self, n: usize) {
        self.fail_after.store(n, Ordering::SeqCst);
    }

    /// The next `calls` batches fail with a transient error before writing anything
    pub fn fail_next_calls(&self, calls: usize) {
        self.unavailable_calls.store(calls, Ordering::SeqCst);
    }

    pub fn count(&self, kind: &str) -> usize {
        self.records.get(kind).map(|r| r.len()).unwrap_or(0)
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn commit_batch(&self, kind: &str, records: &[DraftRecord]) -> Result<usize> {
        let unavailable = self
            .unavailable_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if unavailable.is_ok() {
            return Err(FormError::UpstreamUnavailable(
                "record store unavailable".to_string(),
            ));
        }

        let limit = self.fail_after.swap(usize::MAX, Ordering::SeqCst);
        let mut written = 0;
        for draft in records {
            if written == limit {
                return Err(FormError::PartialCommit {
                    written,
                    total: records.len(),
                    reason: "record store rejected write".to_string(),
                });
            }
            let record = Record {
                id: Uuid::new_v4(),
                kind: kind.to_string(),
                owner_id: draft.owner_id,
                fields: draft.fields.clone(),
                created_at: Utc::now(),
            };
            self.records.entry(kind.to_string()).or_default().push(record);
            written += 1;
        }
        Ok(written)
    }

    async fn list(&self, kind: &str) -> Result<Vec<Record>> {
        Ok(self
            .records
            .get(kind)
            .map(|entry| entry.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{phase::PhaseDef, schema::FormSchemaBuilder};
    use std::time::Duration;

    fn schema() -> FormSchema {
        FormSchemaBuilder::new("participation", "contest_participation")
            .add_phase(PhaseDef::text("enter_result", "Результат:").field("result").next("finish"))
            .add_phase(PhaseDef::terminal("finish", "Сохранено"))
            .build()
            .unwrap()
    }

    fn session_with_students(names: &[&str]) -> Session {
        let mut session = Session::new(OwnerId(11), "participation", "finish");
        session.fields.set("result", "Диплом I степени");
        session.fields.set("teacher_name", "Петрова А.А.");
        for (i, name) in names.iter().enumerate() {
            let item: Fields = [
                ("student_name", name.to_string()),
                ("group", format!("10{i}")),
            ]
            .into_iter()
            .collect();
            session.items.push(item);
        }
        session
    }

    fn committer(store: Arc<InMemoryRecordStore>) -> RecordCommitter {
        RecordCommitter::new(
            store,
            RetryPolicy {
                max_attempts: 2,
                base_backoff: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn test_fan_out_one_record_per_item() {
        let store = Arc::new(InMemoryRecordStore::new());
        let session = session_with_students(&["Иванов", "Петров", "Сидоров"]);

        let outcome = committer(store.clone()).commit(&schema(), &session).await.unwrap();
        assert_eq!(outcome, CommitOutcome { written: 3, total: 3 });

        let records = store.list("contest_participation").await.unwrap();
        assert_eq!(records.len(), 3);
        for record in &records {
            assert_eq!(record.fields.get_str("result"), Some("Диплом I степени"));
            assert_eq!(record.fields.get_str("teacher_name"), Some("Петрова А.А."));
            assert_eq!(record.owner_id, OwnerId(11));
        }
        let names: Vec<_> = records
            .iter()
            .map(|r| r.fields.get_str("student_name").unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["Иванов", "Петров", "Сидоров"]);
    }

    #[tokio::test]
    async fn test_single_record_without_items() {
        let store = Arc::new(InMemoryRecordStore::new());
        let session = session_with_students(&[]);
        let outcome = committer(store.clone()).commit(&schema(), &session).await.unwrap();
        assert_eq!(outcome.total, 1);
        assert!(outcome.is_complete());
        assert_eq!(store.count("contest_participation"), 1);
    }

    #[tokio::test]
    async fn test_partial_commit_is_reported() {
        let store = Arc::new(InMemoryRecordStore::new());
        store.fail_after(1);
        let session = session_with_students(&["Иванов", "Петров"]);

        let outcome = committer(store.clone()).commit(&schema(), &session).await.unwrap();
        assert_eq!(outcome, CommitOutcome { written: 1, total: 2 });
        assert!(!outcome.is_complete());
        assert_eq!(store.count("contest_participation"), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_once() {
        let store = Arc::new(InMemoryRecordStore::new());
        store.fail_next_calls(1);
        let session = session_with_students(&["Иванов"]);
        let outcome = committer(store.clone()).commit(&schema(), &session).await.unwrap();
        assert!(outcome.is_complete());

        store.fail_next_calls(2);
        let err = committer(store.clone())
            .commit(&schema(), &session)
            .await
            .unwrap_err();
        assert!(matches!(err, FormError::UpstreamUnavailable(_)));
        assert_eq!(store.count("contest_participation"), 1);
    }
}
