//! Two-tier history reads.

use std::sync::Arc;

use log::{debug, warn};
use parley_protocol::Message;
use serde_json::json;

use super::cache::{CachedHistory, MessageCache};
use super::repository::{SubjectRecord, SubjectRepository};
use super::HistoryError;

/// Messages of one session, with the subject they belong to when known.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub session_id: String,
    pub subject_id: Option<String>,
    pub messages: Vec<Message>,
    pub phase: Option<String>,
}

/// History reads with cache-first, durable-fallback semantics.
#[derive(Clone)]
pub struct HistoryStore {
    cache: Arc<dyn MessageCache>,
    subjects: SubjectRepository,
}

impl HistoryStore {
    pub fn new(cache: Arc<dyn MessageCache>, subjects: SubjectRepository) -> Self {
        Self { cache, subjects }
    }

    pub fn subjects(&self) -> &SubjectRepository {
        &self.subjects
    }

    /// Read the history of a session.
    ///
    /// Cache failures and undecodable cache entries fall through to the
    /// durable tier. `Ok(None)` means neither tier knows the session.
    pub async fn get_history(&self, session_id: &str) -> Result<Option<HistoryRecord>, HistoryError> {
        if let Some(record) = self.read_cache(session_id).await {
            debug!("history cache hit for session {}", session_id);
            return Ok(Some(record));
        }

        let Some(subject) = self.subjects.find_by_session(session_id).await? else {
            debug!("no history for session {} in either tier", session_id);
            return Ok(None);
        };

        debug!(
            "history for session {} loaded from subject {}",
            session_id, subject.id
        );
        self.backfill_cache(session_id, &subject).await;

        Ok(Some(HistoryRecord {
            session_id: session_id.to_string(),
            subject_id: Some(subject.id),
            messages: subject.messages,
            phase: subject.phase,
        }))
    }

    /// Persisted subject aggregate, used to find a subject's current session.
    pub async fn subject(&self, subject_id: &str) -> Result<Option<SubjectRecord>, HistoryError> {
        self.subjects.find_by_id(subject_id).await
    }

    /// Write a subject aggregate and refresh the cached history of its session.
    pub async fn record_subject(&self, record: &SubjectRecord) -> Result<(), HistoryError> {
        self.subjects.upsert(record).await?;
        if let Some(session_id) = record.session_id.as_deref() {
            self.backfill_cache(session_id, record).await;
        }
        Ok(())
    }

    async fn read_cache(&self, session_id: &str) -> Option<HistoryRecord> {
        let value = match self.cache.get(session_id).await {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(err) => {
                warn!(
                    "history cache read failed for session {}, using durable store: {}",
                    session_id, err
                );
                return None;
            }
        };

        match CachedHistory::decode(value) {
            Ok(cached) => {
                let (messages, subject_id, phase) = cached.into_parts();
                Some(HistoryRecord {
                    session_id: session_id.to_string(),
                    subject_id,
                    messages,
                    phase,
                })
            }
            Err(err) => {
                warn!(
                    "ignoring undecodable cached history for session {}: {}",
                    session_id, err
                );
                None
            }
        }
    }

    async fn backfill_cache(&self, session_id: &str, subject: &SubjectRecord) {
        let value = json!({
            "messages": subject.messages,
            "subjectId": subject.id,
            "phase": subject.phase,
        });
        if let Err(err) = self.cache.put(session_id, value).await {
            warn!("failed to backfill history cache for session {}: {}", session_id, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::history::cache::{CacheError, MemoryCache};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::time::Duration;

    struct BrokenCache;

    #[async_trait]
    impl MessageCache for BrokenCache {
        async fn get(&self, _session_id: &str) -> Result<Option<Value>, CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }

        async fn put(&self, _session_id: &str, _value: Value) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
    }

    async fn repo_with_subject() -> SubjectRepository {
        let db = Database::in_memory().await.unwrap();
        let repo = SubjectRepository::new(db.pool().clone());
        let mut record = SubjectRecord::new("subj-1");
        record.session_id = Some("sess-1".to_string());
        record.phase = Some("analysis".to_string());
        record.messages = vec![Message::user("hi"), Message::assistant("hello there")];
        repo.upsert(&record).await.unwrap();
        repo
    }

    #[tokio::test]
    async fn test_cache_hit_skips_durable_tier() {
        let db = Database::in_memory().await.unwrap();
        let cache = Arc::new(MemoryCache::new(Duration::from_secs(60)));
        cache
            .put(
                "sess-9",
                json!({"messages": [{"role": "user", "content": "cached"}], "subjectId": "s9"}),
            )
            .await
            .unwrap();

        let store = HistoryStore::new(cache, SubjectRepository::new(db.pool().clone()));
        let record = store.get_history("sess-9").await.unwrap().unwrap();
        assert_eq!(record.messages[0].content, "cached");
        assert_eq!(record.subject_id.as_deref(), Some("s9"));
    }

    #[tokio::test]
    async fn test_cache_miss_falls_back_and_backfills() {
        let cache = Arc::new(MemoryCache::new(Duration::from_secs(60)));
        let store = HistoryStore::new(cache.clone(), repo_with_subject().await);

        let record = store.get_history("sess-1").await.unwrap().unwrap();
        assert_eq!(record.messages.len(), 2);
        assert_eq!(record.subject_id.as_deref(), Some("subj-1"));
        assert_eq!(record.phase.as_deref(), Some("analysis"));

        assert!(cache.get("sess-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cache_failure_degrades_to_durable_tier() {
        let store = HistoryStore::new(Arc::new(BrokenCache), repo_with_subject().await);
        let record = store.get_history("sess-1").await.unwrap().unwrap();
        assert_eq!(record.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_undecodable_cache_entry_falls_through() {
        let cache = Arc::new(MemoryCache::new(Duration::from_secs(60)));
        cache.put("sess-1", json!({"unexpected": true})).await.unwrap();
        let store = HistoryStore::new(cache, repo_with_subject().await);

        let record = store.get_history("sess-1").await.unwrap().unwrap();
        assert_eq!(record.subject_id.as_deref(), Some("subj-1"));
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let store = HistoryStore::new(
            Arc::new(MemoryCache::new(Duration::from_secs(60))),
            repo_with_subject().await,
        );
        assert!(store.get_history("missing").await.unwrap().is_none());
    }
}
