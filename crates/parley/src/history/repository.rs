//! Durable history tier: subject aggregates with an embedded message log.

use chrono::Utc;
use parley_protocol::Message;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use super::HistoryError;

/// A workflow subject as stored by the durable tier.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectRecord {
    pub id: String,
    /// Session currently bound to the subject.
    pub session_id: Option<String>,
    pub phase: Option<String>,
    /// Data-maturity tier, opaque to the gateway.
    pub tier: Option<String>,
    pub messages: Vec<Message>,
}

impl SubjectRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            session_id: None,
            phase: None,
            tier: None,
            messages: Vec::new(),
        }
    }
}

/// Repository over the `subjects` table.
#[derive(Debug, Clone)]
pub struct SubjectRepository {
    pool: SqlitePool,
}

impl SubjectRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Locate the subject whose embedded session reference equals `session_id`.
    pub async fn find_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<SubjectRecord>, HistoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, session_id, phase, tier, messages
            FROM subjects
            WHERE session_id = ?
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| record_from_row(&row)).transpose()
    }

    pub async fn find_by_id(&self, subject_id: &str) -> Result<Option<SubjectRecord>, HistoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, session_id, phase, tier, messages
            FROM subjects
            WHERE id = ?
            "#,
        )
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| record_from_row(&row)).transpose()
    }

    /// Insert or replace a subject aggregate.
    pub async fn upsert(&self, record: &SubjectRecord) -> Result<(), HistoryError> {
        let messages = serde_json::to_string(&record.messages)?;
        sqlx::query(
            r#"
            INSERT INTO subjects (id, session_id, phase, tier, messages, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                session_id = excluded.session_id,
                phase = excluded.phase,
                tier = excluded.tier,
                messages = excluded.messages,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.id)
        .bind(&record.session_id)
        .bind(&record.phase)
        .bind(&record.tier)
        .bind(messages)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SubjectRecord, HistoryError> {
    let id: String = row.get("id");
    let raw_messages: String = row.get("messages");
    let messages: Vec<Message> = serde_json::from_str(&raw_messages).map_err(|e| {
        HistoryError::Corrupt(format!("messages of subject {id} are not decodable: {e}"))
    })?;

    Ok(SubjectRecord {
        id,
        session_id: row.get("session_id"),
        phase: row.get("phase"),
        tier: row.get("tier"),
        messages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn test_upsert_and_find_by_session() {
        let db = Database::in_memory().await.unwrap();
        let repo = SubjectRepository::new(db.pool().clone());

        let mut record = SubjectRecord::new("subj-1");
        record.session_id = Some("sess-1".to_string());
        record.phase = Some("discovery".to_string());
        record.messages = vec![Message::user("hello")];
        repo.upsert(&record).await.unwrap();

        let found = repo.find_by_session("sess-1").await.unwrap().unwrap();
        assert_eq!(found.id, "subj-1");
        assert_eq!(found.messages.len(), 1);
        assert_eq!(found.phase.as_deref(), Some("discovery"));

        assert!(repo.find_by_session("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_rebinds_session() {
        let db = Database::in_memory().await.unwrap();
        let repo = SubjectRepository::new(db.pool().clone());

        let mut record = SubjectRecord::new("subj-1");
        record.session_id = Some("old".to_string());
        repo.upsert(&record).await.unwrap();

        record.session_id = Some("new".to_string());
        repo.upsert(&record).await.unwrap();

        assert!(repo.find_by_session("old").await.unwrap().is_none());
        let found = repo.find_by_id("subj-1").await.unwrap().unwrap();
        assert_eq!(found.session_id.as_deref(), Some("new"));
    }
}
