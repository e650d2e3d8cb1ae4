use std::future::Future;

use chrono::Utc;
use parley_core::StoreError;
use parley_core::history::{HistoryEntry, MessageRepository};
use parley_core::persister::TurnRepository;

use crate::entities::dao::{self, Message};
use crate::entities::SqliteStore;

type MessageRow = (i64, i64, String, bool, String, String);

pub trait MessageStore: Send + Sync + 'static {
    /// Every message of the session, oldest first.
    fn list_messages(
        &self,
        session_id: i64,
    ) -> impl Future<Output = Result<Vec<Message>, sqlx::Error>> + Send;
}

fn from_row(row: MessageRow) -> Message {
    let (id, session_id, content, is_user, created_at, updated_at) = row;
    Message {
        id,
        session_id,
        content,
        is_user,
        created_at: dao::parse_ts("created_at", &created_at),
        updated_at: dao::parse_ts("updated_at", &updated_at),
    }
}

impl MessageStore for SqliteStore {
    async fn list_messages(&self, session_id: i64) -> Result<Vec<Message>, sqlx::Error> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, session_id, content, is_user, created_at, updated_at \
             FROM messages WHERE session_id = ?1 ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(from_row).collect())
    }
}

impl MessageRepository for SqliteStore {
    async fn recent_messages(
        &self,
        session_id: i64,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, session_id, content, is_user, created_at, updated_at \
             FROM messages WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(StoreError::backend)?;
        Ok(rows.into_iter().map(|row| from_row(row).into()).collect())
    }
}

impl TurnRepository for SqliteStore {
    async fn insert_turn(
        &self,
        session_id: i64,
        user_text: &str,
        agent_text: &str,
    ) -> Result<(), StoreError> {
        let now = dao::format_ts(Utc::now());
        let mut tx = self.pool().begin().await.map_err(StoreError::backend)?;

        for (content, is_user) in [(user_text, true), (agent_text, false)] {
            sqlx::query(
                "INSERT INTO messages (session_id, content, is_user, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(session_id)
            .bind(content)
            .bind(is_user)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::backend)?;
        }

        sqlx::query("UPDATE chat_sessions SET updated_at = ?1 WHERE id = ?2")
            .bind(&now)
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::backend)?;

        tx.commit().await.map_err(StoreError::backend)
    }
}
