use std::future::Future;

use chrono::{DateTime, Duration, Utc};

use crate::entities::dao::{self, ChatSession};
use crate::entities::SqliteStore;

/// Upper bound on sessions returned by a listing.
pub const SESSION_LIST_LIMIT: i64 = 100;

type SessionRow = (i64, i64, String, String, Option<String>, String, String);

const SESSION_COLUMNS: &str =
    "id, user_id, start_time, end_time, summary, created_at, updated_at";

pub trait SessionStore: Send + Sync + 'static {
    /// Open a session for `user_id` starting now and lasting `lifetime`.
    fn create_session(
        &self,
        user_id: i64,
        summary: &str,
        lifetime: Duration,
    ) -> impl Future<Output = Result<ChatSession, sqlx::Error>> + Send;

    /// The session `id` if it exists and belongs to `user_id`.
    fn get_session(
        &self,
        id: i64,
        user_id: i64,
    ) -> impl Future<Output = Result<Option<ChatSession>, sqlx::Error>> + Send;

    /// Sessions of `user_id` that have not yet expired at `now`, newest first.
    fn list_active_sessions(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<ChatSession>, sqlx::Error>> + Send;

    /// Returns the updated session, or `None` if it does not exist or is not owned.
    fn update_summary(
        &self,
        id: i64,
        user_id: i64,
        summary: &str,
    ) -> impl Future<Output = Result<Option<ChatSession>, sqlx::Error>> + Send;

    /// Delete the session and all of its messages in one transaction.
    /// Returns `false` if it does not exist or is not owned.
    fn delete_session(
        &self,
        id: i64,
        user_id: i64,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;
}

fn from_row(row: SessionRow) -> ChatSession {
    let (id, user_id, start_time, end_time, summary, created_at, updated_at) = row;
    ChatSession {
        id,
        user_id,
        start_time: dao::parse_ts("start_time", &start_time),
        end_time: dao::parse_ts("end_time", &end_time),
        summary,
        created_at: dao::parse_ts("created_at", &created_at),
        updated_at: dao::parse_ts("updated_at", &updated_at),
    }
}

impl SessionStore for SqliteStore {
    async fn create_session(
        &self,
        user_id: i64,
        summary: &str,
        lifetime: Duration,
    ) -> Result<ChatSession, sqlx::Error> {
        let now = Utc::now();
        let end_time = now.checked_add_signed(lifetime).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let now_s = dao::format_ts(now);

        let id = sqlx::query(
            "INSERT INTO chat_sessions (user_id, start_time, end_time, summary, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(user_id)
        .bind(&now_s)
        .bind(dao::format_ts(end_time))
        .bind(summary)
        .bind(&now_s)
        .bind(&now_s)
        .execute(self.pool())
        .await?
        .last_insert_rowid();

        Ok(ChatSession {
            id,
            user_id,
            start_time: now,
            end_time,
            summary: Some(summary.to_owned()),
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_session(&self, id: i64, user_id: i64) -> Result<Option<ChatSession>, sqlx::Error> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE id = ?1 AND user_id = ?2"
        ))
        .bind(id)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(from_row))
    }

    async fn list_active_sessions(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<ChatSession>, sqlx::Error> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions \
             WHERE user_id = ?1 AND end_time > ?2 \
             ORDER BY start_time DESC, id DESC LIMIT ?3"
        ))
        .bind(user_id)
        .bind(dao::format_ts(now))
        .bind(SESSION_LIST_LIMIT)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(from_row).collect())
    }

    async fn update_summary(
        &self,
        id: i64,
        user_id: i64,
        summary: &str,
    ) -> Result<Option<ChatSession>, sqlx::Error> {
        let updated = sqlx::query(
            "UPDATE chat_sessions SET summary = ?1, updated_at = ?2 WHERE id = ?3 AND user_id = ?4",
        )
        .bind(summary)
        .bind(dao::format_ts(Utc::now()))
        .bind(id)
        .bind(user_id)
        .execute(self.pool())
        .await?
        .rows_affected();

        if updated == 0 {
            return Ok(None);
        }
        self.get_session(id, user_id).await
    }

    async fn delete_session(&self, id: i64, user_id: i64) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool().begin().await?;

        let owned: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM chat_sessions WHERE id = ?1 AND user_id = ?2")
                .bind(id)
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
        if owned.is_none() {
            return Ok(false);
        }

        sqlx::query("DELETE FROM messages WHERE session_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chat_sessions WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }
}
