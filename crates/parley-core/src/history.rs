//! Bounded conversation history with read-through caching.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use tracing::debug;

use crate::cache::{self, CacheClient, keys};
use crate::error::StoreError;

/// Who authored a message.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

impl Role {
    pub fn from_is_user(is_user: bool) -> Self {
        if is_user { Role::User } else { Role::Agent }
    }
}

/// One message of conversation context, as presented to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

impl HistoryEntry {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Range query over a session's messages.
pub trait MessageRepository: Send + Sync + 'static {
    /// Up to `limit` most recent messages of `session_id`, newest first.
    fn recent_messages(
        &self,
        session_id: i64,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<HistoryEntry>, StoreError>> + Send;
}

/// Loads the recent context of a session, consulting the cache first.
#[derive(Debug)]
pub struct HistoryStore<R> {
    repo: Arc<R>,
    cache: Arc<dyn CacheClient>,
    ttl: Duration,
}

impl<R> Clone for HistoryStore<R> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
            cache: Arc::clone(&self.cache),
            ttl: self.ttl,
        }
    }
}

impl<R: MessageRepository> HistoryStore<R> {
    pub fn new(repo: Arc<R>, cache: Arc<dyn CacheClient>) -> Self {
        Self {
            repo,
            cache,
            ttl: keys::MESSAGES_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Up to `limit` most recent messages of `session_id`, oldest first.
    ///
    /// A session without messages yields an empty vector. Cache failures
    /// fall back to the repository.
    pub async fn get_recent(
        &self,
        session_id: i64,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let key = keys::conversation_history(session_id, limit);
        if let Some(entries) = cache::get_json::<Vec<HistoryEntry>>(self.cache.as_ref(), &key).await
        {
            return Ok(entries);
        }

        let mut entries = self.repo.recent_messages(session_id, limit).await?;
        entries.truncate(limit);
        entries.reverse();
        debug!(session_id, count = entries.len(), "loaded conversation history");

        cache::set_json(self.cache.as_ref(), &key, &entries, self.ttl).await;
        Ok(entries)
    }
}
