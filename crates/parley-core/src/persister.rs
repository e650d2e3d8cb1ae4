//! Durable write of a completed turn, followed by cache invalidation.

use std::future::Future;
use std::sync::Arc;

use tracing::{error, info};

use crate::cache::{self, CacheClient, keys};
use crate::error::{PersistError, StoreError};

/// Atomic write of a user/agent message pair.
pub trait TurnRepository: Send + Sync + 'static {
    /// Insert both messages in one transaction: either both rows exist
    /// afterwards or neither does.
    fn insert_turn(
        &self,
        session_id: i64,
        user_text: &str,
        agent_text: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// A finished exchange ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistTurn {
    pub session_id: i64,
    pub user_id: i64,
    pub user_text: String,
    pub agent_text: String,
    /// The session was created by this turn, so the owner's session list is stale too.
    pub new_session: bool,
}

#[derive(Debug)]
pub struct ConversationPersister<R> {
    repo: Arc<R>,
    cache: Arc<dyn CacheClient>,
}

impl<R> Clone for ConversationPersister<R> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<R: TurnRepository> ConversationPersister<R> {
    pub fn new(repo: Arc<R>, cache: Arc<dyn CacheClient>) -> Self {
        Self { repo, cache }
    }

    /// Store the turn, then drop every cache entry derived from the session.
    ///
    /// Invalidation failures are logged and do not fail the call.
    pub async fn persist_turn(&self, turn: &PersistTurn) -> Result<(), PersistError> {
        if let Err(source) = self
            .repo
            .insert_turn(turn.session_id, &turn.user_text, &turn.agent_text)
            .await
        {
            error!(session_id = turn.session_id, error = %source, "failed to persist turn");
            return Err(PersistError {
                session_id: turn.session_id,
                source,
            });
        }

        info!(
            session_id = turn.session_id,
            agent_chars = turn.agent_text.chars().count(),
            "turn persisted"
        );

        let cache = self.cache.as_ref();
        cache::invalidate(cache, &keys::messages_list(turn.session_id)).await;
        cache::invalidate(cache, &keys::conversation_history_pattern(turn.session_id)).await;
        if turn.new_session {
            cache::invalidate(cache, &keys::sessions_list(turn.user_id)).await;
        }
        Ok(())
    }
}
