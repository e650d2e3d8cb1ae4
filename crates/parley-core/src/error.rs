//! Error types for every stage of the conversation pipeline.

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure talking to the cache. Never fatal to a request.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(#[source] BoxError),

    #[error("failed to (de)serialize cached value for key {key}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CacheError {
    pub fn backend(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        CacheError::Backend(Box::new(e))
    }
}

/// Failure reading from or writing to the relational store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(#[source] BoxError),
}

impl StoreError {
    pub fn backend(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        StoreError::Backend(Box::new(e))
    }
}

/// Failure opening a stream against the model provider.
///
/// Errors that happen after the stream is open travel in-band as
/// [`Fragment::Error`](crate::protocol::Fragment::Error).
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("model provider request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("model provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("model provider did not respond within {0:?}")]
    Timeout(std::time::Duration),
}

/// Failure rendering the prompt template.
#[derive(Debug, Error)]
pub enum PromptError {
    #[error("failed to render prompt template: {0}")]
    Render(#[from] minijinja::Error),
}

/// Failure persisting a completed turn. The whole turn has been rolled back.
#[derive(Debug, Error)]
#[error("failed to persist turn for session {session_id}: {source}")]
pub struct PersistError {
    pub session_id: i64,
    #[source]
    pub source: StoreError,
}

/// Anything that can abort a conversation turn.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to load conversation history: {0}")]
    History(#[source] StoreError),

    #[error(transparent)]
    Prompt(#[from] PromptError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    /// The provider failed mid-stream. Whatever was generated before the
    /// failure has already been delivered and, if non-empty, persisted.
    #[error("model stream failed: {message}")]
    Upstream { message: String, persisted: bool },

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("chunk aggregator task failed: {0}")]
    Aggregator(#[from] tokio::task::JoinError),
}
