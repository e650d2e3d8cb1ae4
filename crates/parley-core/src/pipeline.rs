//! One conversation turn, end to end.
//!
//! ```text
//! LLM producer task ─► fragment channel ─► aggregator task ─► chunk channel ─► ChunkSink
//! ```
//!
//! The caller owns the sink (usually a WebSocket). When the sink fails the
//! chunk receiver is dropped, which cascades back through the aggregator to
//! the producer and cancels the upstream request. Cancelled turns are not
//! persisted.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::aggregator::{ChunkAggregator, FlushPolicy, StreamEnd};
use crate::cache::CacheClient;
use crate::error::PipelineError;
use crate::history::{HistoryStore, MessageRepository};
use crate::llm::{CompletionRequest, LlmClient};
use crate::persister::{ConversationPersister, PersistTurn, TurnRepository};
use crate::prompt::PromptComposer;
use crate::protocol::{CHUNK_CHANNEL_CAPACITY, StreamChunk};

/// The client end of a turn could not accept a chunk.
#[derive(Debug, Error)]
#[error("client sink closed: {0}")]
pub struct SinkError(pub String);

/// Destination for client-visible chunks.
#[async_trait]
pub trait ChunkSink: Send {
    async fn send_chunk(&mut self, chunk: &StreamChunk) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub flush: FlushPolicy,
    /// Number of past messages given to the model as context.
    pub history_limit: usize,
    pub model: String,
    pub temperature: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush: FlushPolicy::default(),
            history_limit: 10,
            model: "gpt-4o".into(),
            temperature: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub session_id: i64,
    pub user_id: i64,
    pub message: String,
    /// The session was just created for this message; there is no history to load.
    pub new_session: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub session_id: i64,
    pub full_response: String,
    pub chunks_sent: usize,
    pub end: StreamEnd,
    pub persisted: bool,
}

pub struct ConversationPipeline<R> {
    history: HistoryStore<R>,
    persister: ConversationPersister<R>,
    composer: Arc<PromptComposer>,
    llm: Arc<dyn LlmClient>,
    config: PipelineConfig,
}

impl<R> std::fmt::Debug for ConversationPipeline<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationPipeline")
            .field("llm", &self.llm)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<R> ConversationPipeline<R>
where
    R: MessageRepository + TurnRepository,
{
    pub fn new(
        repo: Arc<R>,
        cache: Arc<dyn CacheClient>,
        llm: Arc<dyn LlmClient>,
        composer: PromptComposer,
        config: PipelineConfig,
    ) -> Self {
        Self {
            history: HistoryStore::new(Arc::clone(&repo), Arc::clone(&cache)),
            persister: ConversationPersister::new(repo, cache),
            composer: Arc::new(composer),
            llm,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one turn, streaming chunks into `sink` as they are produced.
    ///
    /// A non-empty response is persisted even when the provider fails part
    /// way; that case still returns [`PipelineError::Upstream`] so the caller
    /// can report it.
    pub async fn run_turn(
        &self,
        req: &TurnRequest,
        sink: &mut dyn ChunkSink,
    ) -> Result<TurnOutcome, PipelineError> {
        let history = if req.new_session {
            Vec::new()
        } else {
            self.history
                .get_recent(req.session_id, self.config.history_limit)
                .await
                .map_err(PipelineError::History)?
        };

        let messages = self.composer.compose(&history, &req.message)?;
        let fragments = self
            .llm
            .open_stream(CompletionRequest {
                model: self.config.model.clone(),
                temperature: self.config.temperature,
                messages,
            })
            .await?;

        let (chunk_tx, mut chunk_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let aggregator = ChunkAggregator::new(self.config.flush).spawn(fragments, chunk_tx);

        let mut chunks_sent = 0;
        let mut client_gone = false;
        while let Some(content) = chunk_rx.recv().await {
            let chunk = StreamChunk {
                session_id: req.session_id,
                content,
            };
            if let Err(e) = sink.send_chunk(&chunk).await {
                warn!(session_id = req.session_id, error = %e, "client went away mid-stream");
                client_gone = true;
                break;
            }
            chunks_sent += 1;
        }
        drop(chunk_rx);

        let outcome = aggregator.await?;
        let end = if client_gone {
            StreamEnd::Cancelled
        } else {
            outcome.end
        };

        let persisted = end != StreamEnd::Cancelled && !outcome.full_response.is_empty();
        if persisted {
            self.persister
                .persist_turn(&PersistTurn {
                    session_id: req.session_id,
                    user_id: req.user_id,
                    user_text: req.message.clone(),
                    agent_text: outcome.full_response.clone(),
                    new_session: req.new_session,
                })
                .await?;
        }

        info!(
            session_id = req.session_id,
            chunks = chunks_sent,
            persisted,
            end = ?end,
            "turn finished"
        );

        if let StreamEnd::Failed(message) = end {
            return Err(PipelineError::Upstream { message, persisted });
        }

        Ok(TurnOutcome {
            session_id: req.session_id,
            full_response: outcome.full_response,
            chunks_sent,
            end,
            persisted,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cache::MemoryCache;
    use crate::error::StoreError;
    use crate::history::{HistoryEntry, Role};
    use crate::llm::ScriptedLlm;

    /// Session messages kept oldest first.
    #[derive(Debug, Default)]
    struct MemoryRepo {
        rows: Mutex<Vec<(i64, HistoryEntry)>>,
        history_queries: AtomicUsize,
    }

    impl MemoryRepo {
        fn session(&self, session_id: i64) -> Vec<HistoryEntry> {
            self.rows
                .lock()
                .unwrap()
                .iter()
                .filter(|(sid, _)| *sid == session_id)
                .map(|(_, e)| e.clone())
                .collect()
        }
    }

    impl MessageRepository for MemoryRepo {
        async fn recent_messages(
            &self,
            session_id: i64,
            limit: usize,
        ) -> Result<Vec<HistoryEntry>, StoreError> {
            self.history_queries.fetch_add(1, Ordering::SeqCst);
            Ok(self.session(session_id).into_iter().rev().take(limit).collect())
        }
    }

    impl TurnRepository for MemoryRepo {
        async fn insert_turn(
            &self,
            session_id: i64,
            user_text: &str,
            agent_text: &str,
        ) -> Result<(), StoreError> {
            let mut rows = self.rows.lock().unwrap();
            rows.push((session_id, HistoryEntry::new(Role::User, user_text)));
            rows.push((session_id, HistoryEntry::new(Role::Agent, agent_text)));
            Ok(())
        }
    }

    #[derive(Default)]
    struct VecSink {
        chunks: Vec<StreamChunk>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl ChunkSink for VecSink {
        async fn send_chunk(&mut self, chunk: &StreamChunk) -> Result<(), SinkError> {
            if self.fail_after.is_some_and(|n| self.chunks.len() >= n) {
                return Err(SinkError("connection reset".into()));
            }
            self.chunks.push(chunk.clone());
            Ok(())
        }
    }

    fn pipeline(repo: &Arc<MemoryRepo>, llm: &ScriptedLlm) -> ConversationPipeline<MemoryRepo> {
        ConversationPipeline::new(
            Arc::clone(repo),
            Arc::new(MemoryCache::new()),
            Arc::new(llm.clone()),
            PromptComposer::default(),
            PipelineConfig::default(),
        )
    }

    fn request(message: &str) -> TurnRequest {
        TurnRequest {
            session_id: 42,
            user_id: 7,
            message: message.into(),
            new_session: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn short_reply_reaches_client_and_store() {
        let repo = Arc::new(MemoryRepo::default());
        let llm = ScriptedLlm::new(["he", "llo", " there", " friend"]);
        let mut sink = VecSink::default();

        let outcome = pipeline(&repo, &llm)
            .run_turn(&request("hello"), &mut sink)
            .await
            .unwrap();

        assert_eq!(
            sink.chunks,
            vec![StreamChunk {
                session_id: 42,
                content: "hello there friend".into()
            }]
        );
        assert_eq!(outcome.end, StreamEnd::Completed);
        assert!(outcome.persisted);
        assert_eq!(
            repo.session(42),
            vec![
                HistoryEntry::new(Role::User, "hello"),
                HistoryEntry::new(Role::Agent, "hello there friend"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn streamed_chunks_match_persisted_reply() {
        let repo = Arc::new(MemoryRepo::default());
        let words: Vec<String> = (0..40).map(|i| format!("token{i} ")).collect();
        let llm = ScriptedLlm::new(words.clone()).with_delay(std::time::Duration::from_millis(90));
        let mut sink = VecSink::default();

        let outcome = pipeline(&repo, &llm)
            .run_turn(&request("go"), &mut sink)
            .await
            .unwrap();

        let streamed: String = sink.chunks.iter().map(|c| c.content.as_str()).collect();
        assert!(sink.chunks.len() > 1);
        assert_eq!(streamed, words.concat());
        assert_eq!(outcome.chunks_sent, sink.chunks.len());
        assert_eq!(repo.session(42)[1].content, streamed);
    }

    #[tokio::test(start_paused = true)]
    async fn history_feeds_the_next_prompt() {
        let repo = Arc::new(MemoryRepo::default());
        let llm = ScriptedLlm::new(["sure"]);
        let pipeline = pipeline(&repo, &llm);

        pipeline
            .run_turn(&request("first question"), &mut VecSink::default())
            .await
            .unwrap();
        pipeline
            .run_turn(&request("second question"), &mut VecSink::default())
            .await
            .unwrap();

        let requests = llm.requests();
        assert_eq!(requests.len(), 2);
        let second_prompt = &requests[1].messages[1].content;
        assert!(second_prompt.contains("user: first question\nagent: sure"));
        assert!(second_prompt.ends_with("second question"));
        assert_eq!(repo.session(42).len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn new_session_skips_history_lookup() {
        let repo = Arc::new(MemoryRepo::default());
        let llm = ScriptedLlm::new(["hi"]);
        let req = TurnRequest {
            new_session: true,
            ..request("hello")
        };

        pipeline(&repo, &llm)
            .run_turn(&req, &mut VecSink::default())
            .await
            .unwrap();

        assert_eq!(repo.history_queries.load(Ordering::SeqCst), 0);
        assert_eq!(repo.session(42).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn upstream_failure_persists_partial_reply() {
        let repo = Arc::new(MemoryRepo::default());
        let llm = ScriptedLlm::new(["partial ", "answer"]).failing_with("upstream reset");
        let mut sink = VecSink::default();

        let err = pipeline(&repo, &llm)
            .run_turn(&request("question"), &mut sink)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Upstream { ref message, persisted: true } if message == "upstream reset"
        ));
        assert_eq!(sink.chunks.len(), 1);
        assert_eq!(sink.chunks[0].content, "partial answer");
        assert_eq!(repo.session(42)[1], HistoryEntry::new(Role::Agent, "partial answer"));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_client_turn_is_not_persisted() {
        let repo = Arc::new(MemoryRepo::default());
        let llm = ScriptedLlm::new(["a long enough first chunk to flush", " and more"])
            .with_delay(std::time::Duration::from_millis(10));
        let mut sink = VecSink {
            fail_after: Some(0),
            ..VecSink::default()
        };

        let outcome = pipeline(&repo, &llm)
            .run_turn(&request("question"), &mut sink)
            .await
            .unwrap();

        assert_eq!(outcome.end, StreamEnd::Cancelled);
        assert!(!outcome.persisted);
        assert!(repo.session(42).is_empty());
    }

    #[tokio::test]
    async fn empty_reply_is_not_persisted() {
        let repo = Arc::new(MemoryRepo::default());
        let llm = ScriptedLlm::new(Vec::<String>::new());

        let outcome = pipeline(&repo, &llm)
            .run_turn(&request("hello"), &mut VecSink::default())
            .await
            .unwrap();

        assert_eq!(outcome.chunks_sent, 0);
        assert!(!outcome.persisted);
        assert!(repo.session(42).is_empty());
    }

    #[tokio::test]
    async fn provider_refusal_writes_nothing() {
        let repo = Arc::new(MemoryRepo::default());
        let llm = ScriptedLlm::new(["unused"]).refusing("no api key");

        let err = pipeline(&repo, &llm)
            .run_turn(&request("hello"), &mut VecSink::default())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Llm(_)));
        assert!(repo.session(42).is_empty());
    }
}
