//! Coalesces raw model fragments into client-visible chunks.
//!
//! Fragments arrive at whatever size and pace the provider chooses. The
//! aggregator buffers them and flushes a chunk when either the buffer holds
//! at least [`FlushPolicy::min_chars`] characters or [`FlushPolicy::max_interval`]
//! has elapsed since the previous flush while text is waiting, whichever comes
//! first. A timer enforces the interval so a stalled provider cannot hold
//! buffered text back.
//!
//! ```text
//! Streaming ──(threshold|timer)──► Flush ──► Streaming
//!     │
//!     └─(Done|Error|closed)──► FinalFlush (if residual) ──► Done
//! ```

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::protocol::{Fragment, FragmentStream};

/// When to turn buffered text into a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Flush as soon as the buffer holds this many characters (Unicode scalar values).
    pub min_chars: usize,
    /// Flush buffered text at the latest this long after the previous flush.
    pub max_interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            min_chars: 25,
            max_interval: Duration::from_secs(1),
        }
    }
}

/// How the fragment stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// The provider signalled completion.
    Completed,
    /// The provider failed; everything received before the failure was flushed.
    Failed(String),
    /// The chunk receiver went away before the stream ended.
    Cancelled,
}

/// Result of aggregating one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateOutcome {
    /// Every token received, in order. Equals the concatenation of all emitted
    /// chunks unless the stream was cancelled.
    pub full_response: String,
    pub chunks_emitted: usize,
    pub end: StreamEnd,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkAggregator {
    policy: FlushPolicy,
}

/// Pending text plus bookkeeping for the current flush window.
struct Buffer {
    text: String,
    chars: usize,
    last_flush: Instant,
    emitted: usize,
}

/// The chunk receiver is gone.
struct Closed;

impl Buffer {
    fn push(&mut self, token: &str) {
        self.text.push_str(token);
        self.chars += token.chars().count();
    }

    async fn flush(&mut self, chunks: &mpsc::Sender<String>) -> Result<(), Closed> {
        if self.text.is_empty() {
            return Ok(());
        }
        self.chars = 0;
        self.last_flush = Instant::now();
        chunks
            .send(std::mem::take(&mut self.text))
            .await
            .map_err(|_| Closed)?;
        self.emitted += 1;
        Ok(())
    }
}

impl ChunkAggregator {
    pub fn new(policy: FlushPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> FlushPolicy {
        self.policy
    }

    /// Run [`ChunkAggregator::run`] on its own task.
    pub fn spawn(
        self,
        fragments: FragmentStream,
        chunks: mpsc::Sender<String>,
    ) -> JoinHandle<AggregateOutcome> {
        tokio::spawn(async move { self.run(fragments, chunks).await })
    }

    /// Consume `fragments` until the stream ends, sending chunks to `chunks`.
    ///
    /// Returns once the stream has ended and the residual has been flushed, or
    /// as soon as `chunks` is closed. `fragments` is dropped on return, which
    /// stops the producer.
    pub async fn run(
        &self,
        mut fragments: FragmentStream,
        chunks: mpsc::Sender<String>,
    ) -> AggregateOutcome {
        let mut full_response = String::new();
        let mut buf = Buffer {
            text: String::new(),
            chars: 0,
            last_flush: Instant::now(),
            emitted: 0,
        };

        let end = loop {
            let deadline = buf.last_flush + self.policy.max_interval;
            let waiting = !buf.text.is_empty();

            let next = tokio::select! {
                biased;
                _ = chunks.closed() => break StreamEnd::Cancelled,
                _ = sleep_until(deadline), if waiting => {
                    if buf.flush(&chunks).await.is_err() {
                        break StreamEnd::Cancelled;
                    }
                    continue;
                }
                next = fragments.recv() => next,
            };

            match next {
                Some(Fragment::Token(token)) => {
                    full_response.push_str(&token);
                    buf.push(&token);
                    let due = buf.chars >= self.policy.min_chars
                        || buf.last_flush.elapsed() >= self.policy.max_interval;
                    if due && buf.flush(&chunks).await.is_err() {
                        break StreamEnd::Cancelled;
                    }
                }
                Some(Fragment::Done) => break StreamEnd::Completed,
                Some(Fragment::Error(message)) => break StreamEnd::Failed(message),
                None => break StreamEnd::Failed("model stream closed without completing".into()),
            }
        };

        let end = match end {
            StreamEnd::Cancelled => StreamEnd::Cancelled,
            end => match buf.flush(&chunks).await {
                Ok(()) => end,
                Err(Closed) => StreamEnd::Cancelled,
            },
        };

        debug!(
            chunks = buf.emitted,
            chars = full_response.chars().count(),
            end = ?end,
            "stream aggregation finished"
        );

        AggregateOutcome {
            full_response,
            chunks_emitted: buf.emitted,
            end,
        }
    }
}
