//! A deterministic [`LlmClient`] that replays canned fragments.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{CompletionRequest, LlmClient};
use crate::error::LlmError;
use crate::protocol::{FRAGMENT_CHANNEL_CAPACITY, Fragment, FragmentStream, fragment_stream};

/// Replays a fixed script for every request.
///
/// Tokens are emitted in order, optionally separated by a delay, and the
/// stream ends with either [`Fragment::Done`] or the injected error.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLlm {
    tokens: Vec<String>,
    delay: Option<Duration>,
    error: Option<String>,
    open_error: Option<String>,
    calls: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedLlm {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Wait `delay` before each token.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// End the stream with `Fragment::Error(message)` instead of `Done`.
    pub fn failing_with(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    /// Refuse to open the stream, as a provider answering HTTP 503 would.
    pub fn refusing(mut self, message: impl Into<String>) -> Self {
        self.open_error = Some(message.into());
        self
    }

    /// Number of `open_stream` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn script(&self) -> Vec<Fragment> {
        let terminal = match &self.error {
            Some(message) => Fragment::Error(message.clone()),
            None => Fragment::Done,
        };
        self.tokens
            .iter()
            .cloned()
            .map(Fragment::Token)
            .chain(std::iter::once(terminal))
            .collect()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn open_stream(&self, request: CompletionRequest) -> Result<FragmentStream, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        if let Some(message) = &self.open_error {
            return Err(LlmError::Status {
                status: 503,
                body: message.clone(),
            });
        }

        let script = self.script();
        let Some(delay) = self.delay else {
            return Ok(fragment_stream(script));
        };

        let (tx, rx) = mpsc::channel(FRAGMENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            for fragment in script {
                if matches!(fragment, Fragment::Token(_)) {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(fragment).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "test".into(),
            temperature: 0.0,
            messages: vec![],
        }
    }

    async fn drain(mut rx: FragmentStream) -> Vec<Fragment> {
        let mut out = Vec::new();
        while let Some(f) = rx.recv().await {
            out.push(f);
        }
        out
    }

    #[tokio::test]
    async fn replays_script_and_counts_calls() {
        let llm = ScriptedLlm::new(["a", "b"]);
        let fragments = drain(llm.open_stream(request()).await.unwrap()).await;
        assert_eq!(
            fragments,
            vec![Fragment::Token("a".into()), Fragment::Token("b".into()), Fragment::Done]
        );
        assert_eq!(llm.calls(), 1);
        assert_eq!(llm.requests()[0].model, "test");
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_script_ends_with_injected_error() {
        let llm = ScriptedLlm::new(["x"])
            .with_delay(Duration::from_millis(300))
            .failing_with("boom");
        let started = tokio::time::Instant::now();
        let fragments = drain(llm.open_stream(request()).await.unwrap()).await;
        assert_eq!(
            fragments,
            vec![Fragment::Token("x".into()), Fragment::Error("boom".into())]
        );
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn refusing_client_fails_to_open() {
        let llm = ScriptedLlm::new(["a"]).refusing("offline");
        let err = llm.open_stream(request()).await.unwrap_err();
        assert!(matches!(err, LlmError::Status { status: 503, ref body } if body == "offline"));
        assert_eq!(llm.calls(), 1);
    }
}
