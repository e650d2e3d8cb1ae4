//! OpenAI-compatible streaming chat completions over SSE.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{CompletionRequest, LlmClient, PromptMessage};
use crate::error::LlmError;
use crate::protocol::{FRAGMENT_CHANNEL_CAPACITY, Fragment, FragmentStream};

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Base URL up to and including the version segment, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// Sent as a bearer token when non-empty.
    pub api_key: String,
    /// Longest wait for the response headers, and then for each body chunk.
    pub idle_timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key: String::new(),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Self {
        Self::with_http(reqwest::Client::new(), config)
    }

    pub fn with_http(http: reqwest::Client, config: OpenAiConfig) -> Self {
        Self { http, config }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

// ── wire types ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    temperature: f32,
    messages: &'a [PromptMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct StreamEvent {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<StreamEventError>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct Delta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamEventError {
    message: String,
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn open_stream(&self, request: CompletionRequest) -> Result<FragmentStream, LlmError> {
        let body = ChatCompletionBody {
            model: &request.model,
            temperature: request.temperature,
            messages: &request.messages,
            stream: true,
        };

        let mut req = self.http.post(self.endpoint()).json(&body);
        if !self.config.api_key.is_empty() {
            req = req.bearer_auth(&self.config.api_key);
        }

        // The idle bound also covers the wait for response headers.
        let timeout = self.config.idle_timeout;
        let resp = tokio::time::timeout(timeout, req.send())
            .await
            .map_err(|_| LlmError::Timeout(timeout))??;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Status { status, body });
        }

        debug!(model = %request.model, "model stream opened");
        let (tx, rx) = mpsc::channel(FRAGMENT_CHANNEL_CAPACITY);
        tokio::spawn(produce(resp, tx, self.config.idle_timeout));
        Ok(rx)
    }
}

/// Pump the SSE body into `tx` until the stream ends or the receiver goes away.
async fn produce(resp: reqwest::Response, tx: mpsc::Sender<Fragment>, idle_timeout: Duration) {
    let mut body = resp.bytes_stream();
    let mut decoder = SseDecoder::default();

    loop {
        let next = match tokio::time::timeout(idle_timeout, body.next()).await {
            Ok(next) => next,
            Err(_) => {
                warn!(timeout_secs = idle_timeout.as_secs(), "model stream idle timeout");
                let _ = tx
                    .send(Fragment::Error(format!(
                        "model stream produced no data for {}s",
                        idle_timeout.as_secs()
                    )))
                    .await;
                return;
            }
        };

        let chunk = match next {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                warn!(error = %e, "model stream transport error");
                let _ = tx.send(Fragment::Error(e.to_string())).await;
                return;
            }
            None => {
                // Some providers close the body without a `[DONE]` marker.
                let _ = tx.send(Fragment::Done).await;
                return;
            }
        };

        for fragment in decoder.feed(&chunk) {
            let terminal = !matches!(fragment, Fragment::Token(_));
            if tx.send(fragment).await.is_err() {
                debug!("fragment receiver dropped; abandoning model stream");
                return;
            }
            if terminal {
                return;
            }
        }
    }
}

/// Incremental decoder for the `data:` lines of an SSE body.
///
/// Bytes are buffered until a full line is available so multi-byte
/// characters split across body chunks decode correctly.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buf: BytesMut,
    finished: bool,
}

impl SseDecoder {
    /// Feed raw body bytes; returns the fragments completed by them.
    ///
    /// Nothing is returned after a terminal fragment has been produced.
    pub(crate) fn feed(&mut self, bytes: &[u8]) -> Vec<Fragment> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();

        while !self.finished {
            let Some(pos) = self.buf.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line = self.buf.split_to(pos);
            self.buf.advance(1);

            let line = String::from_utf8_lossy(&line);
            if let Some(fragment) = self.parse_line(line.trim()) {
                self.finished = !matches!(fragment, Fragment::Token(_));
                out.push(fragment);
            }
        }
        out
    }

    fn parse_line(&self, line: &str) -> Option<Fragment> {
        let data = line.strip_prefix("data:")?.trim_start();
        if data == "[DONE]" {
            return Some(Fragment::Done);
        }

        let event: StreamEvent = match serde_json::from_str(data) {
            Ok(event) => event,
            Err(e) => return Some(Fragment::Error(format!("malformed stream event: {e}"))),
        };
        if let Some(error) = event.error {
            return Some(Fragment::Error(error.message));
        }

        let choice = event.choices.into_iter().next()?;
        match choice.delta.content {
            Some(content) if !content.is_empty() => Some(Fragment::Token(content)),
            _ if choice.finish_reason.is_some() => Some(Fragment::Done),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    fn event(content: &str) -> String {
        format!("data: {{\"choices\":[{{\"delta\":{{\"content\":{content:?}}},\"finish_reason\":null}}]}}\n\n")
    }

    #[test]
    fn decoder_emits_tokens_then_done() {
        let mut decoder = SseDecoder::default();
        let body = format!("{}{}data: [DONE]\n\n", event("hel"), event("lo"));
        let fragments = decoder.feed(body.as_bytes());
        assert_eq!(
            fragments,
            vec![
                Fragment::Token("hel".into()),
                Fragment::Token("lo".into()),
                Fragment::Done
            ]
        );
    }

    #[test]
    fn decoder_handles_lines_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        let body = event("héllo");
        let bytes = body.as_bytes();
        // Split inside the two-byte `é`.
        let split = body.find('é').unwrap() + 1;

        assert!(decoder.feed(&bytes[..split]).is_empty());
        assert_eq!(decoder.feed(&bytes[split..]), vec![Fragment::Token("héllo".into())]);
    }

    #[test]
    fn decoder_ignores_comments_and_role_only_deltas() {
        let mut decoder = SseDecoder::default();
        let body = ": keep-alive\n\ndata: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n";
        assert!(decoder.feed(body.as_bytes()).is_empty());
    }

    #[test]
    fn decoder_finish_reason_ends_stream() {
        let mut decoder = SseDecoder::default();
        let body = "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n";
        assert_eq!(decoder.feed(body.as_bytes()), vec![Fragment::Done]);
        // Anything after the terminal event is dropped.
        assert!(decoder.feed(event("late").as_bytes()).is_empty());
    }

    #[test]
    fn decoder_surfaces_provider_errors() {
        let mut decoder = SseDecoder::default();
        let body = "data: {\"error\":{\"message\":\"rate limited\"}}\n\n";
        assert_eq!(
            decoder.feed(body.as_bytes()),
            vec![Fragment::Error("rate limited".into())]
        );

        let mut decoder = SseDecoder::default();
        let fragments = decoder.feed(b"data: {not json\n");
        assert!(matches!(&fragments[..], [Fragment::Error(m)] if m.starts_with("malformed")));
    }

    /// Serve one canned HTTP response on an ephemeral port.
    async fn serve_once(response: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            // Read headers plus the JSON body before answering.
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(end) = text.find("\r\n\r\n") {
                    let len = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + len {
                        break;
                    }
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{addr}/v1")
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "gpt-4o".into(),
            temperature: 0.5,
            messages: vec![PromptMessage::user("hello")],
        }
    }

    #[tokio::test]
    async fn streams_tokens_from_provider() {
        let body = format!("{}{}data: [DONE]\n\n", event("hello"), event(" there"));
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n{body}"
        );
        let base_url = serve_once(response).await;
        let client = OpenAiClient::new(OpenAiConfig {
            base_url,
            ..OpenAiConfig::default()
        });

        let mut rx = client.open_stream(request()).await.unwrap();
        let mut fragments = Vec::new();
        while let Some(f) = rx.recv().await {
            fragments.push(f);
        }
        assert_eq!(
            fragments,
            vec![
                Fragment::Token("hello".into()),
                Fragment::Token(" there".into()),
                Fragment::Done
            ]
        );
    }

    #[tokio::test]
    async fn silent_provider_times_out_before_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and hold the connection without ever answering.
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        let client = OpenAiClient::new(OpenAiConfig {
            base_url: format!("http://{addr}/v1"),
            idle_timeout: Duration::from_millis(300),
            ..OpenAiConfig::default()
        });

        let started = std::time::Instant::now();
        let err = client.open_stream(request()).await.unwrap_err();
        assert!(matches!(err, LlmError::Timeout(t) if t == Duration::from_millis(300)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn non_success_status_fails_before_stream() {
        let response = "HTTP/1.1 401 Unauthorized\r\ncontent-type: application/json\r\ncontent-length: 15\r\nconnection: close\r\n\r\n{\"error\":\"no\"}\n".to_string();
        let base_url = serve_once(response).await;
        let client = OpenAiClient::new(OpenAiConfig {
            base_url,
            ..OpenAiConfig::default()
        });

        let err = client.open_stream(request()).await.unwrap_err();
        assert!(matches!(err, LlmError::Status { status: 401, .. }));
    }
}
