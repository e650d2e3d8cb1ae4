//! WebSocket end of a conversation turn.

use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use parley_core::pipeline::{ChunkSink, SinkError};
use parley_core::protocol::StreamChunk;
use serde::Serialize;
use tracing::debug;

use crate::schemas::v1::conversation::ErrorFrame;

/// Why no inbound text frame could be read.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("no message received within {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("client closed the connection")]
    Closed,
    #[error("binary frames are not supported")]
    Binary,
    #[error("websocket error: {0}")]
    Socket(#[from] axum::Error),
}

/// Owns the socket for the lifetime of one connection.
pub struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }

    /// Wait for the next text frame, skipping control frames.
    pub async fn read_text(&mut self, timeout: Duration) -> Result<String, ReadError> {
        let read = async {
            loop {
                match self.socket.recv().await {
                    Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
                    Some(Ok(Message::Binary(_))) => return Err(ReadError::Binary),
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => return Err(ReadError::Closed),
                    Some(Err(e)) => return Err(ReadError::Socket(e)),
                }
            }
        };
        tokio::time::timeout(timeout, read)
            .await
            .unwrap_or(Err(ReadError::Timeout(timeout)))
    }

    async fn send_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), SinkError> {
        let text = serde_json::to_string(value).map_err(|e| SinkError(e.to_string()))?;
        self.socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SinkError(e.to_string()))
    }

    /// Best effort; the client may already be gone.
    pub async fn send_error(&mut self, frame: &ErrorFrame) {
        if let Err(e) = self.send_json(frame).await {
            debug!(error = %e, "could not deliver error frame");
        }
    }

    /// Send a normal close frame. Errors are ignored.
    pub async fn close(mut self, reason: &str) {
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: reason.to_owned().into(),
        };
        if let Err(e) = self.socket.send(Message::Close(Some(frame))).await {
            debug!(error = %e, "close frame not delivered");
        }
    }
}

#[async_trait]
impl ChunkSink for WsTransport {
    async fn send_chunk(&mut self, chunk: &StreamChunk) -> Result<(), SinkError> {
        self.send_json(chunk).await
    }
}
