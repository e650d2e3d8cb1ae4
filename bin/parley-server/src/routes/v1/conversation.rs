//! Streaming conversation over a WebSocket.
//!
//! One connection carries one turn: the client sends a single JSON frame,
//! receives zero or more `{session_id, content}` chunk frames, possibly a
//! terminal `{error, details}` frame, and then the server closes the socket.

use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use chrono::Duration;
use parley_core::cache::{self, keys};
use parley_core::PipelineError;
use parley_core::pipeline::{TurnOutcome, TurnRequest};
use thiserror::Error;
use tracing::{Instrument, Span, error, field, info, info_span, warn};
use utoipa::OpenApi;

use crate::config::MAX_SESSION_EXPIRATION_DAYS;
use crate::entities::SessionStore;
use crate::error::ServerError;
use crate::schemas::v1::conversation::{
    ConversationQuery, ErrorFrame, INVALID_FORMAT, InboundMessage, SESSION_NOT_FOUND,
    UNEXPECTED_ERROR, UPSTREAM_ERROR,
};
use crate::state::AppState;
use crate::transport::{ReadError, WsTransport};

#[derive(OpenApi)]
#[openapi(
    paths(conversation),
    components(schemas(InboundMessage, ErrorFrame))
)]
pub struct ConversationApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/messages/conversation", get(conversation))
}

/// Everything that can end a connection before the turn completes.
#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Read(#[from] ReadError),

    #[error("session {0} not found")]
    SessionNotFound(i64),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl ConversationError {
    /// The frame to send the client, if the socket is still usable.
    pub fn frame(&self) -> Option<ErrorFrame> {
        match self {
            ConversationError::InvalidInput(details) => {
                Some(ErrorFrame::new(INVALID_FORMAT, details.clone()))
            }
            ConversationError::Read(e @ (ReadError::Timeout(_) | ReadError::Binary)) => {
                Some(ErrorFrame::new(INVALID_FORMAT, e.to_string()))
            }
            ConversationError::Read(ReadError::Closed | ReadError::Socket(_)) => None,
            ConversationError::SessionNotFound(_) => {
                Some(ErrorFrame::new(SESSION_NOT_FOUND, self.to_string()))
            }
            ConversationError::Pipeline(PipelineError::Upstream { message, .. }) => {
                Some(ErrorFrame::new(UPSTREAM_ERROR, message.clone()))
            }
            ConversationError::Database(_) | ConversationError::Pipeline(_) => {
                Some(ErrorFrame::new(UNEXPECTED_ERROR, self.to_string()))
            }
        }
    }
}

/// Upgrade to a WebSocket after checking the `access_token` query parameter.
#[utoipa::path(
    get,
    path = "/v1/messages/conversation",
    tag = "messages",
    params(ConversationQuery),
    responses(
        (status = 101, description = "Switching to WebSocket; send one InboundMessage frame"),
        (status = 401, description = "Missing or invalid token"),
    )
)]
pub async fn conversation(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConversationQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    let token = query
        .access_token
        .as_deref()
        .ok_or_else(|| ServerError::Unauthorized("missing access_token".into()))?;
    let user_id = state.auth.verify(token)?;

    Ok(ws.on_upgrade(move |socket| handle_socket(state, user_id, socket)))
}

async fn handle_socket(state: Arc<AppState>, user_id: i64, socket: WebSocket) {
    let span = info_span!("conversation", user_id, session_id = field::Empty);

    async move {
        let mut transport = WsTransport::new(socket);

        match run_conversation(&state, user_id, &mut transport).await {
            Ok(outcome) => info!(
                chunks = outcome.chunks_sent,
                persisted = outcome.persisted,
                end = ?outcome.end,
                "conversation turn complete"
            ),
            Err(e) => {
                match &e {
                    ConversationError::InvalidInput(_) | ConversationError::Read(_) => {
                        warn!(error = %e, "conversation aborted")
                    }
                    _ => error!(error = %e, "conversation failed"),
                }
                if let Some(frame) = e.frame() {
                    transport.send_error(&frame).await;
                }
            }
        }

        transport.close("conversation finished").await;
    }
    .instrument(span)
    .await
}

async fn run_conversation(
    state: &AppState,
    user_id: i64,
    transport: &mut WsTransport,
) -> Result<TurnOutcome, ConversationError> {
    let raw = transport.read_text(state.config.ws_read_timeout).await?;
    let inbound = InboundMessage::parse(&raw).map_err(ConversationError::InvalidInput)?;

    let (session_id, new_session) = match inbound.session_id {
        Some(id) => {
            state
                .store
                .get_session(id, user_id)
                .await?
                .ok_or(ConversationError::SessionNotFound(id))?;
            (id, false)
        }
        None => {
            let lifetime = Duration::try_days(state.config.session_expiration_days)
                .unwrap_or_else(|| Duration::days(MAX_SESSION_EXPIRATION_DAYS));
            let session = state
                .store
                .create_session(user_id, &inbound.message, lifetime)
                .await?;
            // The row outlives a failed turn, so the list is stale from here on.
            cache::invalidate(state.cache.as_ref(), &keys::sessions_list(user_id)).await;
            info!(session_id = session.id, "created chat session");
            (session.id, true)
        }
    };
    Span::current().record("session_id", session_id);

    let request = TurnRequest {
        session_id,
        user_id,
        message: inbound.message,
        new_session,
    };
    Ok(state.pipeline.run_turn(&request, transport).await?)
}

#[cfg(test)]
mod test {
    use std::time::Duration as StdDuration;

    use super::*;

    #[test]
    fn invalid_input_maps_to_format_error() {
        let frame = ConversationError::InvalidInput("'message' field is required.".into())
            .frame()
            .unwrap();
        assert_eq!(frame.error, INVALID_FORMAT);
        assert_eq!(frame.details, "'message' field is required.");
    }

    #[test]
    fn upstream_failure_maps_to_upstream_error() {
        let e = ConversationError::Pipeline(PipelineError::Upstream {
            message: "rate limited".into(),
            persisted: true,
        });
        assert_eq!(e.frame(), Some(ErrorFrame::new(UPSTREAM_ERROR, "rate limited")));
    }

    #[test]
    fn closed_socket_gets_no_frame() {
        assert!(ConversationError::Read(ReadError::Closed).frame().is_none());
        let timeout = ConversationError::Read(ReadError::Timeout(StdDuration::from_secs(30)));
        assert_eq!(timeout.frame().unwrap().error, INVALID_FORMAT);
    }
}
