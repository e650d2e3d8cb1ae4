use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use parley_core::cache::{self, keys};
use utoipa::OpenApi;

use crate::entities::{MessageStore, SessionStore};
use crate::error::ServerError;
use crate::middleware::AuthUser;
use crate::schemas::v1::message::MessageResponse;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(list_messages), components(schemas(MessageResponse)))]
pub struct MessageApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/messages/{session_id}", get(list_messages))
}

#[utoipa::path(
    get,
    path = "/v1/messages/{session_id}",
    tag = "messages",
    params(("session_id" = i64, Path, description = "Session id")),
    responses(
        (status = 200, description = "Messages of the session, oldest first", body = Vec<MessageResponse>),
        (status = 404, description = "No such session"),
    )
)]
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(session_id): Path<i64>,
) -> Result<Json<Vec<MessageResponse>>, ServerError> {
    if state.store.get_session(session_id, user.user_id).await?.is_none() {
        return Err(ServerError::NotFound(format!("session {session_id} not found")));
    }

    let key = keys::messages_list(session_id);
    if let Some(cached) = cache::get_json::<Vec<MessageResponse>>(state.cache.as_ref(), &key).await {
        return Ok(Json(cached));
    }

    let messages: Vec<MessageResponse> = state
        .store
        .list_messages(session_id)
        .await?
        .iter()
        .map(|m| m.to_response())
        .collect();

    cache::set_json(state.cache.as_ref(), &key, &messages, keys::MESSAGES_TTL).await;
    Ok(Json(messages))
}
