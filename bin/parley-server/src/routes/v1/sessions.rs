use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::Utc;
use parley_core::cache::{self, keys};
use serde_json::{Value, json};
use utoipa::OpenApi;
use validator::Validate;

use crate::entities::SessionStore;
use crate::error::ServerError;
use crate::middleware::AuthUser;
use crate::schemas::v1::session::{SessionResponse, UpdateSessionRequest};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(list_sessions, update_session, delete_session),
    components(schemas(SessionResponse, UpdateSessionRequest))
)]
pub struct SessionApi;

/// Register session routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat_sessions", get(list_sessions))
        .route("/chat_sessions/{id}", put(update_session).delete(delete_session))
}

#[utoipa::path(
    get,
    path = "/v1/chat_sessions",
    tag = "sessions",
    responses(
        (status = 200, description = "Active sessions, newest first", body = Vec<SessionResponse>),
        (status = 401, description = "Missing or invalid token"),
    )
)]
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<Vec<SessionResponse>>, ServerError> {
    let key = keys::sessions_list(user.user_id);
    if let Some(cached) = cache::get_json::<Vec<SessionResponse>>(state.cache.as_ref(), &key).await {
        return Ok(Json(cached));
    }

    let sessions: Vec<SessionResponse> = state
        .store
        .list_active_sessions(user.user_id, Utc::now())
        .await?
        .iter()
        .map(|s| s.to_response())
        .collect();

    cache::set_json(state.cache.as_ref(), &key, &sessions, keys::SESSIONS_LIST_TTL).await;
    Ok(Json(sessions))
}

#[utoipa::path(
    put,
    path = "/v1/chat_sessions/{id}",
    tag = "sessions",
    params(("id" = i64, Path, description = "Session id")),
    request_body = UpdateSessionRequest,
    responses(
        (status = 200, description = "Session updated", body = SessionResponse),
        (status = 400, description = "Invalid summary"),
        (status = 404, description = "No such session"),
    )
)]
pub async fn update_session(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<UpdateSessionRequest>,
) -> Result<Json<SessionResponse>, ServerError> {
    req.validate()
        .map_err(|e| ServerError::BadRequest(e.to_string()))?;

    let session = state
        .store
        .update_summary(id, user.user_id, &req.summary)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("session {id} not found")))?;

    cache::invalidate(state.cache.as_ref(), &keys::sessions_list(user.user_id)).await;
    Ok(Json(session.to_response()))
}

#[utoipa::path(
    delete,
    path = "/v1/chat_sessions/{id}",
    tag = "sessions",
    params(("id" = i64, Path, description = "Session id")),
    responses(
        (status = 200, description = "Session and its messages deleted", body = Value),
        (status = 404, description = "No such session"),
    )
)]
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ServerError> {
    if !state.store.delete_session(id, user.user_id).await? {
        return Err(ServerError::NotFound(format!("session {id} not found")));
    }

    let cache = state.cache.as_ref();
    cache::invalidate(cache, &keys::sessions_list(user.user_id)).await;
    cache::invalidate(cache, &keys::messages_list(id)).await;
    cache::invalidate(cache, &keys::conversation_history_pattern(id)).await;
    Ok(Json(json!({ "deleted": true })))
}
