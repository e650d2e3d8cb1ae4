pub mod conversation;
pub mod messages;
pub mod sessions;

use std::sync::Arc;

use axum::Router;
use utoipa::OpenApi;

use crate::state::AppState;

/// Routes nested under `/v1`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(sessions::router())
        .merge(messages::router())
        .merge(conversation::router())
}

#[derive(OpenApi)]
#[openapi()]
pub struct V1Api;

pub fn api_docs() -> utoipa::openapi::OpenApi {
    let mut doc = V1Api::openapi();
    doc.merge(sessions::SessionApi::openapi());
    doc.merge(messages::MessageApi::openapi());
    doc.merge(conversation::ConversationApi::openapi());
    doc
}
