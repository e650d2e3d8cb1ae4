use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::routes::{health, v1};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(info(
    title = "parley-server",
    description = "Chat sessions, message history and streaming conversations",
    version = "0.1.0",
))]
pub struct ApiDoc;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    let mut root = ApiDoc::openapi();
    root.merge(health::HealthApi::openapi());
    root.merge(v1::api_docs());
    root
}

/// Serve the OpenAPI document as JSON.
pub fn router() -> Router<Arc<AppState>> {
    let doc = Arc::new(get_docs());
    Router::new().route(
        "/api-docs/openapi.json",
        get(move || {
            let doc = Arc::clone(&doc);
            async move { Json(doc.as_ref().clone()) }
        }),
    )
}
