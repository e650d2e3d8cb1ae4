//! Liveness plus a database round-trip check.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tracing::warn;
use utoipa::OpenApi;

use crate::entities::SqliteStore;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(get_health))]
pub struct HealthApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(get_health))
}

/// `{"status", "version", "database"}`; 503 while the database is unreachable.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Server and database are healthy", body = Value),
        (status = 503, description = "Database unreachable", body = Value),
    )
)]
pub async fn get_health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    report(&state.store).await
}

async fn report(store: &SqliteStore) -> (StatusCode, Json<Value>) {
    let (status, code, database) = match store.ping().await {
        Ok(()) => ("ok", StatusCode::OK, "ok"),
        Err(e) => {
            warn!(error = %e, "health check: database unreachable");
            ("degraded", StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    };
    (
        code,
        Json(json!({
            "status": status,
            "version": env!("CARGO_PKG_VERSION"),
            "database": database,
        })),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn reachable_database_reports_ok() {
        let store = SqliteStore::in_memory().await.unwrap();
        let (code, Json(body)) = report(&store).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["database"], "ok");
        assert!(!body["version"].as_str().unwrap_or("").is_empty());
    }

    #[tokio::test]
    async fn closed_pool_reports_degraded() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.pool().close().await;
        let (code, Json(body)) = report(&store).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "degraded");
    }
}
