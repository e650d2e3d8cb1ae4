#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Duration, Utc};
use parley_core::cache::MemoryCache;
use parley_core::llm::ScriptedLlm;
use parley_core::prompt::PromptComposer;
use parley_server::config::Config;
use parley_server::entities::SqliteStore;
use parley_server::routes;
use parley_server::state::AppState;

pub const SECRET: &str = "integration-test-secret";
pub const USER: i64 = 7;

pub async fn state_with(llm: &ScriptedLlm) -> Arc<AppState> {
    let config = Config::from_lookup(|key| match key {
        "PARLEY_JWT_SECRET" => Some(SECRET.to_owned()),
        "PARLEY_WS_READ_TIMEOUT_SECS" => Some("5".to_owned()),
        _ => None,
    });
    let store = SqliteStore::in_memory().await.unwrap();
    Arc::new(AppState::new(
        config,
        store,
        Arc::new(MemoryCache::new()),
        Arc::new(llm.clone()),
        PromptComposer::default(),
    ))
}

pub fn token_for(state: &AppState, user_id: i64) -> String {
    let exp = (Utc::now() + Duration::hours(1)).timestamp() as u64;
    state.auth.issue(user_id, exp).unwrap()
}

/// Insert a session with a fixed id, owned by `user_id`.
pub async fn insert_session(state: &AppState, id: i64, user_id: i64) {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO chat_sessions (id, user_id, start_time, end_time, summary, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?3, ?3)",
    )
    .bind(id)
    .bind(user_id)
    .bind(now.to_rfc3339())
    .bind((now + Duration::days(7)).to_rfc3339())
    .bind("seeded")
    .execute(state.store.pool())
    .await
    .unwrap();
}

pub async fn count(state: &AppState, table: &str) -> i64 {
    let (n,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(state.store.pool())
        .await
        .unwrap();
    n
}

/// Serve the full router on an ephemeral port.
pub async fn spawn_server(state: Arc<AppState>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = routes::build(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}
