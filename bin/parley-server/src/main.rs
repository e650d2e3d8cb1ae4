//! parley-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON in production, pretty in dev).
//! 3. Open the SQLite database and run pending migrations.
//! 4. Connect the cache (Redis when configured, in-process otherwise).
//! 5. Build the model client, prompt composer and shared state.
//! 6. Build the Axum router and start the HTTP server with graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use parley_core::cache::{CacheClient, MemoryCache};
use parley_core::llm::OpenAiClient;
use parley_core::prompt::PromptComposer;
use tracing::{info, warn};

use parley_server::cache::RedisCache;
use parley_server::config::Config;
use parley_server::entities::SqliteStore;
use parley_server::routes;
use parley_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: PARLEY_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "parley-server starting");
    // Configuration is read before the subscriber exists.
    for key in &cfg.invalid_keys {
        warn!(%key, "ignored invalid configuration value");
    }

    // ── 3. Database ────────────────────────────────────────────────────────────
    let store = SqliteStore::connect(&cfg.database_url)
        .await
        .with_context(|| format!("failed to open database {}", cfg.database_url))?;
    info!(database_url = %cfg.database_url, "database ready");

    // ── 4. Cache ───────────────────────────────────────────────────────────────
    let cache: Arc<dyn CacheClient> = match &cfg.redis_url {
        Some(url) => {
            let redis = RedisCache::connect(url)
                .await
                .context("failed to connect to redis")?;
            info!("redis cache ready");
            Arc::new(redis)
        }
        None => {
            warn!("PARLEY_REDIS_URL not set; using in-process cache");
            Arc::new(MemoryCache::new())
        }
    };

    // ── 5. Model client and shared state ───────────────────────────────────────
    if cfg.openai_api_key.is_empty() {
        warn!("OPENAI_API_KEY not set; model requests will likely be rejected");
    }
    if cfg.jwt_secret.is_empty() {
        warn!("PARLEY_JWT_SECRET not set; every authenticated request will be rejected");
    }

    let composer = match &cfg.system_prompt_path {
        Some(path) => {
            let prompt = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read system prompt from {path}"))?;
            info!(path = %path, "loaded system prompt");
            PromptComposer::new(prompt)
        }
        None => PromptComposer::default(),
    };
    let llm = Arc::new(OpenAiClient::new(cfg.openai()));

    let bind_address = cfg.bind_address.clone();
    let state = Arc::new(AppState::new(cfg, store, cache, llm, composer));

    // ── 6. HTTP server with graceful shutdown ──────────────────────────────────
    let app = routes::build(state);
    let addr: SocketAddr = bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("parley-server stopped");
    Ok(())
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
