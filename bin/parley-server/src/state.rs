//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use parley_core::cache::CacheClient;
use parley_core::llm::LlmClient;
use parley_core::pipeline::ConversationPipeline;
use parley_core::prompt::PromptComposer;

use crate::config::Config;
use crate::entities::SqliteStore;
use crate::middleware::TokenVerifier;

#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Chat sessions and messages.
    pub store: Arc<SqliteStore>,
    /// Read-through cache for session and message listings.
    pub cache: Arc<dyn CacheClient>,
    /// Runs conversation turns for the WebSocket endpoint.
    pub pipeline: Arc<ConversationPipeline<SqliteStore>>,
    pub auth: Arc<TokenVerifier>,
}

impl AppState {
    /// Wire the pipeline to the shared store and cache.
    pub fn new(
        config: Config,
        store: SqliteStore,
        cache: Arc<dyn CacheClient>,
        llm: Arc<dyn LlmClient>,
        composer: PromptComposer,
    ) -> Self {
        let store = Arc::new(store);
        let pipeline = ConversationPipeline::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            llm,
            composer,
            config.pipeline(),
        );
        Self {
            auth: Arc::new(TokenVerifier::new(&config.jwt_secret)),
            config: Arc::new(config),
            store,
            cache,
            pipeline: Arc::new(pipeline),
        }
    }
}
