//! parley-core: the streaming conversation pipeline.
//!
//! A turn flows through the modules in this order:
//!
//! 1. [`history`] loads the bounded conversation context (cache first).
//! 2. [`prompt`] renders the model request.
//! 3. [`llm`] opens a fragment stream against the model provider.
//! 4. [`aggregator`] coalesces fragments into client-visible chunks.
//! 5. [`persister`] writes the user/agent pair and invalidates the cache.
//!
//! [`pipeline`] wires the stages together behind a single `run_turn` call.

pub mod aggregator;
pub mod cache;
pub mod error;
pub mod history;
pub mod llm;
pub mod persister;
pub mod pipeline;
pub mod prompt;
pub mod protocol;

pub use error::{CacheError, LlmError, PersistError, PipelineError, PromptError, StoreError};
