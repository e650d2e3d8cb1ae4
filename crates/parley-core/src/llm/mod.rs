//! Streaming model provider clients.
//!
//! An [`LlmClient`] turns a [`CompletionRequest`] into a [`FragmentStream`].
//! Failures before the stream opens come back as [`LlmError`]; failures after
//! it opens arrive in-band as a terminal [`Fragment::Error`].
//!
//! [`Fragment::Error`]: crate::protocol::Fragment::Error

pub mod openai;
#[cfg(any(test, feature = "test-util"))]
pub mod scripted;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

use crate::error::LlmError;
use crate::protocol::FragmentStream;

pub use openai::{OpenAiClient, OpenAiConfig};
#[cfg(any(test, feature = "test-util"))]
pub use scripted::ScriptedLlm;

/// Role of a message sent to the model provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::User,
            content: content.into(),
        }
    }
}

/// A single streaming chat completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub temperature: f32,
    pub messages: Vec<PromptMessage>,
}

/// A provider that can stream a chat completion.
#[async_trait]
pub trait LlmClient: Send + Sync + std::fmt::Debug {
    /// Open a completion stream.
    ///
    /// The returned stream is finite and cannot be restarted. Dropping it
    /// stops the producer and the underlying upstream request.
    async fn open_stream(&self, request: CompletionRequest) -> Result<FragmentStream, LlmError>;
}
