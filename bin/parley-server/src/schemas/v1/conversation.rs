//! Frames exchanged over the conversation WebSocket.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

pub const INVALID_FORMAT: &str = "Invalid message format";
pub const MESSAGE_REQUIRED: &str = "'message' field is required.";
pub const UPSTREAM_ERROR: &str = "Upstream model error";
pub const SESSION_NOT_FOUND: &str = "Session not found";
pub const UNEXPECTED_ERROR: &str = "Unexpected error occurred";

/// Query string of the WebSocket upgrade request.
#[derive(Debug, Clone, Deserialize, IntoParams)]
pub struct ConversationQuery {
    /// Bearer token; the browser WebSocket API cannot set headers.
    pub access_token: Option<String>,
}

/// The single inbound frame of a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, Validate)]
pub struct InboundMessage {
    #[validate(length(min = 1))]
    pub message: String,
    /// Continue this session; absent starts a new one.
    #[serde(default)]
    pub session_id: Option<i64>,
}

impl InboundMessage {
    /// Decode and validate a raw text frame.
    ///
    /// Returns the client-facing error detail when the frame is unusable.
    pub fn parse(raw: &str) -> Result<Self, String> {
        #[derive(Deserialize)]
        struct Loose {
            message: Option<serde_json::Value>,
            session_id: Option<i64>,
        }

        let loose: Loose =
            serde_json::from_str(raw).map_err(|e| format!("malformed payload: {e}"))?;
        let message = match loose.message {
            Some(serde_json::Value::String(s)) => s,
            _ => return Err(MESSAGE_REQUIRED.to_owned()),
        };

        let inbound = InboundMessage {
            message,
            session_id: loose.session_id,
        };
        inbound.validate().map_err(|_| MESSAGE_REQUIRED.to_owned())?;
        Ok(inbound)
    }
}

/// Terminal error frame sent before the socket closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ErrorFrame {
    pub error: String,
    pub details: String,
}

impl ErrorFrame {
    pub fn new(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: details.into(),
        }
    }
}
