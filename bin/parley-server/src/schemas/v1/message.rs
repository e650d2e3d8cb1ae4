use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::entities::Message;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    pub id: i64,
    pub session_id: i64,
    pub content: String,
    pub is_user: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Message {
    pub fn to_response(&self) -> MessageResponse {
        MessageResponse {
            id: self.id,
            session_id: self.session_id,
            content: self.content.clone(),
            is_user: self.is_user,
            created_at: self.created_at.to_rfc3339(),
            updated_at: self.updated_at.to_rfc3339(),
        }
    }
}
