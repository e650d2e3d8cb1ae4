use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::entities::ChatSession;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Validate)]
pub struct UpdateSessionRequest {
    #[validate(length(min = 1, max = 1000))]
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SessionResponse {
    pub id: i64,
    pub user_id: i64,
    pub start_time: String,
    pub end_time: String,
    pub summary: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ChatSession {
    pub fn to_response(&self) -> SessionResponse {
        SessionResponse {
            id: self.id,
            user_id: self.user_id,
            start_time: self.start_time.to_rfc3339(),
            end_time: self.end_time.to_rfc3339(),
            summary: self.summary.clone(),
            created_at: self.created_at.to_rfc3339(),
            updated_at: self.updated_at.to_rfc3339(),
        }
    }
}
