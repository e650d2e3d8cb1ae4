use chrono::{DateTime, Utc};
use parley_core::history::{HistoryEntry, Role};
use serde::{Deserialize, Serialize};

/// A row in the `messages` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub session_id: i64,
    pub content: String,
    pub is_user: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Message> for HistoryEntry {
    fn from(m: Message) -> Self {
        HistoryEntry::new(Role::from_is_user(m.is_user), m.content)
    }
}
