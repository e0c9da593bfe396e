//! Lobby chat message model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest accepted chat message, in characters.
pub const MAX_CHAT_LENGTH: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendChatRequest {
    pub user_id: String,
    pub user_name: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentChatQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}
