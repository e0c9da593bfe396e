//! Lobby chat.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::db::Repository;
use crate::errors::AppError;
use crate::models::{ChatMessage, CleanupReport, SendChatRequest, MAX_CHAT_LENGTH};
use crate::push::{self, Broadcaster};
use crate::ratelimit::RateLimiter;

const DEFAULT_RECENT: i64 = 50;
const MAX_RECENT: i64 = 200;

pub struct ChatService {
    repo: Arc<Repository>,
    push: Arc<dyn Broadcaster>,
    retention: chrono::Duration,
    sends: RateLimiter,
}

impl ChatService {
    pub fn new(
        repo: Arc<Repository>,
        push: Arc<dyn Broadcaster>,
        retention: chrono::Duration,
        rate_per_minute: u32,
    ) -> Self {
        Self {
            repo,
            push,
            retention,
            sends: RateLimiter::per_minute("chat", rate_per_minute),
        }
    }

    /// Store a message and fan it out to the lobby.
    pub async fn send(
        &self,
        request: &SendChatRequest,
        now: DateTime<Utc>,
    ) -> Result<ChatMessage, AppError> {
        let user_id = request.user_id.trim();
        if user_id.is_empty() {
            return Err(AppError::Validation("userId is required".to_string()));
        }
        let user_name = request.user_name.trim();
        if user_name.is_empty() {
            return Err(AppError::Validation("userName is required".to_string()));
        }
        let text = request.text.trim();
        if text.is_empty() {
            return Err(AppError::Validation("Message cannot be empty".to_string()));
        }
        if text.chars().count() > MAX_CHAT_LENGTH {
            return Err(AppError::Validation(format!(
                "Message may be at most {} characters",
                MAX_CHAT_LENGTH
            )));
        }

        self.sends.check(user_id)?;

        let message = ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
            text: text.to_string(),
            created_at: now,
        };
        self.repo.insert_chat_message(&message).await?;

        push::publish_best_effort(
            self.push.as_ref(),
            push::LOBBY_CHANNEL,
            push::events::CHAT_MESSAGE,
            serde_json::to_value(&message)?,
        )
        .await;

        Ok(message)
    }

    pub async fn recent(&self, limit: Option<i64>) -> Result<Vec<ChatMessage>, AppError> {
        let limit = limit.unwrap_or(DEFAULT_RECENT).clamp(1, MAX_RECENT);
        self.repo.recent_chat_messages(limit).await
    }

    /// Drop messages older than the retention window.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<CleanupReport, AppError> {
        let removed = self.repo.delete_chat_before(now - self.retention).await?;
        if removed > 0 {
            tracing::info!(removed, "Removed expired chat messages");
        }
        Ok(CleanupReport { removed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::testing::RecordingBroadcaster;
    use crate::test_support::{at, temp_repo};

    fn request(user_id: &str, text: &str) -> SendChatRequest {
        SendChatRequest {
            user_id: user_id.to_string(),
            user_name: "Nina".to_string(),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_send_and_recent_in_order() {
        let (repo, _dir) = temp_repo().await;
        let push = Arc::new(RecordingBroadcaster::default());
        let chat = ChatService::new(repo, push.clone(), chrono::Duration::hours(24), 100);

        chat.send(&request("u1", "first"), at(12, 0, 0)).await.unwrap();
        chat.send(&request("u1", "  second  "), at(12, 0, 1)).await.unwrap();
        chat.send(&request("u1", "third"), at(12, 0, 2)).await.unwrap();

        let recent = chat.recent(Some(2)).await.unwrap();
        let texts: Vec<&str> = recent.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["second", "third"]);
        assert_eq!(push.event_names().len(), 3);
    }

    #[tokio::test]
    async fn test_rejects_empty_and_oversized_text() {
        let (repo, _dir) = temp_repo().await;
        let chat = ChatService::new(
            repo,
            Arc::new(RecordingBroadcaster::default()),
            chrono::Duration::hours(24),
            100,
        );

        let err = chat.send(&request("u1", "   "), at(12, 0, 0)).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let long = "x".repeat(MAX_CHAT_LENGTH + 1);
        let err = chat.send(&request("u1", &long), at(12, 0, 0)).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let exact = "x".repeat(MAX_CHAT_LENGTH);
        chat.send(&request("u1", &exact), at(12, 0, 0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limit_is_per_user() {
        let (repo, _dir) = temp_repo().await;
        let chat = ChatService::new(
            repo,
            Arc::new(RecordingBroadcaster::default()),
            chrono::Duration::hours(24),
            2,
        );
        let now = at(12, 0, 0);

        chat.send(&request("u1", "a"), now).await.unwrap();
        chat.send(&request("u1", "b"), now).await.unwrap();
        let err = chat.send(&request("u1", "c"), now).await.unwrap_err();
        assert!(matches!(err, AppError::RateLimited { .. }));

        chat.send(&request("u2", "a"), now).await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_honours_retention() {
        let (repo, _dir) = temp_repo().await;
        let chat = ChatService::new(
            repo,
            Arc::new(RecordingBroadcaster::default()),
            chrono::Duration::hours(1),
            100,
        );

        chat.send(&request("u1", "old"), at(10, 0, 0)).await.unwrap();
        chat.send(&request("u1", "new"), at(11, 30, 0)).await.unwrap();

        let report = chat.cleanup(at(12, 0, 0)).await.unwrap();
        assert_eq!(report.removed, 1);
        let remaining = chat.recent(None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].text, "new");
    }
}
