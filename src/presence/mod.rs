//! Lobby presence tracking.
//!
//! Clients join, heartbeat while the lobby is open and leave. A user whose last
//! heartbeat is older than the staleness window is offline; cleanup removes
//! such records for good.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;

use crate::db::Repository;
use crate::errors::AppError;
use crate::models::{
    CleanupReport, HeartbeatAck, JoinLobbyRequest, LeaveAck, OnlineList, PresenceRecord,
    PresenceStatus, UpdatePresenceRequest,
};
use crate::push::{self, Broadcaster};
use crate::ratelimit::RateLimiter;

const MAX_DISPLAY_NAME_LENGTH: usize = 64;

/// Presence operations with a short-lived cache in front of the online list.
pub struct PresenceService {
    repo: Arc<Repository>,
    push: Arc<dyn Broadcaster>,
    stale: chrono::Duration,
    online: Cache<(), Arc<Vec<PresenceRecord>>>,
    heartbeats: RateLimiter,
}

impl PresenceService {
    pub fn new(
        repo: Arc<Repository>,
        push: Arc<dyn Broadcaster>,
        stale: Duration,
        cache_ttl: Duration,
        heartbeat_rate_per_minute: u32,
    ) -> Self {
        let online = Cache::builder()
            .max_capacity(1)
            .time_to_live(cache_ttl)
            .build();

        Self {
            repo,
            push,
            stale: chrono::Duration::from_std(stale).unwrap_or(chrono::Duration::seconds(120)),
            online,
            heartbeats: RateLimiter::per_minute("heartbeat", heartbeat_rate_per_minute),
        }
    }

    pub async fn join(
        &self,
        request: &JoinLobbyRequest,
        now: DateTime<Utc>,
    ) -> Result<PresenceRecord, AppError> {
        let user_id = require("userId", &request.user_id)?;
        let display_name = display_name(&request.display_name)?;

        let record = PresenceRecord {
            user_id: user_id.to_string(),
            display_name,
            avatar_url: request.avatar_url.clone().filter(|u| !u.trim().is_empty()),
            status: PresenceStatus::Online,
            is_dj: request.is_dj,
            joined_at: now,
            last_seen: now,
        };
        self.repo.upsert_presence(&record).await?;
        self.online.invalidate(&()).await;

        tracing::debug!(user_id = %record.user_id, is_dj = record.is_dj, "User joined lobby");
        push::publish_best_effort(
            self.push.as_ref(),
            push::LOBBY_CHANNEL,
            push::events::USER_JOINED,
            serde_json::to_value(&record)?,
        )
        .await;

        Ok(record)
    }

    /// Refresh `lastSeen`. Heartbeats do not touch the cache; the read-time
    /// staleness filter keeps the cached list honest.
    pub async fn heartbeat(&self, user_id: &str, now: DateTime<Utc>) -> Result<HeartbeatAck, AppError> {
        let user_id = require("userId", user_id)?;
        self.heartbeats.check(user_id)?;

        if !self.repo.touch_presence(user_id, now).await? {
            return Err(AppError::NotFound(format!(
                "User {} is not in the lobby, join first",
                user_id
            )));
        }

        Ok(HeartbeatAck {
            user_id: user_id.to_string(),
            last_seen: now,
        })
    }

    pub async fn update(
        &self,
        request: &UpdatePresenceRequest,
        now: DateTime<Utc>,
    ) -> Result<PresenceRecord, AppError> {
        let user_id = require("userId", &request.user_id)?;
        let normalized = UpdatePresenceRequest {
            user_id: user_id.to_string(),
            display_name: request.display_name.as_deref().map(display_name).transpose()?,
            avatar_url: request.avatar_url.clone().filter(|u| !u.trim().is_empty()),
            status: request.status,
        };

        let record = self
            .repo
            .update_presence(&normalized, now)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {} is not in the lobby", user_id)))?;
        self.online.invalidate(&()).await;

        push::publish_best_effort(
            self.push.as_ref(),
            push::LOBBY_CHANNEL,
            push::events::USER_UPDATED,
            serde_json::to_value(&record)?,
        )
        .await;

        Ok(record)
    }

    /// Remove the user. Leaving when already gone succeeds quietly.
    pub async fn leave(&self, user_id: &str) -> Result<LeaveAck, AppError> {
        let user_id = require("userId", user_id)?;
        let was_present = self.repo.delete_presence(user_id).await?;

        if was_present {
            self.online.invalidate(&()).await;
            tracing::debug!(user_id, "User left lobby");
            push::publish_best_effort(
                self.push.as_ref(),
                push::LOBBY_CHANNEL,
                push::events::USER_LEFT,
                serde_json::json!({ "userId": user_id }),
            )
            .await;
        }

        Ok(LeaveAck {
            user_id: user_id.to_string(),
            was_present,
        })
    }

    /// Users whose last heartbeat falls within the staleness window.
    ///
    /// Heartbeats leave the cached snapshot alone, so an entry can age out of
    /// it while the stored `lastSeen` has moved on. When that happens the
    /// snapshot is re-read once before filtering.
    pub async fn list(&self, now: DateTime<Utc>) -> Result<OnlineList, AppError> {
        let mut cached = self.snapshot(now).await?;
        if cached.iter().any(|r| !r.is_online(now, self.stale)) {
            self.online.invalidate(&()).await;
            cached = self.snapshot(now).await?;
        }

        let users: Vec<PresenceRecord> = cached
            .iter()
            .filter(|r| r.is_online(now, self.stale))
            .cloned()
            .collect();

        Ok(OnlineList {
            count: users.len(),
            users,
            server_time: now,
        })
    }

    async fn snapshot(&self, now: DateTime<Utc>) -> Result<Arc<Vec<PresenceRecord>>, AppError> {
        let cutoff = now - self.stale;
        let repo = self.repo.clone();
        self.online
            .try_get_with((), async move { repo.list_presence_since(cutoff).await.map(Arc::new) })
            .await
            .map_err(|e| AppError::Database(e.message()))
    }

    /// Delete records that went stale.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<CleanupReport, AppError> {
        let removed = self.repo.delete_presence_before(now - self.stale).await?;
        if removed > 0 {
            self.online.invalidate(&()).await;
            tracing::info!(removed, "Removed stale presence records");
        }
        Ok(CleanupReport { removed })
    }
}

fn require<'a>(field: &str, value: &'a str) -> Result<&'a str, AppError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AppError::Validation(format!("{} is required", field)));
    }
    Ok(value)
}

fn display_name(value: &str) -> Result<String, AppError> {
    let name = require("displayName", value)?;
    if name.chars().count() > MAX_DISPLAY_NAME_LENGTH {
        return Err(AppError::Validation(format!(
            "displayName may be at most {} characters",
            MAX_DISPLAY_NAME_LENGTH
        )));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::testing::RecordingBroadcaster;
    use crate::test_support::{at, temp_repo};

    fn service(repo: Arc<Repository>, push: Arc<RecordingBroadcaster>) -> PresenceService {
        PresenceService::new(
            repo,
            push,
            Duration::from_secs(120),
            Duration::from_secs(20),
            100,
        )
    }

    fn join_request(user_id: &str) -> JoinLobbyRequest {
        JoinLobbyRequest {
            user_id: user_id.to_string(),
            display_name: format!("DJ {}", user_id),
            avatar_url: None,
            is_dj: true,
        }
    }

    #[tokio::test]
    async fn test_stale_user_is_hidden_then_removed() {
        let (repo, _dir) = temp_repo().await;
        let presence = service(repo.clone(), Arc::new(RecordingBroadcaster::default()));
        let t0 = at(12, 0, 0);

        presence.join(&join_request("u1"), t0).await.unwrap();
        presence.heartbeat("u1", t0).await.unwrap();

        // Prime the cache while the user is still fresh.
        assert_eq!(presence.list(t0).await.unwrap().count, 1);

        let later = t0 + chrono::Duration::seconds(150);
        let list = presence.list(later).await.unwrap();
        assert_eq!(list.count, 0, "cached entry must be filtered at read time");

        let report = presence.cleanup(later).await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(repo.get_presence("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_after_cache_fill_keeps_user_listed() {
        let (repo, _dir) = temp_repo().await;
        let presence = service(repo, Arc::new(RecordingBroadcaster::default()));
        let t0 = at(12, 0, 0);

        presence.join(&join_request("u1"), t0).await.unwrap();

        // Snapshot taken with lastSeen = t0, then the user heartbeats.
        let fill = t0 + chrono::Duration::seconds(100);
        assert_eq!(presence.list(fill).await.unwrap().count, 1);
        presence
            .heartbeat("u1", t0 + chrono::Duration::seconds(105))
            .await
            .unwrap();

        // By the snapshot the user went stale; the stored heartbeat says otherwise.
        let list = presence.list(t0 + chrono::Duration::seconds(125)).await.unwrap();
        assert_eq!(list.count, 1);
        assert_eq!(list.users[0].last_seen, t0 + chrono::Duration::seconds(105));
    }

    #[tokio::test]
    async fn test_update_trims_user_id_and_display_name() {
        let (repo, _dir) = temp_repo().await;
        let presence = service(repo.clone(), Arc::new(RecordingBroadcaster::default()));
        let now = at(12, 0, 0);
        presence.join(&join_request("u1"), now).await.unwrap();

        let updated = presence
            .update(
                &UpdatePresenceRequest {
                    user_id: "  u1 ".into(),
                    display_name: Some("  Night Owl  ".into()),
                    avatar_url: None,
                    status: None,
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(updated.user_id, "u1");
        assert_eq!(updated.display_name, "Night Owl");

        let stored = repo.get_presence("u1").await.unwrap().unwrap();
        assert_eq!(stored.display_name, "Night Owl");
    }

    #[tokio::test]
    async fn test_heartbeat_requires_join() {
        let (repo, _dir) = temp_repo().await;
        let presence = service(repo, Arc::new(RecordingBroadcaster::default()));

        let err = presence.heartbeat("ghost", at(12, 0, 0)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_join_update_leave_broadcasts_and_invalidates() {
        let (repo, _dir) = temp_repo().await;
        let push = Arc::new(RecordingBroadcaster::default());
        let presence = service(repo, push.clone());
        let now = at(12, 0, 0);

        presence.join(&join_request("u1"), now).await.unwrap();
        assert_eq!(presence.list(now).await.unwrap().count, 1);

        presence.join(&join_request("u2"), now).await.unwrap();
        assert_eq!(presence.list(now).await.unwrap().count, 2);

        let updated = presence
            .update(
                &UpdatePresenceRequest {
                    user_id: "u1".into(),
                    display_name: None,
                    avatar_url: None,
                    status: Some(PresenceStatus::Away),
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(updated.status, PresenceStatus::Away);
        let list = presence.list(now).await.unwrap();
        let u1 = list.users.iter().find(|u| u.user_id == "u1").unwrap();
        assert_eq!(u1.status, PresenceStatus::Away);

        assert!(presence.leave("u1").await.unwrap().was_present);
        assert!(!presence.leave("u1").await.unwrap().was_present);
        assert_eq!(presence.list(now).await.unwrap().count, 1);

        assert_eq!(
            push.event_names(),
            vec!["user-joined", "user-joined", "user-updated", "user-left"]
        );
    }

    #[tokio::test]
    async fn test_update_unknown_user_is_not_found() {
        let (repo, _dir) = temp_repo().await;
        let presence = service(repo, Arc::new(RecordingBroadcaster::default()));

        let err = presence
            .update(
                &UpdatePresenceRequest {
                    user_id: "ghost".into(),
                    display_name: Some("Ghost".into()),
                    avatar_url: None,
                    status: None,
                },
                at(12, 0, 0),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_heartbeats_are_rate_limited() {
        let (repo, _dir) = temp_repo().await;
        let presence = PresenceService::new(
            repo,
            Arc::new(RecordingBroadcaster::default()),
            Duration::from_secs(120),
            Duration::from_secs(20),
            2,
        );
        let now = at(12, 0, 0);
        presence.join(&join_request("u1"), now).await.unwrap();

        presence.heartbeat("u1", now).await.unwrap();
        presence.heartbeat("u1", now).await.unwrap();
        let err = presence.heartbeat("u1", now).await.unwrap_err();
        assert!(matches!(err, AppError::RateLimited { .. }));
    }
}
