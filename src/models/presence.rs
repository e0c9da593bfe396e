//! Lobby presence model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the user shows to the rest of the lobby.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    #[default]
    Online,
    Away,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(PresenceStatus::Online),
            "away" => Some(PresenceStatus::Away),
            _ => None,
        }
    }
}

/// Heartbeat record of a user in the lobby.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub status: PresenceStatus,
    pub is_dj: bool,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl PresenceRecord {
    /// Whether the last heartbeat falls within the staleness window.
    pub fn is_online(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        now - self.last_seen <= stale_after
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinLobbyRequest {
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub is_dj: bool,
}

/// Body shared by heartbeat and leave.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUserRequest {
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePresenceRequest {
    pub user_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub status: Option<PresenceStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatAck {
    pub user_id: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveAck {
    pub user_id: String,
    pub was_present: bool,
}

/// Users currently online in the lobby.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineList {
    pub users: Vec<PresenceRecord>,
    pub count: usize,
    pub server_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_is_online_boundary() {
        let seen = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let record = PresenceRecord {
            user_id: "u".into(),
            display_name: "U".into(),
            avatar_url: None,
            status: PresenceStatus::Online,
            is_dj: false,
            joined_at: seen,
            last_seen: seen,
        };
        let window = chrono::Duration::seconds(120);
        assert!(record.is_online(seen + chrono::Duration::seconds(120), window));
        assert!(!record.is_online(seen + chrono::Duration::seconds(150), window));
    }
}
