//! Livestream slot model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a livestream slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Scheduled,
    InLobby,
    Live,
    Completed,
    Missed,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Scheduled => "scheduled",
            SlotStatus::InLobby => "in_lobby",
            SlotStatus::Live => "live",
            SlotStatus::Completed => "completed",
            SlotStatus::Missed => "missed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(SlotStatus::Scheduled),
            "in_lobby" => Some(SlotStatus::InLobby),
            "live" => Some(SlotStatus::Live),
            "completed" => Some(SlotStatus::Completed),
            "missed" => Some(SlotStatus::Missed),
            _ => None,
        }
    }

    /// Completed and missed slots never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SlotStatus::Completed | SlotStatus::Missed)
    }
}

impl std::fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reserved time window for one DJ to be the single live broadcaster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub id: String,
    pub dj_id: String,
    pub dj_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: SlotStatus,
    /// Only handed out to the owning DJ through the stream-key endpoint
    #[serde(skip)]
    pub stream_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Internal version for optimistic concurrency control
    #[serde(default)]
    pub version: i64,
    /// Insertion order, breaks start-time ties
    #[serde(skip)]
    pub seq: i64,
}

impl Slot {
    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        self.end_time <= now
    }

    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        self.start_time <= now
    }
}

/// Request body for reserving a slot.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveSlotRequest {
    pub dj_id: String,
    pub dj_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Request body for DJ actions on their own slot (check-in, end).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotActionRequest {
    pub dj_id: String,
}

/// Query string identifying the caller for owner-only reads and cancels.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerQuery {
    pub dj_id: String,
}

/// Query string for listing slots in a window.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSlotsQuery {
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
}

/// A single status change applied by the scheduler.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SlotTransition {
    pub slot_id: String,
    pub dj_id: String,
    pub from: SlotStatus,
    pub to: SlotStatus,
}

/// Current live slot and the waiting queue.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LivestreamStatus {
    pub live: Option<Slot>,
    pub queue: Vec<Slot>,
    pub server_time: DateTime<Utc>,
}

/// Outcome of a check-and-advance run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchoverReport {
    pub live: Option<Slot>,
    pub queue: Vec<Slot>,
    pub transitions: Vec<SlotTransition>,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamKeyResponse {
    pub slot_id: String,
    pub stream_key: String,
}
