//! Livestream slot rotation.
//!
//! One slot is live at a time; DJs who checked in wait in the lobby and are
//! promoted in start-time order as the live slot ends. `check_and_advance` is
//! driven by polling clients, the cron endpoint or the in-process job runner.
//!
//! Planning is a pure function over a snapshot of the active slots. Applying a
//! plan is a series of conditional writes; if any of them loses a race the
//! snapshot is re-read and planning starts over.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};

use crate::auth::ensure_owner;
use crate::db::{NewSlot, Repository};
use crate::errors::AppError;
use crate::models::{
    ListSlotsQuery, LivestreamStatus, ReserveSlotRequest, Slot, SlotStatus, SlotTransition,
    StreamKeyResponse, SwitchoverReport,
};
use crate::push::{self, Broadcaster};

/// Upper bound on re-planning after lost races within one invocation.
const MAX_ROUNDS: usize = 8;

/// Longest window the slot listing will return.
const MAX_LIST_SPAN_DAYS: i64 = 31;

/// A status change the planner wants applied.
#[derive(Debug, Clone)]
pub struct PlannedTransition {
    pub slot: Slot,
    pub to: SlotStatus,
}

/// Decide which transitions bring the snapshot up to date at `now`.
///
/// Transitions are returned in the order they must be applied: the ending
/// live slot first, then the promotion, then slots that were missed.
pub fn plan_transitions(slots: &[Slot], now: DateTime<Utc>) -> Vec<PlannedTransition> {
    let mut plan = Vec::new();

    let live = slots.iter().find(|s| s.status == SlotStatus::Live);
    let live_ended = live.is_some_and(|s| s.has_ended(now));

    if let (Some(current), true) = (live, live_ended) {
        plan.push(PlannedTransition {
            slot: current.clone(),
            to: SlotStatus::Completed,
        });
    }

    let promoted = if live.is_none() || live_ended {
        next_to_promote(slots, now, live_ended)
    } else {
        None
    };

    if let Some(next) = promoted {
        plan.push(PlannedTransition {
            slot: next.clone(),
            to: SlotStatus::Live,
        });
    }

    for slot in slots {
        let waiting = matches!(slot.status, SlotStatus::Scheduled | SlotStatus::InLobby);
        if waiting && slot.has_ended(now) {
            plan.push(PlannedTransition {
                slot: slot.clone(),
                to: SlotStatus::Missed,
            });
        }
    }

    plan
}

/// The waiting DJ who should go live next.
///
/// Right after a handover the earliest DJ in the lobby takes over even if
/// their own start time has not arrived yet. With nobody live, a waiting DJ
/// goes live only once their start time arrives.
pub fn next_to_promote(slots: &[Slot], now: DateTime<Utc>, handover: bool) -> Option<&Slot> {
    slots
        .iter()
        .filter(|s| s.status == SlotStatus::InLobby && !s.has_ended(now))
        .filter(|s| handover || s.has_started(now))
        .min_by_key(|s| (s.start_time, s.seq))
}

/// Split active slots into the live one and the waiting queue.
///
/// The queue lists checked-in DJs first, then those not yet checked in, each
/// group by start time. Slots whose window is over are left out.
pub fn live_and_queue(slots: Vec<Slot>, now: DateTime<Utc>) -> (Option<Slot>, Vec<Slot>) {
    let mut live = None;
    let mut lobby = Vec::new();
    let mut scheduled = Vec::new();

    for slot in slots {
        match slot.status {
            SlotStatus::Live => live = Some(slot),
            SlotStatus::InLobby if !slot.has_ended(now) => lobby.push(slot),
            SlotStatus::Scheduled if !slot.has_ended(now) => scheduled.push(slot),
            _ => {}
        }
    }

    lobby.sort_by_key(|s| (s.start_time, s.seq));
    scheduled.sort_by_key(|s| (s.start_time, s.seq));
    lobby.extend(scheduled);

    (live, lobby)
}

/// Slot lifecycle operations.
#[derive(Clone)]
pub struct SlotScheduler {
    repo: Arc<Repository>,
    push: Arc<dyn Broadcaster>,
    lobby_open: chrono::Duration,
    max_slot_length: chrono::Duration,
}

impl SlotScheduler {
    pub fn new(
        repo: Arc<Repository>,
        push: Arc<dyn Broadcaster>,
        lobby_open: chrono::Duration,
        max_slot_length: chrono::Duration,
    ) -> Self {
        Self {
            repo,
            push,
            lobby_open,
            max_slot_length,
        }
    }

    /// Advance the rotation to `now` and return the resulting state.
    pub async fn check_and_advance(&self, now: DateTime<Utc>) -> Result<SwitchoverReport, AppError> {
        let mut transitions = Vec::new();
        let mut slots = self.repo.list_active_slots().await?;

        for round in 0.. {
            let plan = plan_transitions(&slots, now);
            if plan.is_empty() {
                break;
            }
            if round == MAX_ROUNDS {
                tracing::warn!(
                    pending = plan.len(),
                    "Slot rotation did not settle, leaving the rest for the next run"
                );
                break;
            }

            for step in plan {
                let Some(updated) = self.repo.transition_slot(&step.slot, step.to, now).await?
                else {
                    tracing::debug!(slot_id = %step.slot.id, to = %step.to, "Lost slot transition race, re-planning");
                    break;
                };

                tracing::info!(
                    slot_id = %updated.id,
                    dj_id = %updated.dj_id,
                    from = %step.slot.status,
                    to = %updated.status,
                    "Slot transition"
                );
                self.announce(&updated).await;
                transitions.push(SlotTransition {
                    slot_id: updated.id.clone(),
                    dj_id: updated.dj_id.clone(),
                    from: step.slot.status,
                    to: updated.status,
                });
            }

            slots = self.repo.list_active_slots().await?;
        }

        let (live, queue) = live_and_queue(slots, now);
        Ok(SwitchoverReport {
            live,
            queue,
            transitions,
            server_time: now,
        })
    }

    /// Current live slot and queue, without advancing anything.
    pub async fn status(&self, now: DateTime<Utc>) -> Result<LivestreamStatus, AppError> {
        let (live, queue) = live_and_queue(self.repo.list_active_slots().await?, now);
        Ok(LivestreamStatus {
            live,
            queue,
            server_time: now,
        })
    }

    /// Reserve a time window for a DJ.
    pub async fn reserve(
        &self,
        request: &ReserveSlotRequest,
        now: DateTime<Utc>,
    ) -> Result<Slot, AppError> {
        if request.dj_id.trim().is_empty() {
            return Err(AppError::Validation("djId is required".to_string()));
        }
        if request.dj_name.trim().is_empty() {
            return Err(AppError::Validation("djName is required".to_string()));
        }

        let start_time = request.start_time.trunc_subsecs(3);
        let end_time = request.end_time.trunc_subsecs(3);

        if end_time <= start_time {
            return Err(AppError::Validation(
                "endTime must be after startTime".to_string(),
            ));
        }
        if end_time - start_time > self.max_slot_length {
            return Err(AppError::Validation(format!(
                "Slots may be at most {} minutes long",
                self.max_slot_length.num_minutes()
            )));
        }
        if end_time <= now {
            return Err(AppError::Validation(
                "Cannot reserve a slot that has already ended".to_string(),
            ));
        }

        let slot = self
            .repo
            .create_slot(
                &NewSlot {
                    dj_id: request.dj_id.trim(),
                    dj_name: request.dj_name.trim(),
                    start_time,
                    end_time,
                },
                now,
            )
            .await?;

        tracing::info!(slot_id = %slot.id, dj_id = %slot.dj_id, start = %slot.start_time, "Slot reserved");
        Ok(slot)
    }

    /// List slots intersecting a window, defaulting to the last 12 hours and
    /// the coming week.
    pub async fn list(&self, query: &ListSlotsQuery, now: DateTime<Utc>) -> Result<Vec<Slot>, AppError> {
        let from = query.from.unwrap_or(now - chrono::Duration::hours(12));
        let to = query.to.unwrap_or(now + chrono::Duration::days(7));

        if to <= from {
            return Err(AppError::Validation("'to' must be after 'from'".to_string()));
        }
        if to - from > chrono::Duration::days(MAX_LIST_SPAN_DAYS) {
            return Err(AppError::Validation(format!(
                "Window may span at most {} days",
                MAX_LIST_SPAN_DAYS
            )));
        }

        self.repo.list_slots_between(from, to).await
    }

    pub async fn get(&self, id: &str) -> Result<Slot, AppError> {
        self.repo
            .get_slot(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Slot {} not found", id)))
    }

    /// Move the owning DJ into the lobby, then advance in case they can go
    /// live right away.
    pub async fn check_in(&self, id: &str, dj_id: &str, now: DateTime<Utc>) -> Result<Slot, AppError> {
        let slot = self.get(id).await?;
        ensure_owner(&slot.dj_id, dj_id, "check in to this slot")?;

        match slot.status {
            SlotStatus::Scheduled => {}
            SlotStatus::InLobby | SlotStatus::Live => return Ok(slot),
            other => {
                return Err(AppError::Conflict(format!(
                    "Slot is {} and can no longer be checked into",
                    other
                )))
            }
        }

        let opens_at = slot.start_time - self.lobby_open;
        if now < opens_at {
            return Err(AppError::Validation(format!(
                "Check-in opens at {}",
                opens_at.to_rfc3339()
            )));
        }
        if slot.has_ended(now) {
            return Err(AppError::Conflict("Slot has already ended".to_string()));
        }

        self.repo
            .transition_slot(&slot, SlotStatus::InLobby, now)
            .await?
            .ok_or_else(|| AppError::Conflict("Slot changed concurrently, retry".to_string()))?;
        tracing::info!(slot_id = %slot.id, dj_id = %slot.dj_id, "DJ checked into lobby");

        self.check_and_advance(now).await?;
        self.get(id).await
    }

    /// End a live slot early and hand over to the next DJ.
    pub async fn end(&self, id: &str, dj_id: &str, now: DateTime<Utc>) -> Result<SwitchoverReport, AppError> {
        let slot = self.get(id).await?;
        ensure_owner(&slot.dj_id, dj_id, "end this slot")?;

        if slot.status != SlotStatus::Live {
            return Err(AppError::Conflict(format!(
                "Slot is {}, only a live slot can be ended",
                slot.status
            )));
        }

        let ended = self
            .repo
            .transition_slot(&slot, SlotStatus::Completed, now)
            .await?
            .ok_or_else(|| AppError::Conflict("Slot changed concurrently, retry".to_string()))?;
        tracing::info!(slot_id = %slot.id, dj_id = %slot.dj_id, "DJ ended slot early");
        self.announce(&ended).await;

        let mut transitions = vec![SlotTransition {
            slot_id: ended.id.clone(),
            dj_id: ended.dj_id.clone(),
            from: SlotStatus::Live,
            to: SlotStatus::Completed,
        }];

        let slots = self.repo.list_active_slots().await?;
        if let Some(next) = next_to_promote(&slots, now, true) {
            // Losing this race means someone else already advanced the rotation.
            if let Some(promoted) = self.repo.transition_slot(next, SlotStatus::Live, now).await? {
                tracing::info!(slot_id = %promoted.id, dj_id = %promoted.dj_id, "Next DJ took over");
                self.announce(&promoted).await;
                transitions.push(SlotTransition {
                    slot_id: promoted.id.clone(),
                    dj_id: promoted.dj_id.clone(),
                    from: SlotStatus::InLobby,
                    to: SlotStatus::Live,
                });
            }
        }

        let mut report = self.check_and_advance(now).await?;
        transitions.append(&mut report.transitions);
        report.transitions = transitions;
        Ok(report)
    }

    /// Withdraw a reservation that has not gone live.
    pub async fn cancel(&self, id: &str, dj_id: &str) -> Result<(), AppError> {
        let slot = self.get(id).await?;
        ensure_owner(&slot.dj_id, dj_id, "cancel this slot")?;

        if !matches!(slot.status, SlotStatus::Scheduled | SlotStatus::InLobby) {
            return Err(AppError::Conflict(format!(
                "Slot is {} and can no longer be cancelled",
                slot.status
            )));
        }

        if !self.repo.delete_slot(&slot).await? {
            return Err(AppError::Conflict(
                "Slot changed concurrently, retry".to_string(),
            ));
        }

        tracing::info!(slot_id = %slot.id, dj_id = %slot.dj_id, "Slot cancelled");
        Ok(())
    }

    pub async fn stream_key(&self, id: &str, dj_id: &str) -> Result<StreamKeyResponse, AppError> {
        let slot = self.get(id).await?;
        ensure_owner(&slot.dj_id, dj_id, "read this stream key")?;

        Ok(StreamKeyResponse {
            slot_id: slot.id,
            stream_key: slot.stream_key,
        })
    }

    async fn announce(&self, slot: &Slot) {
        let event = match slot.status {
            SlotStatus::Live => push::events::SLOT_LIVE,
            SlotStatus::Completed => push::events::SLOT_ENDED,
            _ => return,
        };
        let data = serde_json::json!({
            "slotId": slot.id,
            "djId": slot.dj_id,
            "djName": slot.dj_name,
            "startTime": slot.start_time,
            "endTime": slot.end_time,
        });
        push::publish_best_effort(self.push.as_ref(), push::LIVESTREAM_CHANNEL, event, data).await;
    }
}
