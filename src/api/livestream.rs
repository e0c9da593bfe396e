//! Livestream slot endpoints.

use axum::extract::{Path, State};
use chrono::Utc;
use serde::Serialize;

use super::{success, ApiJson, ApiQuery, ApiResult};
use crate::models::{
    ListSlotsQuery, LivestreamStatus, OwnerQuery, ReserveSlotRequest, Slot, SlotActionRequest,
    StreamKeyResponse, SwitchoverReport,
};
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledSlot {
    pub id: String,
}

/// GET /api/livestream/status - Live slot and queue, read-only.
pub async fn livestream_status(State(state): State<AppState>) -> ApiResult<LivestreamStatus> {
    success(state.scheduler.status(Utc::now()).await?)
}

/// POST /api/livestream/switchover - Advance the rotation.
pub async fn switchover(State(state): State<AppState>) -> ApiResult<SwitchoverReport> {
    success(state.scheduler.check_and_advance(Utc::now()).await?)
}

/// GET /api/livestream/slots - Slots in a time window.
pub async fn list_slots(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<ListSlotsQuery>,
) -> ApiResult<Vec<Slot>> {
    success(state.scheduler.list(&query, Utc::now()).await?)
}

/// POST /api/livestream/slots - Reserve a slot.
pub async fn reserve_slot(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<ReserveSlotRequest>,
) -> ApiResult<Slot> {
    success(state.scheduler.reserve(&request, Utc::now()).await?)
}

/// GET /api/livestream/slots/:id
pub async fn get_slot(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Slot> {
    success(state.scheduler.get(&id).await?)
}

/// DELETE /api/livestream/slots/:id?djId= - Cancel a reservation.
pub async fn cancel_slot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiQuery(owner): ApiQuery<OwnerQuery>,
) -> ApiResult<CancelledSlot> {
    state.scheduler.cancel(&id, &owner.dj_id).await?;
    success(CancelledSlot { id })
}

/// POST /api/livestream/slots/:id/check-in - DJ enters the lobby.
pub async fn check_in(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<SlotActionRequest>,
) -> ApiResult<Slot> {
    success(state.scheduler.check_in(&id, &request.dj_id, Utc::now()).await?)
}

/// POST /api/livestream/slots/:id/end - DJ hands over early.
pub async fn end_slot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<SlotActionRequest>,
) -> ApiResult<SwitchoverReport> {
    success(state.scheduler.end(&id, &request.dj_id, Utc::now()).await?)
}

/// GET /api/livestream/slots/:id/stream-key?djId=
pub async fn stream_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiQuery(owner): ApiQuery<OwnerQuery>,
) -> ApiResult<StreamKeyResponse> {
    success(state.scheduler.stream_key(&id, &owner.dj_id).await?)
}
