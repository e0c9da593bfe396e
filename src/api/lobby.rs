//! Lobby presence and chat endpoints.

use axum::extract::State;
use chrono::Utc;

use super::{success, ApiJson, ApiQuery, ApiResult};
use crate::models::{
    ChatMessage, HeartbeatAck, JoinLobbyRequest, LeaveAck, OnlineList, PresenceRecord,
    PresenceUserRequest, RecentChatQuery, SendChatRequest, UpdatePresenceRequest,
};
use crate::AppState;

/// GET /api/lobby/presence - Users currently online.
pub async fn list_presence(State(state): State<AppState>) -> ApiResult<OnlineList> {
    success(state.presence.list(Utc::now()).await?)
}

/// POST /api/lobby/presence/join
pub async fn join_lobby(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<JoinLobbyRequest>,
) -> ApiResult<PresenceRecord> {
    success(state.presence.join(&request, Utc::now()).await?)
}

/// POST /api/lobby/presence/heartbeat
pub async fn heartbeat(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<PresenceUserRequest>,
) -> ApiResult<HeartbeatAck> {
    success(state.presence.heartbeat(&request.user_id, Utc::now()).await?)
}

/// POST /api/lobby/presence/update
pub async fn update_presence(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<UpdatePresenceRequest>,
) -> ApiResult<PresenceRecord> {
    success(state.presence.update(&request, Utc::now()).await?)
}

/// POST /api/lobby/presence/leave
pub async fn leave_lobby(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<PresenceUserRequest>,
) -> ApiResult<LeaveAck> {
    success(state.presence.leave(&request.user_id).await?)
}

/// GET /api/lobby/chat?limit= - Recent messages, oldest first.
pub async fn recent_chat(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<RecentChatQuery>,
) -> ApiResult<Vec<ChatMessage>> {
    success(state.chat.recent(query.limit).await?)
}

/// POST /api/lobby/chat
pub async fn send_chat(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<SendChatRequest>,
) -> ApiResult<ChatMessage> {
    success(state.chat.send(&request, Utc::now()).await?)
}
