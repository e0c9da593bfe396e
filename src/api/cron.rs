//! Scheduled-job endpoints, called by an external scheduler.

use axum::extract::State;
use chrono::Utc;

use super::{success, ApiResult};
use crate::models::{CleanupReport, RetryReport, SwitchoverReport};
use crate::AppState;

/// POST /cron/livestream/switchover
pub async fn cron_switchover(State(state): State<AppState>) -> ApiResult<SwitchoverReport> {
    success(state.scheduler.check_and_advance(Utc::now()).await?)
}

/// POST /cron/presence/cleanup
pub async fn cron_presence_cleanup(State(state): State<AppState>) -> ApiResult<CleanupReport> {
    success(state.presence.cleanup(Utc::now()).await?)
}

/// POST /cron/chat/cleanup
pub async fn cron_chat_cleanup(State(state): State<AppState>) -> ApiResult<CleanupReport> {
    success(state.chat.cleanup(Utc::now()).await?)
}

/// POST /cron/payouts/retry
pub async fn cron_payout_retry(State(state): State<AppState>) -> ApiResult<RetryReport> {
    success(state.payouts.run_retry_job(Utc::now()).await?)
}
