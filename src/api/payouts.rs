//! Payout queue and account endpoints.

use axum::extract::{Path, State};
use chrono::Utc;

use super::{success, ApiJson, ApiQuery, ApiResult};
use crate::models::{
    AccountOverview, EnqueuePayoutRequest, ListPendingQuery, PayoutAccount, PendingPayout,
    UpsertPayoutAccountRequest,
};
use crate::AppState;

/// POST /api/payouts/pending - Queue earnings for an artist.
pub async fn enqueue_payout(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<EnqueuePayoutRequest>,
) -> ApiResult<PendingPayout> {
    success(state.payouts.enqueue(&request, Utc::now()).await?)
}

/// GET /api/payouts/pending?status=
pub async fn list_pending_payouts(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<ListPendingQuery>,
) -> ApiResult<Vec<PendingPayout>> {
    success(state.payouts.list_pending(query.status).await?)
}

/// PUT /api/payouts/accounts/:artistId
pub async fn upsert_payout_account(
    State(state): State<AppState>,
    Path(artist_id): Path<String>,
    ApiJson(request): ApiJson<UpsertPayoutAccountRequest>,
) -> ApiResult<PayoutAccount> {
    success(
        state
            .payouts
            .upsert_account(&artist_id, &request, Utc::now())
            .await?,
    )
}

/// GET /api/payouts/accounts/:artistId - Account with payout history.
pub async fn get_payout_account(
    State(state): State<AppState>,
    Path(artist_id): Path<String>,
) -> ApiResult<AccountOverview> {
    success(state.payouts.account_overview(&artist_id).await?)
}
