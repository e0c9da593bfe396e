//! Payout models: queued payouts, recipient accounts and completed transfers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of a queued payout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PendingPayoutStatus {
    Pending,
    RetryPending,
    /// Claimed by a job run; a transfer may be in flight
    Processing,
    Completed,
    Failed,
    Expired,
}

impl PendingPayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingPayoutStatus::Pending => "pending",
            PendingPayoutStatus::RetryPending => "retry_pending",
            PendingPayoutStatus::Processing => "processing",
            PendingPayoutStatus::Completed => "completed",
            PendingPayoutStatus::Failed => "failed",
            PendingPayoutStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PendingPayoutStatus::Pending),
            "retry_pending" => Some(PendingPayoutStatus::RetryPending),
            "processing" => Some(PendingPayoutStatus::Processing),
            "completed" => Some(PendingPayoutStatus::Completed),
            "failed" => Some(PendingPayoutStatus::Failed),
            "expired" => Some(PendingPayoutStatus::Expired),
            _ => None,
        }
    }
}

/// Where an artist receives their money.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PayoutMethod {
    Stripe,
    Paypal,
}

impl PayoutMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutMethod::Stripe => "stripe",
            PayoutMethod::Paypal => "paypal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stripe" => Some(PayoutMethod::Stripe),
            "paypal" => Some(PayoutMethod::Paypal),
            _ => None,
        }
    }
}

/// Marketplace earnings owed to an artist, waiting to be transferred.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPayout {
    pub id: String,
    pub artist_id: String,
    pub order_id: String,
    /// Amount in the currency's minor unit
    pub amount: i64,
    pub currency: String,
    pub status: PendingPayoutStatus,
    pub retry_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: i64,
}

impl PendingPayout {
    /// Key passed to the transfer API so a retried transfer is not paid twice.
    pub fn idempotency_key(&self) -> String {
        format!("payout-{}", self.id)
    }
}

/// An artist's payout destination and running balances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutAccount {
    pub artist_id: String,
    pub method: PayoutMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stripe_account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paypal_email: Option<String>,
    pub onboarding_complete: bool,
    pub total_paid: i64,
    pub pending_balance: i64,
    pub updated_at: DateTime<Utc>,
}

impl PayoutAccount {
    /// The destination for the selected method, if setup has finished.
    pub fn destination(&self) -> Option<&str> {
        if !self.onboarding_complete {
            return None;
        }
        match self.method {
            PayoutMethod::Stripe => self.stripe_account_id.as_deref(),
            PayoutMethod::Paypal => self.paypal_email.as_deref(),
        }
        .filter(|d| !d.trim().is_empty())
    }
}

/// A completed transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payout {
    pub id: String,
    pub artist_id: String,
    pub pending_payout_id: String,
    pub amount: i64,
    pub currency: String,
    pub provider: PayoutMethod,
    pub transfer_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueuePayoutRequest {
    pub artist_id: String,
    pub order_id: String,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertPayoutAccountRequest {
    pub method: PayoutMethod,
    #[serde(default)]
    pub stripe_account_id: Option<String>,
    #[serde(default)]
    pub paypal_email: Option<String>,
    #[serde(default)]
    pub onboarding_complete: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPendingQuery {
    #[serde(default)]
    pub status: Option<PendingPayoutStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountOverview {
    pub account: PayoutAccount,
    pub payouts: Vec<Payout>,
}

/// What happened to a single record during a retry run.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Paid,
    RetryScheduled,
    Failed,
    Expired,
    SkippedNoAccount,
    /// Another run claimed the record first
    SkippedClaimed,
    Deferred,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutAttempt {
    pub pending_payout_id: String,
    pub artist_id: String,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary of one payout retry run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryReport {
    pub scanned: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub expired: usize,
    pub skipped_no_account: usize,
    pub deferred: usize,
    pub results: Vec<PayoutAttempt>,
}

impl RetryReport {
    pub fn record(&mut self, attempt: PayoutAttempt) {
        match attempt.outcome {
            AttemptOutcome::Paid => self.succeeded += 1,
            AttemptOutcome::RetryScheduled | AttemptOutcome::Failed => self.failed += 1,
            AttemptOutcome::Expired => self.expired += 1,
            AttemptOutcome::SkippedNoAccount => self.skipped_no_account += 1,
            AttemptOutcome::Deferred => self.deferred += 1,
            AttemptOutcome::SkippedClaimed => {}
        }
        self.results.push(attempt);
    }
}
