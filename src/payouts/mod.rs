//! Artist payouts.
//!
//! Marketplace earnings are queued as pending payouts and paid out by a retry
//! job. Before any money moves the job claims the record with a conditional
//! write, and every transfer carries the record's idempotency key, so neither
//! overlapping runs nor a crash between transfer and settlement pay twice.

mod providers;

pub use providers::*;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::PayoutPolicy;
use crate::db::Repository;
use crate::errors::AppError;
use crate::models::{
    AccountOverview, AttemptOutcome, EnqueuePayoutRequest, PayoutAccount, PayoutAttempt,
    PayoutMethod, PendingPayout, PendingPayoutStatus, RetryReport, UpsertPayoutAccountRequest,
};

/// Configured transfer backends, one per payout method.
#[derive(Clone, Default)]
pub struct Providers {
    pub stripe: Option<Arc<dyn TransferProvider>>,
    pub paypal: Option<Arc<dyn TransferProvider>>,
}

impl Providers {
    fn for_method(&self, method: PayoutMethod) -> Option<&Arc<dyn TransferProvider>> {
        match method {
            PayoutMethod::Stripe => self.stripe.as_ref(),
            PayoutMethod::Paypal => self.paypal.as_ref(),
        }
    }
}

pub struct PayoutService {
    repo: Arc<Repository>,
    providers: Providers,
    policy: PayoutPolicy,
}

impl PayoutService {
    pub fn new(repo: Arc<Repository>, providers: Providers, policy: PayoutPolicy) -> Self {
        Self {
            repo,
            providers,
            policy,
        }
    }

    // ==================== QUEUE ====================

    pub async fn enqueue(
        &self,
        request: &EnqueuePayoutRequest,
        now: DateTime<Utc>,
    ) -> Result<PendingPayout, AppError> {
        if request.artist_id.trim().is_empty() {
            return Err(AppError::Validation("artistId is required".to_string()));
        }
        if request.order_id.trim().is_empty() {
            return Err(AppError::Validation("orderId is required".to_string()));
        }
        if request.amount <= 0 {
            return Err(AppError::Validation(
                "amount must be a positive number of minor units".to_string(),
            ));
        }
        if request.currency.len() != 3 || !request.currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(AppError::Validation(
                "currency must be a three-letter ISO code".to_string(),
            ));
        }

        let pending = self.repo.enqueue_pending_payout(request, now).await?;
        tracing::info!(
            pending_payout_id = %pending.id,
            artist_id = %pending.artist_id,
            amount = pending.amount,
            currency = %pending.currency,
            "Payout queued"
        );
        Ok(pending)
    }

    pub async fn list_pending(
        &self,
        status: Option<PendingPayoutStatus>,
    ) -> Result<Vec<PendingPayout>, AppError> {
        self.repo.list_pending_payouts(status).await
    }

    // ==================== ACCOUNTS ====================

    pub async fn upsert_account(
        &self,
        artist_id: &str,
        request: &UpsertPayoutAccountRequest,
        now: DateTime<Utc>,
    ) -> Result<PayoutAccount, AppError> {
        if artist_id.trim().is_empty() {
            return Err(AppError::Validation("artistId is required".to_string()));
        }
        if let Some(email) = &request.paypal_email {
            if !email.contains('@') {
                return Err(AppError::Validation(
                    "paypalEmail must be an e-mail address".to_string(),
                ));
            }
        }
        if let Some(account_id) = &request.stripe_account_id {
            if !account_id.starts_with("acct_") {
                return Err(AppError::Validation(
                    "stripeAccountId must be a connected account id".to_string(),
                ));
            }
        }

        let account = self.repo.upsert_payout_account(artist_id, request, now).await?;
        tracing::info!(
            artist_id,
            method = account.method.as_str(),
            payable = account.destination().is_some(),
            "Payout account updated"
        );
        Ok(account)
    }

    pub async fn account_overview(&self, artist_id: &str) -> Result<AccountOverview, AppError> {
        let account = self
            .repo
            .get_payout_account(artist_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("No payout account for artist {}", artist_id)))?;
        let payouts = self.repo.list_payouts(artist_id).await?;

        Ok(AccountOverview { account, payouts })
    }

    // ==================== RETRY JOB ====================

    /// Work through the pending queue once.
    pub async fn run_retry_job(&self, now: DateTime<Utc>) -> Result<RetryReport, AppError> {
        let expire_before = now - self.policy.max_age;
        let candidates = self
            .repo
            .list_retry_candidates(self.policy.batch_size, now - self.policy.claim_timeout)
            .await?;

        let mut report = RetryReport {
            scanned: candidates.len(),
            ..Default::default()
        };

        for pending in candidates {
            // A reclaimed `processing` record may already have been paid upstream,
            // so it is retried under the same key instead of expiring.
            let in_flight = pending.status == PendingPayoutStatus::Processing;
            let attempt = if pending.created_at < expire_before && !in_flight {
                self.expire(&pending, now).await?
            } else {
                self.attempt(&pending, &mut report, now).await?
            };
            report.record(attempt);
        }

        tracing::info!(
            scanned = report.scanned,
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            expired = report.expired,
            skipped_no_account = report.skipped_no_account,
            deferred = report.deferred,
            "Payout retry run finished"
        );
        Ok(report)
    }

    async fn expire(&self, pending: &PendingPayout, now: DateTime<Utc>) -> Result<PayoutAttempt, AppError> {
        let outcome = if self.repo.expire_pending_payout(pending, now).await? {
            tracing::warn!(
                pending_payout_id = %pending.id,
                artist_id = %pending.artist_id,
                created_at = %pending.created_at,
                "Pending payout expired without being paid"
            );
            AttemptOutcome::Expired
        } else {
            AttemptOutcome::SkippedClaimed
        };
        Ok(attempt_for(pending, outcome))
    }

    async fn attempt(
        &self,
        pending: &PendingPayout,
        report: &mut RetryReport,
        now: DateTime<Utc>,
    ) -> Result<PayoutAttempt, AppError> {
        let account = self.repo.get_payout_account(&pending.artist_id).await?;
        let Some((account, destination)) = account
            .as_ref()
            .and_then(|a| a.destination().map(|d| (a, d.to_string())))
        else {
            tracing::debug!(artist_id = %pending.artist_id, "Artist has no completed payout method, skipping");
            return Ok(attempt_for(pending, AttemptOutcome::SkippedNoAccount));
        };

        let Some(provider) = self.providers.for_method(account.method) else {
            tracing::warn!(
                artist_id = %pending.artist_id,
                method = account.method.as_str(),
                "No transfer provider configured for payout method"
            );
            return Ok(PayoutAttempt {
                error: Some(format!("{} payouts are not configured", account.method.as_str())),
                ..attempt_for(pending, AttemptOutcome::Deferred)
            });
        };

        if report.attempted >= self.policy.max_transfers {
            return Ok(attempt_for(pending, AttemptOutcome::Deferred));
        }

        let Some(claimed) = self.repo.claim_pending_payout(pending, now).await? else {
            return Ok(attempt_for(pending, AttemptOutcome::SkippedClaimed));
        };
        report.attempted += 1;

        let request = TransferRequest {
            idempotency_key: claimed.idempotency_key(),
            pending_payout_id: &claimed.id,
            artist_id: &claimed.artist_id,
            destination: &destination,
            amount: claimed.amount,
            currency: &claimed.currency,
        };

        match provider.transfer(&request).await {
            Ok(receipt) => {
                match self
                    .repo
                    .complete_pending_payout(&claimed, provider.method(), &receipt.transfer_id, now)
                    .await
                {
                    Ok(payout) => {
                        tracing::info!(
                            pending_payout_id = %claimed.id,
                            artist_id = %claimed.artist_id,
                            transfer_id = %payout.transfer_id,
                            amount = payout.amount,
                            "Payout sent"
                        );
                        Ok(PayoutAttempt {
                            transfer_id: Some(payout.transfer_id),
                            ..attempt_for(&claimed, AttemptOutcome::Paid)
                        })
                    }
                    // Another run reclaimed the record; it settles with the same transfer.
                    Err(AppError::Conflict(msg)) => {
                        tracing::warn!(pending_payout_id = %claimed.id, "{}", msg);
                        Ok(attempt_for(&claimed, AttemptOutcome::SkippedClaimed))
                    }
                    Err(e) => Err(e),
                }
            }
            Err(err) => {
                let give_up =
                    !err.is_retryable() || claimed.retry_count + 1 >= self.policy.max_retries;
                let message = err.to_string();

                match self
                    .repo
                    .record_payout_failure(&claimed, &message, give_up, now)
                    .await
                {
                    Ok(updated) => {
                        tracing::warn!(
                            pending_payout_id = %claimed.id,
                            artist_id = %claimed.artist_id,
                            retry_count = updated.retry_count,
                            give_up,
                            "Payout transfer failed: {}",
                            message
                        );
                        let outcome = if give_up {
                            AttemptOutcome::Failed
                        } else {
                            AttemptOutcome::RetryScheduled
                        };
                        Ok(PayoutAttempt {
                            error: Some(message),
                            ..attempt_for(&updated, outcome)
                        })
                    }
                    Err(AppError::Conflict(msg)) => {
                        tracing::warn!(pending_payout_id = %claimed.id, "{}", msg);
                        Ok(attempt_for(&claimed, AttemptOutcome::SkippedClaimed))
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }
}

fn attempt_for(pending: &PendingPayout, outcome: AttemptOutcome) -> PayoutAttempt {
    PayoutAttempt {
        pending_payout_id: pending.id.clone(),
        artist_id: pending.artist_id.clone(),
        outcome,
        transfer_id: None,
        error: None,
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted transfer provider for tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Pops scripted results in order, then succeeds. Records every call's
    /// idempotency key.
    pub struct ScriptedProvider {
        method: PayoutMethod,
        script: Mutex<VecDeque<Result<String, TransferError>>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        pub fn new(method: PayoutMethod) -> Self {
            Self {
                method,
                script: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn then(self, result: Result<String, TransferError>) -> Self {
            self.script.lock().unwrap().push_back(result);
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl TransferProvider for ScriptedProvider {
        fn method(&self) -> PayoutMethod {
            self.method
        }

        async fn transfer(&self, request: &TransferRequest<'_>) -> Result<TransferReceipt, TransferError> {
            self.calls.lock().unwrap().push(request.idempotency_key.clone());
            // Yield so concurrent runs interleave at the transfer.
            tokio::task::yield_now().await;
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Ok(id)) => Ok(TransferReceipt { transfer_id: id }),
                Some(Err(e)) => Err(e),
                None => Ok(TransferReceipt {
                    transfer_id: format!("tr_{}", request.idempotency_key),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests;
