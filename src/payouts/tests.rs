use super::testing::ScriptedProvider;
use super::*;
use crate::test_support::{at, temp_repo};

fn policy() -> PayoutPolicy {
    PayoutPolicy {
        batch_size: 50,
        max_age: chrono::Duration::days(30),
        max_transfers: 10,
        max_retries: 3,
        claim_timeout: chrono::Duration::minutes(15),
    }
}

fn service(repo: Arc<Repository>, provider: Arc<ScriptedProvider>, policy: PayoutPolicy) -> PayoutService {
    PayoutService::new(
        repo,
        Providers {
            stripe: Some(provider as Arc<dyn TransferProvider>),
            paypal: None,
        },
        policy,
    )
}

async fn onboard(payouts: &PayoutService, artist_id: &str) {
    payouts
        .upsert_account(
            artist_id,
            &UpsertPayoutAccountRequest {
                method: PayoutMethod::Stripe,
                stripe_account_id: Some(format!("acct_{}", artist_id)),
                paypal_email: None,
                onboarding_complete: true,
            },
            at(9, 0, 0),
        )
        .await
        .unwrap();
}

async fn queue(payouts: &PayoutService, artist_id: &str, order_id: &str, amount: i64, now: DateTime<Utc>) -> PendingPayout {
    payouts
        .enqueue(
            &EnqueuePayoutRequest {
                artist_id: artist_id.to_string(),
                order_id: order_id.to_string(),
                amount,
                currency: "usd".to_string(),
            },
            now,
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_success_settles_record_and_balances() {
    let (repo, _dir) = temp_repo().await;
    let provider = Arc::new(ScriptedProvider::new(PayoutMethod::Stripe));
    let payouts = service(repo.clone(), provider.clone(), policy());
    onboard(&payouts, "a1").await;

    let first = queue(&payouts, "a1", "order-1", 1500, at(10, 0, 0)).await;
    queue(&payouts, "a1", "order-2", 500, at(10, 5, 0)).await;

    let overview = payouts.account_overview("a1").await.unwrap();
    assert_eq!(overview.account.pending_balance, 2000);

    let report = payouts.run_retry_job(at(11, 0, 0)).await.unwrap();
    assert_eq!(report.scanned, 2);
    assert_eq!(report.attempted, 2);
    assert_eq!(report.succeeded, 2);
    assert_eq!(
        report.results[0].transfer_id.as_deref(),
        Some(format!("tr_payout-{}", first.id).as_str())
    );

    let overview = payouts.account_overview("a1").await.unwrap();
    assert_eq!(overview.account.total_paid, 2000);
    assert_eq!(overview.account.pending_balance, 0);
    assert_eq!(overview.payouts.len(), 2);

    let settled = repo.get_pending_payout(&first.id).await.unwrap().unwrap();
    assert_eq!(settled.status, PendingPayoutStatus::Completed);
    assert!(settled.claimed_at.is_none());

    // Nothing left to do.
    let report = payouts.run_retry_job(at(11, 5, 0)).await.unwrap();
    assert_eq!(report.scanned, 0);
}

#[tokio::test]
async fn test_expired_record_is_never_retried() {
    let (repo, _dir) = temp_repo().await;
    let provider = Arc::new(ScriptedProvider::new(PayoutMethod::Stripe));
    let payouts = service(repo.clone(), provider.clone(), policy());
    onboard(&payouts, "a1").await;

    let old = queue(&payouts, "a1", "order-1", 1000, at(10, 0, 0) - chrono::Duration::days(31)).await;

    let report = payouts.run_retry_job(at(10, 0, 0)).await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.attempted, 0);
    assert_eq!(provider.call_count(), 0);

    let record = repo.get_pending_payout(&old.id).await.unwrap().unwrap();
    assert_eq!(record.status, PendingPayoutStatus::Expired);

    let report = payouts.run_retry_job(at(10, 5, 0)).await.unwrap();
    assert_eq!(report.scanned, 0);
    assert_eq!(provider.call_count(), 0);
}

#[tokio::test]
async fn test_artist_without_payout_method_is_skipped() {
    let (repo, _dir) = temp_repo().await;
    let provider = Arc::new(ScriptedProvider::new(PayoutMethod::Stripe));
    let payouts = service(repo.clone(), provider.clone(), policy());

    let pending = queue(&payouts, "a1", "order-1", 1000, at(10, 0, 0)).await;

    let report = payouts.run_retry_job(at(10, 1, 0)).await.unwrap();
    assert_eq!(report.skipped_no_account, 1);
    assert_eq!(provider.call_count(), 0);

    let record = repo.get_pending_payout(&pending.id).await.unwrap().unwrap();
    assert_eq!(record.status, PendingPayoutStatus::Pending);
    assert_eq!(record.retry_count, 0);

    // Finishing onboarding makes the record payable on the next run.
    onboard(&payouts, "a1").await;
    let report = payouts.run_retry_job(at(10, 2, 0)).await.unwrap();
    assert_eq!(report.succeeded, 1);
}

#[tokio::test]
async fn test_transfer_cap_defers_the_rest() {
    let (repo, _dir) = temp_repo().await;
    let provider = Arc::new(ScriptedProvider::new(PayoutMethod::Stripe));
    let payouts = service(
        repo,
        provider.clone(),
        PayoutPolicy {
            max_transfers: 2,
            ..policy()
        },
    );
    onboard(&payouts, "a1").await;
    for i in 0..3 {
        queue(&payouts, "a1", &format!("order-{}", i), 100, at(10, i, 0)).await;
    }

    let report = payouts.run_retry_job(at(11, 0, 0)).await.unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.deferred, 1);

    let report = payouts.run_retry_job(at(11, 1, 0)).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(provider.call_count(), 3);
}

#[tokio::test]
async fn test_retryable_failures_eventually_fail() {
    let (repo, _dir) = temp_repo().await;
    let provider = Arc::new(
        ScriptedProvider::new(PayoutMethod::Stripe)
            .then(Err(TransferError::Network("connection reset".into())))
            .then(Err(TransferError::Network("connection reset".into())))
            .then(Err(TransferError::Rejected {
                status: 503,
                message: "unavailable".into(),
            })),
    );
    let payouts = service(repo.clone(), provider.clone(), policy());
    onboard(&payouts, "a1").await;
    let pending = queue(&payouts, "a1", "order-1", 1000, at(10, 0, 0)).await;

    for (minute, expected_count) in [(1, 1), (2, 2)] {
        let report = payouts.run_retry_job(at(10, minute, 0)).await.unwrap();
        assert_eq!(report.results[0].outcome, AttemptOutcome::RetryScheduled);
        let record = repo.get_pending_payout(&pending.id).await.unwrap().unwrap();
        assert_eq!(record.status, PendingPayoutStatus::RetryPending);
        assert_eq!(record.retry_count, expected_count);
        assert!(record.last_error.is_some());
    }

    let report = payouts.run_retry_job(at(10, 3, 0)).await.unwrap();
    assert_eq!(report.results[0].outcome, AttemptOutcome::Failed);
    let record = repo.get_pending_payout(&pending.id).await.unwrap().unwrap();
    assert_eq!(record.status, PendingPayoutStatus::Failed);
    assert_eq!(record.retry_count, 3);

    let report = payouts.run_retry_job(at(10, 4, 0)).await.unwrap();
    assert_eq!(report.scanned, 0);
    assert_eq!(provider.call_count(), 3);

    // Money never moved, so the balance still shows it as owed.
    let overview = payouts.account_overview("a1").await.unwrap();
    assert_eq!(overview.account.pending_balance, 1000);
    assert_eq!(overview.account.total_paid, 0);
}

#[tokio::test]
async fn test_permanent_rejection_fails_immediately() {
    let (repo, _dir) = temp_repo().await;
    let provider = Arc::new(ScriptedProvider::new(PayoutMethod::Stripe).then(Err(
        TransferError::Rejected {
            status: 400,
            message: "No such destination".into(),
        },
    )));
    let payouts = service(repo.clone(), provider, policy());
    onboard(&payouts, "a1").await;
    let pending = queue(&payouts, "a1", "order-1", 1000, at(10, 0, 0)).await;

    let report = payouts.run_retry_job(at(10, 1, 0)).await.unwrap();
    assert_eq!(report.failed, 1);
    let record = repo.get_pending_payout(&pending.id).await.unwrap().unwrap();
    assert_eq!(record.status, PendingPayoutStatus::Failed);
    assert_eq!(record.retry_count, 1);
}

#[tokio::test]
async fn test_concurrent_runs_never_pay_twice() {
    let (repo, _dir) = temp_repo().await;
    let provider = Arc::new(ScriptedProvider::new(PayoutMethod::Stripe));
    let first = service(repo.clone(), provider.clone(), policy());
    let second = service(repo.clone(), provider.clone(), policy());
    onboard(&first, "a1").await;
    for i in 0..4 {
        queue(&first, "a1", &format!("order-{}", i), 250, at(10, i, 0)).await;
    }

    let now = at(11, 0, 0);
    let (a, b) = tokio::join!(first.run_retry_job(now), second.run_retry_job(now));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.succeeded + b.succeeded, 4);

    let mut keys = provider.calls.lock().unwrap().clone();
    let total = keys.len();
    keys.sort();
    keys.dedup();
    assert_eq!(total, 4, "every record is transferred exactly once");
    assert_eq!(keys.len(), 4);

    let overview = first.account_overview("a1").await.unwrap();
    assert_eq!(overview.payouts.len(), 4);
    assert_eq!(overview.account.total_paid, 1000);
    assert_eq!(overview.account.pending_balance, 0);
}

#[tokio::test]
async fn test_abandoned_claim_is_picked_up_again() {
    let (repo, _dir) = temp_repo().await;
    let provider = Arc::new(ScriptedProvider::new(PayoutMethod::Stripe));
    let payouts = service(repo.clone(), provider.clone(), policy());
    onboard(&payouts, "a1").await;
    let pending = queue(&payouts, "a1", "order-1", 1000, at(10, 0, 0)).await;

    // A run claimed the record at 10:00 and never came back.
    repo.claim_pending_payout(&pending, at(10, 0, 0))
        .await
        .unwrap()
        .unwrap();

    let report = payouts.run_retry_job(at(10, 10, 0)).await.unwrap();
    assert_eq!(report.scanned, 0, "claim is still fresh");

    let report = payouts.run_retry_job(at(10, 20, 0)).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(
        provider.calls.lock().unwrap().as_slice(),
        &[format!("payout-{}", pending.id)]
    );
}

#[tokio::test]
async fn test_abandoned_claim_past_max_age_settles_instead_of_expiring() {
    let (repo, _dir) = temp_repo().await;
    let provider = Arc::new(ScriptedProvider::new(PayoutMethod::Stripe));
    let payouts = service(repo.clone(), provider.clone(), policy());
    onboard(&payouts, "a1").await;

    let created = at(10, 0, 0) - chrono::Duration::days(30);
    let pending = queue(&payouts, "a1", "order-1", 1000, created).await;
    // Claimed right at the age boundary, transfer outcome unknown.
    repo.claim_pending_payout(&pending, created).await.unwrap().unwrap();

    let report = payouts.run_retry_job(at(10, 20, 0)).await.unwrap();
    assert_eq!(report.expired, 0);
    assert_eq!(report.succeeded, 1);
    assert_eq!(
        provider.calls.lock().unwrap().as_slice(),
        &[format!("payout-{}", pending.id)]
    );

    let record = repo.get_pending_payout(&pending.id).await.unwrap().unwrap();
    assert_eq!(record.status, PendingPayoutStatus::Completed);
    let overview = payouts.account_overview("a1").await.unwrap();
    assert_eq!(overview.account.total_paid, 1000);
    assert_eq!(overview.account.pending_balance, 0);
}

#[tokio::test]
async fn test_enqueue_validation_and_duplicates() {
    let (repo, _dir) = temp_repo().await;
    let provider = Arc::new(ScriptedProvider::new(PayoutMethod::Stripe));
    let payouts = service(repo, provider, policy());

    let bad_amount = payouts
        .enqueue(
            &EnqueuePayoutRequest {
                artist_id: "a1".into(),
                order_id: "order-1".into(),
                amount: 0,
                currency: "usd".into(),
            },
            at(10, 0, 0),
        )
        .await
        .unwrap_err();
    assert!(matches!(bad_amount, AppError::Validation(_)));

    queue(&payouts, "a1", "order-1", 1000, at(10, 0, 0)).await;
    let duplicate = payouts
        .enqueue(
            &EnqueuePayoutRequest {
                artist_id: "a1".into(),
                order_id: "order-1".into(),
                amount: 1000,
                currency: "usd".into(),
            },
            at(10, 1, 0),
        )
        .await
        .unwrap_err();
    assert!(matches!(duplicate, AppError::Conflict(_)));

    let pending = payouts
        .list_pending(Some(PendingPayoutStatus::Pending))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn test_missing_provider_defers_without_claiming() {
    let (repo, _dir) = temp_repo().await;
    let payouts = PayoutService::new(repo.clone(), Providers::default(), policy());
    onboard(&payouts, "a1").await;
    let pending = queue(&payouts, "a1", "order-1", 1000, at(10, 0, 0)).await;

    let report = payouts.run_retry_job(at(10, 1, 0)).await.unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(report.attempted, 0);
    let record = repo.get_pending_payout(&pending.id).await.unwrap().unwrap();
    assert_eq!(record.status, PendingPayoutStatus::Pending);
}
