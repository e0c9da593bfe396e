//! Payout persistence: pending queue, recipient accounts and transfer history.

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::repository::{is_unique_violation, Repository};
use super::{from_db_time, to_db_time};
use crate::errors::AppError;
use crate::models::{
    EnqueuePayoutRequest, Payout, PayoutAccount, PayoutMethod, PendingPayout,
    PendingPayoutStatus, UpsertPayoutAccountRequest,
};

const PENDING_COLUMNS: &str = "id, artist_id, order_id, amount, currency, status, retry_count, \
                               last_error, transfer_id, claimed_at, created_at, updated_at, version";

const ACCOUNT_COLUMNS: &str = "artist_id, method, stripe_account_id, paypal_email, \
                               onboarding_complete, total_paid, pending_balance, updated_at";

impl Repository {
    // ==================== PENDING PAYOUTS ====================

    /// Queue earnings for an artist and add them to the pending balance.
    pub async fn enqueue_pending_payout(
        &self,
        request: &EnqueuePayoutRequest,
        now: DateTime<Utc>,
    ) -> Result<PendingPayout, AppError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now_str = to_db_time(now);
        let currency = request.currency.to_lowercase();

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"INSERT INTO pending_payouts (id, artist_id, order_id, amount, currency, status, retry_count, created_at, updated_at, version)
               VALUES (?, ?, ?, ?, ?, 'pending', 0, ?, ?, 1)"#,
        )
        .bind(&id)
        .bind(&request.artist_id)
        .bind(&request.order_id)
        .bind(request.amount)
        .bind(&currency)
        .bind(&now_str)
        .bind(&now_str)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            if is_unique_violation(&err) {
                return Err(AppError::Conflict(format!(
                    "Order {} is already queued for artist {}",
                    request.order_id, request.artist_id
                )));
            }
            return Err(err.into());
        }

        // Artists without an account yet get a placeholder that is not payable.
        sqlx::query(
            r#"INSERT INTO payout_accounts (artist_id, method, onboarding_complete, total_paid, pending_balance, updated_at)
               VALUES (?, 'stripe', 0, 0, ?, ?)
               ON CONFLICT(artist_id) DO UPDATE SET
                   pending_balance = pending_balance + excluded.pending_balance,
                   updated_at = excluded.updated_at"#,
        )
        .bind(&request.artist_id)
        .bind(request.amount)
        .bind(&now_str)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(PendingPayout {
            id,
            artist_id: request.artist_id.clone(),
            order_id: request.order_id.clone(),
            amount: request.amount,
            currency,
            status: PendingPayoutStatus::Pending,
            retry_count: 0,
            last_error: None,
            transfer_id: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
            version: 1,
        })
    }

    pub async fn get_pending_payout(&self, id: &str) -> Result<Option<PendingPayout>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {PENDING_COLUMNS} FROM pending_payouts WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(pending_from_row).transpose()
    }

    /// List pending payouts, optionally filtered by status, oldest first.
    pub async fn list_pending_payouts(
        &self,
        status: Option<PendingPayoutStatus>,
    ) -> Result<Vec<PendingPayout>, AppError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {PENDING_COLUMNS} FROM pending_payouts WHERE status = ? ORDER BY created_at"
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {PENDING_COLUMNS} FROM pending_payouts ORDER BY created_at"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(pending_from_row).collect()
    }

    /// Records the retry job may act on: retryable ones plus claims that were
    /// abandoned before `stale_claim_cutoff`.
    pub async fn list_retry_candidates(
        &self,
        limit: i64,
        stale_claim_cutoff: DateTime<Utc>,
    ) -> Result<Vec<PendingPayout>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {PENDING_COLUMNS} FROM pending_payouts
             WHERE status IN ('pending', 'retry_pending')
                OR (status = 'processing' AND claimed_at <= ?)
             ORDER BY created_at, rowid
             LIMIT ?"
        ))
        .bind(to_db_time(stale_claim_cutoff))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(pending_from_row).collect()
    }

    /// Take exclusive ownership of a record before transferring money for it.
    ///
    /// Returns `None` if another run changed the record first.
    pub async fn claim_pending_payout(
        &self,
        payout: &PendingPayout,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingPayout>, AppError> {
        let result = sqlx::query(
            "UPDATE pending_payouts SET status = 'processing', claimed_at = ?, updated_at = ?, version = version + 1
             WHERE id = ? AND version = ?",
        )
        .bind(to_db_time(now))
        .bind(to_db_time(now))
        .bind(&payout.id)
        .bind(payout.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(PendingPayout {
            status: PendingPayoutStatus::Processing,
            claimed_at: Some(now),
            updated_at: now,
            version: payout.version + 1,
            ..payout.clone()
        }))
    }

    /// Mark a record as too old to retry. Claimed records never expire.
    pub async fn expire_pending_payout(
        &self,
        payout: &PendingPayout,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE pending_payouts SET status = 'expired', claimed_at = NULL, updated_at = ?, version = version + 1
             WHERE id = ? AND version = ? AND status IN ('pending', 'retry_pending')",
        )
        .bind(to_db_time(now))
        .bind(&payout.id)
        .bind(payout.version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record a failed transfer attempt on a claimed record.
    pub async fn record_payout_failure(
        &self,
        claimed: &PendingPayout,
        error: &str,
        give_up: bool,
        now: DateTime<Utc>,
    ) -> Result<PendingPayout, AppError> {
        let status = if give_up {
            PendingPayoutStatus::Failed
        } else {
            PendingPayoutStatus::RetryPending
        };

        let result = sqlx::query(
            "UPDATE pending_payouts SET status = ?, retry_count = retry_count + 1, last_error = ?,
                 claimed_at = NULL, updated_at = ?, version = version + 1
             WHERE id = ? AND version = ? AND status = 'processing'",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(to_db_time(now))
        .bind(&claimed.id)
        .bind(claimed.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(format!(
                "Pending payout {} changed while its transfer was in flight",
                claimed.id
            )));
        }

        Ok(PendingPayout {
            status,
            retry_count: claimed.retry_count + 1,
            last_error: Some(error.to_string()),
            claimed_at: None,
            updated_at: now,
            version: claimed.version + 1,
            ..claimed.clone()
        })
    }

    /// Settle a claimed record: mark it completed, write the payout and move
    /// the amount from pending balance to total paid, all in one transaction.
    pub async fn complete_pending_payout(
        &self,
        claimed: &PendingPayout,
        provider: PayoutMethod,
        transfer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Payout, AppError> {
        let now_str = to_db_time(now);
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE pending_payouts SET status = 'completed', transfer_id = ?, claimed_at = NULL,
                 last_error = NULL, updated_at = ?, version = version + 1
             WHERE id = ? AND version = ? AND status = 'processing'",
        )
        .bind(transfer_id)
        .bind(&now_str)
        .bind(&claimed.id)
        .bind(claimed.version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(format!(
                "Pending payout {} changed while its transfer was in flight",
                claimed.id
            )));
        }

        let payout = Payout {
            id: uuid::Uuid::new_v4().to_string(),
            artist_id: claimed.artist_id.clone(),
            pending_payout_id: claimed.id.clone(),
            amount: claimed.amount,
            currency: claimed.currency.clone(),
            provider,
            transfer_id: transfer_id.to_string(),
            created_at: now,
        };

        // The UNIQUE pending_payout_id rejects a second settlement outright.
        sqlx::query(
            r#"INSERT INTO payouts (id, artist_id, pending_payout_id, amount, currency, provider, transfer_id, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&payout.id)
        .bind(&payout.artist_id)
        .bind(&payout.pending_payout_id)
        .bind(payout.amount)
        .bind(&payout.currency)
        .bind(provider.as_str())
        .bind(&payout.transfer_id)
        .bind(&now_str)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE payout_accounts SET total_paid = total_paid + ?,
                 pending_balance = MAX(pending_balance - ?, 0), updated_at = ?
             WHERE artist_id = ?",
        )
        .bind(claimed.amount)
        .bind(claimed.amount)
        .bind(&now_str)
        .bind(&claimed.artist_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(payout)
    }

    // ==================== ACCOUNTS ====================

    pub async fn get_payout_account(
        &self,
        artist_id: &str,
    ) -> Result<Option<PayoutAccount>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM payout_accounts WHERE artist_id = ?"
        ))
        .bind(artist_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    /// Create or update the payout destination, keeping the balances.
    pub async fn upsert_payout_account(
        &self,
        artist_id: &str,
        request: &UpsertPayoutAccountRequest,
        now: DateTime<Utc>,
    ) -> Result<PayoutAccount, AppError> {
        sqlx::query(
            r#"INSERT INTO payout_accounts (artist_id, method, stripe_account_id, paypal_email, onboarding_complete, total_paid, pending_balance, updated_at)
               VALUES (?, ?, ?, ?, ?, 0, 0, ?)
               ON CONFLICT(artist_id) DO UPDATE SET
                   method = excluded.method,
                   stripe_account_id = COALESCE(excluded.stripe_account_id, stripe_account_id),
                   paypal_email = COALESCE(excluded.paypal_email, paypal_email),
                   onboarding_complete = excluded.onboarding_complete,
                   updated_at = excluded.updated_at"#,
        )
        .bind(artist_id)
        .bind(request.method.as_str())
        .bind(&request.stripe_account_id)
        .bind(&request.paypal_email)
        .bind(request.onboarding_complete as i32)
        .bind(to_db_time(now))
        .execute(&self.pool)
        .await?;

        self.get_payout_account(artist_id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("Account {} vanished after upsert", artist_id)))
    }

    /// Completed payouts for an artist, newest first.
    pub async fn list_payouts(&self, artist_id: &str) -> Result<Vec<Payout>, AppError> {
        let rows = sqlx::query(
            "SELECT id, artist_id, pending_payout_id, amount, currency, provider, transfer_id, created_at
             FROM payouts WHERE artist_id = ? ORDER BY created_at DESC",
        )
        .bind(artist_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(payout_from_row).collect()
    }
}

// Helper functions for row conversion

fn pending_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<PendingPayout, AppError> {
    let status: String = row.try_get("status")?;
    let claimed_at: Option<String> = row.try_get("claimed_at")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(PendingPayout {
        id: row.try_get("id")?,
        artist_id: row.try_get("artist_id")?,
        order_id: row.try_get("order_id")?,
        amount: row.try_get("amount")?,
        currency: row.try_get("currency")?,
        status: PendingPayoutStatus::parse(&status)
            .ok_or_else(|| AppError::Database(format!("Unknown payout status {:?}", status)))?,
        retry_count: row.try_get("retry_count")?,
        last_error: row.try_get("last_error")?,
        transfer_id: row.try_get("transfer_id")?,
        claimed_at: claimed_at.as_deref().map(from_db_time).transpose()?,
        created_at: from_db_time(&created_at)?,
        updated_at: from_db_time(&updated_at)?,
        version: row.try_get("version")?,
    })
}

fn account_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<PayoutAccount, AppError> {
    let method: String = row.try_get("method")?;
    let onboarding_complete: i32 = row.try_get("onboarding_complete")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(PayoutAccount {
        artist_id: row.try_get("artist_id")?,
        method: PayoutMethod::parse(&method)
            .ok_or_else(|| AppError::Database(format!("Unknown payout method {:?}", method)))?,
        stripe_account_id: row.try_get("stripe_account_id")?,
        paypal_email: row.try_get("paypal_email")?,
        onboarding_complete: onboarding_complete != 0,
        total_paid: row.try_get("total_paid")?,
        pending_balance: row.try_get("pending_balance")?,
        updated_at: from_db_time(&updated_at)?,
    })
}

fn payout_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Payout, AppError> {
    let provider: String = row.try_get("provider")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(Payout {
        id: row.try_get("id")?,
        artist_id: row.try_get("artist_id")?,
        pending_payout_id: row.try_get("pending_payout_id")?,
        amount: row.try_get("amount")?,
        currency: row.try_get("currency")?,
        provider: PayoutMethod::parse(&provider)
            .ok_or_else(|| AppError::Database(format!("Unknown payout provider {:?}", provider)))?,
        transfer_id: row.try_get("transfer_id")?,
        created_at: from_db_time(&created_at)?,
    })
}
