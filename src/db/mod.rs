//! Database module for SQLite persistence.
//!
//! SQLite is the source of truth for slots, presence, chat and payouts.

mod chat;
mod payouts;
mod presence;
mod repository;
mod slots;

pub use repository::*;
pub use slots::NewSlot;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use crate::errors::AppError;

/// Initialize the database connection pool and run migrations.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool, sqlx::Error> {
    // Ensure the parent directory exists
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }

    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .busy_timeout(std::time::Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    // Run embedded migrations
    run_migrations(&pool).await?;

    Ok(pool)
}

/// Run database migrations.
async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS slots (
            id TEXT PRIMARY KEY,
            dj_id TEXT NOT NULL,
            dj_name TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            status TEXT NOT NULL,
            stream_key TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1
        );

        CREATE INDEX IF NOT EXISTS idx_slots_status_start ON slots(status, start_time);
        CREATE INDEX IF NOT EXISTS idx_slots_window ON slots(start_time, end_time);

        -- At most one slot may be live at any time.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_slots_single_live ON slots(status)
            WHERE status = 'live';
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS presence (
            user_id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            avatar_url TEXT,
            status TEXT NOT NULL DEFAULT 'online',
            is_dj INTEGER NOT NULL DEFAULT 0,
            joined_at TEXT NOT NULL,
            last_seen TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_presence_last_seen ON presence(last_seen);
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_messages (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            user_name TEXT NOT NULL,
            text TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_chat_created_at ON chat_messages(created_at);
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS payout_accounts (
            artist_id TEXT PRIMARY KEY,
            method TEXT NOT NULL,
            stripe_account_id TEXT,
            paypal_email TEXT,
            onboarding_complete INTEGER NOT NULL DEFAULT 0,
            total_paid INTEGER NOT NULL DEFAULT 0,
            pending_balance INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pending_payouts (
            id TEXT PRIMARY KEY,
            artist_id TEXT NOT NULL,
            order_id TEXT NOT NULL,
            amount INTEGER NOT NULL,
            currency TEXT NOT NULL,
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            transfer_id TEXT,
            claimed_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            UNIQUE (artist_id, order_id)
        );

        CREATE INDEX IF NOT EXISTS idx_pending_payouts_status_created
            ON pending_payouts(status, created_at);

        CREATE TABLE IF NOT EXISTS payouts (
            id TEXT PRIMARY KEY,
            artist_id TEXT NOT NULL,
            pending_payout_id TEXT NOT NULL UNIQUE,
            amount INTEGER NOT NULL,
            currency TEXT NOT NULL,
            provider TEXT NOT NULL,
            transfer_id TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_payouts_artist ON payouts(artist_id, created_at);
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Timestamps are stored as fixed-width RFC 3339 UTC text so that string
/// comparison in SQL matches chronological order.
pub(crate) fn to_db_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn from_db_time(value: &str) -> Result<DateTime<Utc>, AppError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Database(format!("Invalid stored timestamp {:?}: {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_db_time_sorts_lexically() {
        let early = Utc.with_ymd_and_hms(2026, 3, 1, 9, 5, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        assert!(to_db_time(early) < to_db_time(late));
        assert_eq!(from_db_time(&to_db_time(early)).unwrap(), early);
    }

    #[tokio::test]
    async fn test_single_live_index() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("idx.sqlite")).await.unwrap();

        let insert = "INSERT INTO slots (id, dj_id, dj_name, start_time, end_time, status, stream_key, created_at, updated_at)
                      VALUES (?, 'dj', 'DJ', 'a', 'b', 'live', 'k', 'a', 'a')";
        sqlx::query(insert).bind("one").execute(&pool).await.unwrap();
        let second = sqlx::query(insert).bind("two").execute(&pool).await;
        assert!(second.is_err());
    }
}
