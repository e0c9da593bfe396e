//! Presence persistence. Last write wins.

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::repository::Repository;
use super::{from_db_time, to_db_time};
use crate::errors::AppError;
use crate::models::{PresenceRecord, PresenceStatus, UpdatePresenceRequest};

const PRESENCE_COLUMNS: &str =
    "user_id, display_name, avatar_url, status, is_dj, joined_at, last_seen";

impl Repository {
    /// Insert or replace a presence record.
    pub async fn upsert_presence(&self, record: &PresenceRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"INSERT INTO presence (user_id, display_name, avatar_url, status, is_dj, joined_at, last_seen)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(user_id) DO UPDATE SET
                   display_name = excluded.display_name,
                   avatar_url = excluded.avatar_url,
                   status = excluded.status,
                   is_dj = excluded.is_dj,
                   joined_at = excluded.joined_at,
                   last_seen = excluded.last_seen"#,
        )
        .bind(&record.user_id)
        .bind(&record.display_name)
        .bind(&record.avatar_url)
        .bind(record.status.as_str())
        .bind(record.is_dj as i32)
        .bind(to_db_time(record.joined_at))
        .bind(to_db_time(record.last_seen))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Bump `last_seen`. Returns false when the user has no record.
    pub async fn touch_presence(&self, user_id: &str, now: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE presence SET last_seen = ? WHERE user_id = ?")
            .bind(to_db_time(now))
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Apply display changes and bump `last_seen`.
    pub async fn update_presence(
        &self,
        request: &UpdatePresenceRequest,
        now: DateTime<Utc>,
    ) -> Result<Option<PresenceRecord>, AppError> {
        let Some(existing) = self.get_presence(&request.user_id).await? else {
            return Ok(None);
        };

        let updated = PresenceRecord {
            display_name: request
                .display_name
                .clone()
                .unwrap_or(existing.display_name),
            avatar_url: request.avatar_url.clone().or(existing.avatar_url),
            status: request.status.unwrap_or(existing.status),
            last_seen: now,
            ..existing
        };

        sqlx::query(
            "UPDATE presence SET display_name = ?, avatar_url = ?, status = ?, last_seen = ? WHERE user_id = ?",
        )
        .bind(&updated.display_name)
        .bind(&updated.avatar_url)
        .bind(updated.status.as_str())
        .bind(to_db_time(now))
        .bind(&updated.user_id)
        .execute(&self.pool)
        .await?;

        Ok(Some(updated))
    }

    pub async fn get_presence(&self, user_id: &str) -> Result<Option<PresenceRecord>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {PRESENCE_COLUMNS} FROM presence WHERE user_id = ?"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(presence_from_row).transpose()
    }

    /// Delete a presence record. Returns whether one existed.
    pub async fn delete_presence(&self, user_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM presence WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Records seen at or after `cutoff`, most recently joined first.
    pub async fn list_presence_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PresenceRecord>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {PRESENCE_COLUMNS} FROM presence WHERE last_seen >= ? ORDER BY joined_at DESC"
        ))
        .bind(to_db_time(cutoff))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(presence_from_row).collect()
    }

    /// Delete records last seen before `cutoff`.
    pub async fn delete_presence_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM presence WHERE last_seen < ?")
            .bind(to_db_time(cutoff))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn presence_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<PresenceRecord, AppError> {
    let status: String = row.try_get("status")?;
    let is_dj: i32 = row.try_get("is_dj")?;
    let joined_at: String = row.try_get("joined_at")?;
    let last_seen: String = row.try_get("last_seen")?;

    Ok(PresenceRecord {
        user_id: row.try_get("user_id")?,
        display_name: row.try_get("display_name")?,
        avatar_url: row.try_get("avatar_url")?,
        status: PresenceStatus::parse(&status).unwrap_or_default(),
        is_dj: is_dj != 0,
        joined_at: from_db_time(&joined_at)?,
        last_seen: from_db_time(&last_seen)?,
    })
}
