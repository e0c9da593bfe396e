//! Slot persistence.

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::repository::{is_unique_violation, Repository};
use super::{from_db_time, to_db_time};
use crate::errors::AppError;
use crate::models::{Slot, SlotStatus};

const SLOT_COLUMNS: &str = "rowid AS seq, id, dj_id, dj_name, start_time, end_time, status, \
                            stream_key, created_at, updated_at, version";

/// Fields of a slot about to be reserved.
pub struct NewSlot<'a> {
    pub dj_id: &'a str,
    pub dj_name: &'a str,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl Repository {
    /// Slots that can still change state, ordered by start time then insertion.
    pub async fn list_active_slots(&self) -> Result<Vec<Slot>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {SLOT_COLUMNS} FROM slots
             WHERE status IN ('scheduled', 'in_lobby', 'live')
             ORDER BY start_time, rowid"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(slot_from_row).collect()
    }

    /// Slots whose window intersects `[from, to)`.
    pub async fn list_slots_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Slot>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {SLOT_COLUMNS} FROM slots
             WHERE end_time > ? AND start_time < ?
             ORDER BY start_time, rowid"
        ))
        .bind(to_db_time(from))
        .bind(to_db_time(to))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(slot_from_row).collect()
    }

    /// Get a slot by ID.
    pub async fn get_slot(&self, id: &str) -> Result<Option<Slot>, AppError> {
        let row = sqlx::query(&format!("SELECT {SLOT_COLUMNS} FROM slots WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(slot_from_row).transpose()
    }

    /// Reserve a slot unless it overlaps another slot that is not finished.
    ///
    /// The overlap check and the insert are one statement, so two concurrent
    /// reservations for the same window cannot both succeed.
    pub async fn create_slot(&self, new: &NewSlot<'_>, now: DateTime<Utc>) -> Result<Slot, AppError> {
        let id = uuid::Uuid::new_v4().to_string();
        let stream_key = format!("sk_{}", uuid::Uuid::new_v4().simple());
        let start = to_db_time(new.start_time);
        let end = to_db_time(new.end_time);
        let now_str = to_db_time(now);

        let result = sqlx::query(
            r#"INSERT INTO slots (id, dj_id, dj_name, start_time, end_time, status, stream_key, created_at, updated_at, version)
               SELECT ?, ?, ?, ?, ?, 'scheduled', ?, ?, ?, 1
               WHERE NOT EXISTS (
                   SELECT 1 FROM slots
                   WHERE status IN ('scheduled', 'in_lobby', 'live')
                     AND start_time < ? AND end_time > ?
               )"#,
        )
        .bind(&id)
        .bind(new.dj_id)
        .bind(new.dj_name)
        .bind(&start)
        .bind(&end)
        .bind(&stream_key)
        .bind(&now_str)
        .bind(&now_str)
        .bind(&end)
        .bind(&start)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(
                "Requested time overlaps an existing slot".to_string(),
            ));
        }

        self.get_slot(&id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("Slot {} vanished after insert", id)))
    }

    /// Move a slot from its current status to `to`, provided nobody else
    /// changed it since it was read.
    ///
    /// Returns `Ok(None)` when the race was lost (version or status moved,
    /// or another slot went live first).
    pub async fn transition_slot(
        &self,
        slot: &Slot,
        to: SlotStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Slot>, AppError> {
        let live_guard = if to == SlotStatus::Live {
            " AND NOT EXISTS (SELECT 1 FROM slots WHERE status = 'live')"
        } else {
            ""
        };

        let result = sqlx::query(&format!(
            "UPDATE slots SET status = ?, updated_at = ?, version = version + 1
             WHERE id = ? AND version = ? AND status = ?{live_guard}"
        ))
        .bind(to.as_str())
        .bind(to_db_time(now))
        .bind(&slot.id)
        .bind(slot.version)
        .bind(slot.status.as_str())
        .execute(&self.pool)
        .await;

        let result = match result {
            Ok(result) => result,
            // The single-live index caught a concurrent promotion.
            Err(err) if is_unique_violation(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(Slot {
            status: to,
            updated_at: now,
            version: slot.version + 1,
            ..slot.clone()
        }))
    }

    /// Delete a slot if it is unchanged since it was read.
    pub async fn delete_slot(&self, slot: &Slot) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM slots WHERE id = ? AND version = ?")
            .bind(&slot.id)
            .bind(slot.version)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn slot_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Slot, AppError> {
    let status: String = row.try_get("status")?;
    let start_time: String = row.try_get("start_time")?;
    let end_time: String = row.try_get("end_time")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Slot {
        id: row.try_get("id")?,
        dj_id: row.try_get("dj_id")?,
        dj_name: row.try_get("dj_name")?,
        start_time: from_db_time(&start_time)?,
        end_time: from_db_time(&end_time)?,
        status: SlotStatus::parse(&status)
            .ok_or_else(|| AppError::Database(format!("Unknown slot status {:?}", status)))?,
        stream_key: row.try_get("stream_key")?,
        created_at: from_db_time(&created_at)?,
        updated_at: from_db_time(&updated_at)?,
        version: row.try_get("version")?,
        seq: row.try_get("seq")?,
    })
}
