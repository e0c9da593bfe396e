//! Lobby chat persistence.

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::repository::Repository;
use super::{from_db_time, to_db_time};
use crate::errors::AppError;
use crate::models::ChatMessage;

impl Repository {
    pub async fn insert_chat_message(&self, message: &ChatMessage) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO chat_messages (id, user_id, user_name, text, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(&message.user_id)
        .bind(&message.user_name)
        .bind(&message.text)
        .bind(to_db_time(message.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The latest `limit` messages, returned oldest first.
    pub async fn recent_chat_messages(&self, limit: i64) -> Result<Vec<ChatMessage>, AppError> {
        let rows = sqlx::query(
            r#"SELECT id, user_id, user_name, text, created_at FROM (
                   SELECT rowid AS seq, id, user_id, user_name, text, created_at
                   FROM chat_messages
                   ORDER BY created_at DESC, rowid DESC
                   LIMIT ?
               ) ORDER BY created_at, seq"#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(chat_from_row).collect()
    }

    /// Delete messages created before `cutoff`.
    pub async fn delete_chat_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM chat_messages WHERE created_at < ?")
            .bind(to_db_time(cutoff))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn chat_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ChatMessage, AppError> {
    let created_at: String = row.try_get("created_at")?;
    Ok(ChatMessage {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        user_name: row.try_get("user_name")?,
        text: row.try_get("text")?,
        created_at: from_db_time(&created_at)?,
    })
}
