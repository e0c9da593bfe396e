//! Helpers shared by unit tests.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use crate::db::{init_database, Repository};

/// A repository backed by a fresh SQLite file. Keep the `TempDir` alive for
/// as long as the repository is used.
pub async fn temp_repo() -> (Arc<Repository>, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let pool = init_database(&dir.path().join("test.sqlite"))
        .await
        .expect("Failed to init DB");
    (Arc::new(Repository::new(pool)), dir)
}

/// 2026-05-01 at the given UTC time.
pub fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 1, hour, minute, second)
        .single()
        .expect("valid test timestamp")
}
