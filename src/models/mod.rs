//! Data models for the lobby backend.
//!
//! Field names serialize as camelCase to match the web front end.

mod chat;
mod payout;
mod presence;
mod slot;

pub use chat::*;
pub use payout::*;
pub use presence::*;
pub use slot::*;

use serde::Serialize;

/// Number of records removed by a cleanup sweep.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub removed: u64,
}
