//! In-process periodic runners.
//!
//! These duplicate what the `/cron` endpoints do, for deployments without an
//! external scheduler. Each tick logs its own failure and keeps going.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::chat::ChatService;
use crate::payouts::PayoutService;
use crate::presence::PresenceService;
use crate::scheduler::SlotScheduler;

fn ticker(interval: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

pub fn spawn_switchover(scheduler: SlotScheduler, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(interval);
        loop {
            ticker.tick().await;
            match scheduler.check_and_advance(Utc::now()).await {
                Ok(report) if !report.transitions.is_empty() => {
                    tracing::info!(transitions = report.transitions.len(), "Switchover job advanced slots");
                }
                Ok(_) => {}
                Err(e) => tracing::error!("Switchover job failed: {}", e),
            }
        }
    })
}

/// Presence and chat cleanup share one loop.
pub fn spawn_cleanup(
    presence: Arc<PresenceService>,
    chat: Arc<ChatService>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(interval);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            if let Err(e) = presence.cleanup(now).await {
                tracing::error!("Presence cleanup failed: {}", e);
            }
            if let Err(e) = chat.cleanup(now).await {
                tracing::error!("Chat cleanup failed: {}", e);
            }
        }
    })
}

pub fn spawn_payout_retry(payouts: Arc<PayoutService>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = payouts.run_retry_job(Utc::now()).await {
                tracing::error!("Payout retry job failed: {}", e);
            }
        }
    })
}
