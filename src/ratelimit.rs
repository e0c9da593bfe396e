//! Per-user fixed-window rate limiting.
//!
//! Counters live in a process-local Moka cache and expire on their own once a
//! user goes idle. They are best-effort: a restart or a second instance starts
//! from zero.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use moka::sync::Cache;

use crate::errors::AppError;

struct Window {
    started: Instant,
    count: u32,
}

/// Allows `limit` hits per key within each `window`.
pub struct RateLimiter {
    name: &'static str,
    limit: u32,
    window: Duration,
    windows: Cache<String, Arc<Mutex<Window>>>,
}

impl RateLimiter {
    pub fn new(name: &'static str, limit: u32, window: Duration) -> Self {
        let windows = Cache::builder()
            .max_capacity(100_000)
            .time_to_idle(window * 2)
            .build();

        Self {
            name,
            limit,
            window,
            windows,
        }
    }

    /// Limit per minute, the unit the configuration uses.
    pub fn per_minute(name: &'static str, limit: u32) -> Self {
        Self::new(name, limit, Duration::from_secs(60))
    }

    /// Count a hit for `key`, failing with `RateLimited` once over the limit.
    pub fn check(&self, key: &str) -> Result<(), AppError> {
        let now = Instant::now();
        let slot = self.windows.get_with(key.to_string(), || {
            Arc::new(Mutex::new(Window {
                started: now,
                count: 0,
            }))
        });

        let mut window = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if now.duration_since(window.started) >= self.window {
            window.started = now;
            window.count = 0;
        }

        if window.count >= self.limit {
            let retry_after = self
                .window
                .saturating_sub(now.duration_since(window.started))
                .as_secs()
                .max(1);
            tracing::debug!(limiter = self.name, key, "rate limit exceeded");
            return Err(AppError::RateLimited {
                message: format!("Too many {} requests, slow down", self.name),
                retry_after_secs: retry_after,
            });
        }

        window.count += 1;
        Ok(())
    }
}
