//! Real-time fan-out through an external pub/sub push service.
//!
//! Delivery is best-effort: callers log a failed publish and carry on.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

use crate::config::PushConfig;

/// Channel carrying lobby presence and chat events.
pub const LOBBY_CHANNEL: &str = "dj-lobby";
/// Channel carrying livestream slot changes.
pub const LIVESTREAM_CHANNEL: &str = "livestream";

pub mod events {
    pub const USER_JOINED: &str = "user-joined";
    pub const USER_LEFT: &str = "user-left";
    pub const USER_UPDATED: &str = "user-updated";
    pub const CHAT_MESSAGE: &str = "chat-message";
    pub const SLOT_LIVE: &str = "slot-live";
    pub const SLOT_ENDED: &str = "slot-ended";
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Push service rejected event (status {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Signing error: {0}")]
    Signing(String),
}

impl From<reqwest::Error> for PushError {
    fn from(err: reqwest::Error) -> Self {
        PushError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for PushError {
    fn from(err: serde_json::Error) -> Self {
        PushError::Serialization(err.to_string())
    }
}

/// Publishes named events on channels.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn publish(&self, channel: &str, event: &str, data: Value) -> Result<(), PushError>;
}

/// Publish and swallow the failure; fan-out never fails a request.
pub async fn publish_best_effort(
    broadcaster: &dyn Broadcaster,
    channel: &str,
    event: &str,
    data: Value,
) {
    if let Err(e) = broadcaster.publish(channel, event, data).await {
        tracing::warn!(channel, event, "Failed to publish event: {}", e);
    }
}

#[derive(Serialize)]
struct PushEvent<'a> {
    name: &'a str,
    channel: &'a str,
    data: Value,
}

/// Client for the hosted push service.
///
/// Each request is signed with HMAC-SHA256 over `"{timestamp}.{body}"`.
pub struct HttpPushBroadcaster {
    client: Client,
    config: PushConfig,
}

impl HttpPushBroadcaster {
    pub fn new(config: PushConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

#[async_trait]
impl Broadcaster for HttpPushBroadcaster {
    async fn publish(&self, channel: &str, event: &str, data: Value) -> Result<(), PushError> {
        let body = serde_json::to_string(&PushEvent {
            name: event,
            channel,
            data,
        })?;
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = sign(&self.config.secret, &timestamp, &body)?;

        let response = self
            .client
            .post(&self.config.url)
            .header("content-type", "application/json")
            .header("x-push-key", &self.config.key)
            .header("x-push-timestamp", &timestamp)
            .header("x-push-signature", signature)
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PushError::Rejected {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        Ok(())
    }
}

/// Stand-in used when no push service is configured.
pub struct LogBroadcaster;

#[async_trait]
impl Broadcaster for LogBroadcaster {
    async fn publish(&self, channel: &str, event: &str, _data: Value) -> Result<(), PushError> {
        tracing::debug!(channel, event, "push service not configured, event dropped");
        Ok(())
    }
}

fn sign(secret: &str, timestamp: &str, body: &str) -> Result<String, PushError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| PushError::Signing(e.to_string()))?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
pub mod testing {
    //! Recording broadcaster for tests.

    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingBroadcaster {
        pub events: Mutex<Vec<(String, String, Value)>>,
    }

    impl RecordingBroadcaster {
        pub fn event_names(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|(_, name, _)| name.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Broadcaster for RecordingBroadcaster {
        async fn publish(&self, channel: &str, event: &str, data: Value) -> Result<(), PushError> {
            self.events
                .lock()
                .unwrap()
                .push((channel.to_string(), event.to_string(), data));
            Ok(())
        }
    }
}
