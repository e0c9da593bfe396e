//! Configuration module for the lobby backend.
//!
//! All configuration is loaded from environment variables with sensible defaults.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Error raised when an environment variable holds an unparsable value.
#[derive(Debug, Error)]
#[error("invalid value for {key}: {value:?}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Credentials for the payment processor used for Connect transfers.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub api_base: String,
}

/// Credentials for the secondary payout API.
#[derive(Debug, Clone)]
pub struct PaypalConfig {
    pub client_id: String,
    pub client_secret: String,
    pub api_base: String,
}

/// Endpoint and signing credentials for the pub/sub push service.
#[derive(Debug, Clone)]
pub struct PushConfig {
    pub url: String,
    pub key: String,
    pub secret: String,
}

/// Tunables for the payout retry job.
#[derive(Debug, Clone)]
pub struct PayoutPolicy {
    /// Maximum records read per invocation
    pub batch_size: i64,
    /// Records older than this are expired instead of retried
    pub max_age: chrono::Duration,
    /// Maximum transfer attempts per invocation
    pub max_transfers: usize,
    /// A record is failed permanently once it reaches this many retries
    pub max_retries: i64,
    /// A `processing` claim older than this is considered abandoned
    pub claim_timeout: chrono::Duration,
}

impl Default for PayoutPolicy {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_age: chrono::Duration::days(30),
            max_transfers: 10,
            max_retries: 5,
            claim_timeout: chrono::Duration::seconds(900),
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Pre-shared key for API authentication (required in production)
    pub api_psk: Option<String>,
    /// Secret expected on scheduled-job endpoints
    pub cron_secret: Option<String>,
    /// Path to SQLite database file
    pub db_path: PathBuf,
    /// Address to bind the server to
    pub bind_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    pub log_format: LogFormat,
    /// Presence records older than this are offline
    pub presence_stale: Duration,
    /// TTL of the online-list read-through cache
    pub presence_cache_ttl: Duration,
    /// How early before its start a DJ may check into the lobby
    pub lobby_open: chrono::Duration,
    pub max_slot_length: chrono::Duration,
    pub chat_retention: chrono::Duration,
    pub chat_rate_per_minute: u32,
    pub heartbeat_rate_per_minute: u32,
    pub payouts: PayoutPolicy,
    pub stripe: Option<StripeConfig>,
    pub paypal: Option<PaypalConfig>,
    pub push: Option<PushConfig>,
    /// Background job intervals; `None` disables the job
    pub switchover_interval: Option<Duration>,
    pub cleanup_interval: Option<Duration>,
    pub payout_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_psk: None,
            cron_secret: None,
            db_path: "./data/lobby.sqlite".into(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            presence_stale: Duration::from_secs(120),
            presence_cache_ttl: Duration::from_secs(20),
            lobby_open: chrono::Duration::minutes(30),
            max_slot_length: chrono::Duration::minutes(240),
            chat_retention: chrono::Duration::hours(24),
            chat_rate_per_minute: 20,
            heartbeat_rate_per_minute: 12,
            payouts: PayoutPolicy::default(),
            stripe: None,
            paypal: None,
            push: None,
            switchover_interval: None,
            cleanup_interval: None,
            payout_interval: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        let log_format = match env::var("LOBBY_LOG_FORMAT").ok().as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError {
                    key: "LOBBY_LOG_FORMAT",
                    value: other.to_string(),
                })
            }
        };

        // The online list must never be cached for longer than a few heartbeats.
        let cache_secs = parse_var::<u64>("LOBBY_PRESENCE_CACHE_SECS")?
            .unwrap_or(20)
            .clamp(15, 30);

        let stripe = env::var("LOBBY_STRIPE_SECRET_KEY")
            .ok()
            .map(|secret_key| StripeConfig {
                secret_key,
                api_base: env::var("LOBBY_STRIPE_API_BASE")
                    .unwrap_or_else(|_| "https://api.stripe.com".to_string()),
            });

        let paypal = match (
            env::var("LOBBY_PAYPAL_CLIENT_ID").ok(),
            env::var("LOBBY_PAYPAL_CLIENT_SECRET").ok(),
        ) {
            (Some(client_id), Some(client_secret)) => Some(PaypalConfig {
                client_id,
                client_secret,
                api_base: env::var("LOBBY_PAYPAL_API_BASE")
                    .unwrap_or_else(|_| "https://api-m.paypal.com".to_string()),
            }),
            _ => None,
        };

        let push = match (
            env::var("LOBBY_PUSH_URL").ok(),
            env::var("LOBBY_PUSH_KEY").ok(),
            env::var("LOBBY_PUSH_SECRET").ok(),
        ) {
            (Some(url), Some(key), Some(secret)) => Some(PushConfig { url, key, secret }),
            _ => None,
        };

        let payouts = PayoutPolicy {
            batch_size: parse_var("LOBBY_PAYOUT_BATCH_SIZE")?
                .unwrap_or(defaults.payouts.batch_size),
            max_age: parse_var("LOBBY_PAYOUT_MAX_AGE_DAYS")?
                .map(chrono::Duration::days)
                .unwrap_or(defaults.payouts.max_age),
            max_transfers: parse_var("LOBBY_PAYOUT_MAX_TRANSFERS")?
                .unwrap_or(defaults.payouts.max_transfers),
            max_retries: parse_var("LOBBY_PAYOUT_MAX_RETRIES")?
                .unwrap_or(defaults.payouts.max_retries),
            claim_timeout: parse_var("LOBBY_PAYOUT_CLAIM_TIMEOUT_SECS")?
                .map(chrono::Duration::seconds)
                .unwrap_or(defaults.payouts.claim_timeout),
        };

        Ok(Self {
            api_psk: env::var("LOBBY_API_PSK").ok(),
            cron_secret: env::var("LOBBY_CRON_SECRET").ok(),
            db_path: env::var("LOBBY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            bind_addr: parse_var("LOBBY_BIND_ADDR")?.unwrap_or(defaults.bind_addr),
            log_level: env::var("LOBBY_LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format,
            presence_stale: parse_var("LOBBY_PRESENCE_STALE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.presence_stale),
            presence_cache_ttl: Duration::from_secs(cache_secs),
            lobby_open: parse_var("LOBBY_LOBBY_OPEN_MINUTES")?
                .map(chrono::Duration::minutes)
                .unwrap_or(defaults.lobby_open),
            max_slot_length: parse_var("LOBBY_MAX_SLOT_MINUTES")?
                .map(chrono::Duration::minutes)
                .unwrap_or(defaults.max_slot_length),
            chat_retention: parse_var("LOBBY_CHAT_RETENTION_HOURS")?
                .map(chrono::Duration::hours)
                .unwrap_or(defaults.chat_retention),
            chat_rate_per_minute: parse_var("LOBBY_CHAT_RATE_PER_MINUTE")?
                .unwrap_or(defaults.chat_rate_per_minute),
            heartbeat_rate_per_minute: parse_var("LOBBY_HEARTBEAT_RATE_PER_MINUTE")?
                .unwrap_or(defaults.heartbeat_rate_per_minute),
            payouts,
            stripe,
            paypal,
            push,
            switchover_interval: parse_interval("LOBBY_SWITCHOVER_INTERVAL_SECS")?,
            cleanup_interval: parse_interval("LOBBY_CLEANUP_INTERVAL_SECS")?,
            payout_interval: parse_interval("LOBBY_PAYOUT_INTERVAL_SECS")?,
        })
    }
}

/// Parse an optional environment variable, failing on malformed values.
fn parse_var<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError { key, value }),
        Err(_) => Ok(None),
    }
}

/// Interval in seconds; zero or absent disables the job.
fn parse_interval(key: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(parse_var::<u64>(key)?
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env vars are process-global; keep everything touching them in one test.
    #[test]
    fn test_env_config() {
        for key in [
            "LOBBY_API_PSK",
            "LOBBY_CRON_SECRET",
            "LOBBY_DB_PATH",
            "LOBBY_BIND_ADDR",
            "LOBBY_LOG_LEVEL",
            "LOBBY_LOG_FORMAT",
            "LOBBY_PRESENCE_STALE_SECS",
            "LOBBY_PRESENCE_CACHE_SECS",
            "LOBBY_PAYOUT_MAX_AGE_DAYS",
            "LOBBY_SWITCHOVER_INTERVAL_SECS",
            "LOBBY_STRIPE_SECRET_KEY",
            "LOBBY_PUSH_URL",
        ] {
            env::remove_var(key);
        }

        let config = Config::from_env().unwrap();
        assert!(config.api_psk.is_none());
        assert!(config.cron_secret.is_none());
        assert_eq!(config.db_path, PathBuf::from("./data/lobby.sqlite"));
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.presence_stale, Duration::from_secs(120));
        assert_eq!(config.presence_cache_ttl, Duration::from_secs(20));
        assert!(config.switchover_interval.is_none());
        assert!(config.stripe.is_none());

        env::set_var("LOBBY_PRESENCE_CACHE_SECS", "300");
        env::set_var("LOBBY_PAYOUT_MAX_AGE_DAYS", "7");
        env::set_var("LOBBY_SWITCHOVER_INTERVAL_SECS", "0");
        env::set_var("LOBBY_STRIPE_SECRET_KEY", "sk_test_123");
        let config = Config::from_env().unwrap();
        assert_eq!(config.presence_cache_ttl, Duration::from_secs(30));
        assert_eq!(config.payouts.max_age, chrono::Duration::days(7));
        assert!(config.switchover_interval.is_none());
        let stripe = config.stripe.unwrap();
        assert_eq!(stripe.secret_key, "sk_test_123");
        assert_eq!(stripe.api_base, "https://api.stripe.com");

        env::set_var("LOBBY_BIND_ADDR", "not-an-address");
        let err = Config::from_env().unwrap_err();
        assert_eq!(err.key, "LOBBY_BIND_ADDR");

        for key in [
            "LOBBY_PRESENCE_CACHE_SECS",
            "LOBBY_PAYOUT_MAX_AGE_DAYS",
            "LOBBY_SWITCHOVER_INTERVAL_SECS",
            "LOBBY_STRIPE_SECRET_KEY",
            "LOBBY_BIND_ADDR",
        ] {
            env::remove_var(key);
        }
    }
}
