//! Outbound transfer APIs.
//!
//! Both clients pass the payout's idempotency key through, so a transfer that
//! is retried after a timeout or a crash is executed at most once upstream.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::{PaypalConfig, StripeConfig};
use crate::models::PayoutMethod;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Transfer rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Authentication failed: {0}")]
    Auth(String),
}

impl TransferError {
    /// Whether trying again later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Network(_) | TransferError::Parse(_) | TransferError::Auth(_) => true,
            // 409 is an idempotent request still in flight upstream.
            TransferError::Rejected { status, .. } => {
                *status == 409 || *status == 429 || *status >= 500
            }
        }
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        TransferError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        TransferError::Parse(err.to_string())
    }
}

/// A single transfer to an artist.
#[derive(Debug, Clone)]
pub struct TransferRequest<'a> {
    pub idempotency_key: String,
    pub pending_payout_id: &'a str,
    pub artist_id: &'a str,
    pub destination: &'a str,
    /// Minor units
    pub amount: i64,
    pub currency: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub transfer_id: String,
}

#[async_trait]
pub trait TransferProvider: Send + Sync {
    fn method(&self) -> PayoutMethod;

    async fn transfer(&self, request: &TransferRequest<'_>) -> Result<TransferReceipt, TransferError>;
}

// ==================== STRIPE ====================

/// Connect transfers to the artist's connected account.
pub struct StripeTransfers {
    client: Client,
    config: StripeConfig,
}

impl StripeTransfers {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

#[derive(Deserialize)]
struct StripeTransfer {
    id: String,
}

#[async_trait]
impl TransferProvider for StripeTransfers {
    fn method(&self) -> PayoutMethod {
        PayoutMethod::Stripe
    }

    async fn transfer(&self, request: &TransferRequest<'_>) -> Result<TransferReceipt, TransferError> {
        let url = format!("{}/v1/transfers", self.config.api_base.trim_end_matches('/'));
        let amount = request.amount.to_string();
        let params = [
            ("amount", amount.as_str()),
            ("currency", request.currency),
            ("destination", request.destination),
            ("transfer_group", request.pending_payout_id),
            ("metadata[artist_id]", request.artist_id),
            ("metadata[pending_payout_id]", request.pending_payout_id),
        ];

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.secret_key)
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(TransferError::Rejected {
                status: status.as_u16(),
                message: error_message(&body, "/error/message"),
            });
        }

        let transfer: StripeTransfer = serde_json::from_str(&body)?;
        Ok(TransferReceipt {
            transfer_id: transfer.id,
        })
    }
}

// ==================== PAYPAL ====================

/// Refresh the access token this long before PayPal says it expires.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// PayPal Payouts to the artist's e-mail address.
pub struct PaypalPayouts {
    client: Client,
    config: PaypalConfig,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

impl PaypalPayouts {
    pub fn new(config: PaypalConfig) -> Self {
        Self {
            client: Client::new(),
            config,
            token: Mutex::new(None),
        }
    }

    fn base(&self) -> &str {
        self.config.api_base.trim_end_matches('/')
    }

    /// Client-credentials token, cached until shortly before it expires.
    async fn access_token(&self) -> Result<String, TransferError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .client
            .post(format!("{}/v1/oauth2/token", self.base()))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(TransferError::Auth(format!(
                "status {}: {}",
                status.as_u16(),
                error_message(&body, "/error_description")
            )));
        }

        let token: TokenResponse = serde_json::from_str(&body)?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });

        Ok(token.access_token)
    }
}

#[async_trait]
impl TransferProvider for PaypalPayouts {
    fn method(&self) -> PayoutMethod {
        PayoutMethod::Paypal
    }

    async fn transfer(&self, request: &TransferRequest<'_>) -> Result<TransferReceipt, TransferError> {
        let token = self.access_token().await?;
        let currency = request.currency.to_uppercase();

        let body = json!({
            "sender_batch_header": {
                "sender_batch_id": request.idempotency_key,
                "email_subject": "You have a payout",
                "recipient_type": "EMAIL",
            },
            "items": [{
                "recipient_type": "EMAIL",
                "receiver": request.destination,
                "sender_item_id": request.pending_payout_id,
                "amount": {
                    "value": format_major_units(request.amount, &currency),
                    "currency": currency,
                },
            }],
        });

        let response = self
            .client
            .post(format!("{}/v1/payments/payouts", self.base()))
            .bearer_auth(token)
            // A repeated request id replays the original response.
            .header("PayPal-Request-Id", &request.idempotency_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            // Past the request-id window a retry hits the batch it already created.
            if status.is_client_error() && is_duplicate_batch(&text) {
                tracing::warn!(
                    sender_batch_id = %request.idempotency_key,
                    "Payout batch already exists upstream, treating as sent"
                );
                return Ok(TransferReceipt {
                    transfer_id: request.idempotency_key.clone(),
                });
            }
            return Err(TransferError::Rejected {
                status: status.as_u16(),
                message: error_message(&text, "/message"),
            });
        }

        let parsed: Value = serde_json::from_str(&text)?;
        let batch_id = parsed
            .pointer("/batch_header/payout_batch_id")
            .and_then(Value::as_str)
            .ok_or_else(|| TransferError::Parse("missing payout_batch_id".to_string()))?;

        Ok(TransferReceipt {
            transfer_id: batch_id.to_string(),
        })
    }
}

/// Whether a PayPal error body reports that the sender batch id was used before.
fn is_duplicate_batch(body: &str) -> bool {
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return false;
    };
    if parsed.pointer("/name").and_then(Value::as_str) == Some("DUPLICATE_REQUEST_ID") {
        return true;
    }
    parsed
        .pointer("/details")
        .and_then(Value::as_array)
        .is_some_and(|details| {
            details.iter().any(|detail| {
                let field = detail.pointer("/field").and_then(Value::as_str).unwrap_or_default();
                let issue = detail.pointer("/issue").and_then(Value::as_str).unwrap_or_default();
                field.eq_ignore_ascii_case("sender_batch_id")
                    && issue.to_ascii_lowercase().contains("already exists")
            })
        })
}

/// Currencies PayPal expects without a fractional part.
const ZERO_DECIMAL_CURRENCIES: &[&str] = &["HUF", "JPY", "TWD"];

/// Render a minor-unit amount as the decimal string PayPal expects.
fn format_major_units(amount: i64, currency: &str) -> String {
    if ZERO_DECIMAL_CURRENCIES.contains(&currency) {
        return amount.to_string();
    }
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// Pull a human-readable message out of an error body, falling back to the
/// raw text.
fn error_message(body: &str, pointer: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.pointer(pointer).and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect())
}
