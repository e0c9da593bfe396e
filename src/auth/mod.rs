//! Shared-secret authentication layers.
//!
//! Implements constant-time comparison to mitigate timing attacks.

use axum::{
    extract::Request,
    http::{header, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;

use crate::errors::AppError;

/// Header name for the API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Header name for the scheduled-job secret.
pub const CRON_SECRET_HEADER: &str = "x-cron-secret";

/// PSK authentication layer function that takes the expected PSK as a parameter.
pub async fn psk_auth_layer(
    expected_psk: Option<String>,
    request: Request,
    next: Next,
) -> Response {
    // If no PSK is configured, allow all requests (dev mode)
    let Some(expected) = expected_psk else {
        return next.run(request).await;
    };

    if presented_secret(request.headers(), API_KEY_HEADER)
        .is_some_and(|provided| constant_time_compare(provided, &expected))
    {
        next.run(request).await
    } else {
        AppError::Unauthorized("Missing or invalid API key".to_string()).into_response()
    }
}

/// Guard for cron-triggered endpoints.
///
/// Unlike the API key, an unset cron secret locks the routes instead of
/// opening them: the payout job moves money.
pub async fn cron_auth_layer(
    expected_secret: Option<String>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = expected_secret else {
        return AppError::Unauthorized("Cron endpoints are not configured".to_string())
            .into_response();
    };

    if presented_secret(request.headers(), CRON_SECRET_HEADER)
        .is_some_and(|provided| constant_time_compare(provided, &expected))
    {
        next.run(request).await
    } else {
        AppError::Unauthorized("Missing or invalid cron secret".to_string()).into_response()
    }
}

/// Secret from the dedicated header, falling back to a bearer token.
fn presented_secret<'a>(headers: &'a HeaderMap, header_name: &str) -> Option<&'a str> {
    headers
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer "))
        })
}

/// Perform constant-time string comparison.
fn constant_time_compare(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Reject callers acting on a resource owned by someone else.
pub fn ensure_owner(owner_id: &str, caller_id: &str, what: &str) -> Result<(), AppError> {
    if constant_time_compare(owner_id, caller_id) {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!("Only the owner may {}", what)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode, middleware, routing::post, Router};
    use tower::ServiceExt;

    #[test]
    fn test_constant_time_compare_equal() {
        assert!(constant_time_compare("test-key-123", "test-key-123"));
    }

    #[test]
    fn test_constant_time_compare_not_equal() {
        assert!(!constant_time_compare("test-key-123", "test-key-124"));
    }

    #[test]
    fn test_constant_time_compare_different_lengths() {
        assert!(!constant_time_compare("short", "much-longer-key"));
    }

    #[test]
    fn test_ensure_owner() {
        assert!(ensure_owner("dj-1", "dj-1", "end this slot").is_ok());
        let err = ensure_owner("dj-1", "dj-2", "end this slot").unwrap_err();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
    }

    fn cron_router(secret: Option<&str>) -> Router {
        let secret = secret.map(str::to_string);
        Router::new()
            .route("/job", post(|| async { "ran" }))
            .layer(middleware::from_fn(move |req, next| {
                cron_auth_layer(secret.clone(), req, next)
            }))
    }

    #[tokio::test]
    async fn test_cron_layer_rejects_when_unconfigured() {
        let resp = cron_router(None)
            .oneshot(
                axum::http::Request::post("/job")
                    .header(CRON_SECRET_HEADER, "anything")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_cron_layer_accepts_bearer() {
        let resp = cron_router(Some("s3cret"))
            .oneshot(
                axum::http::Request::post("/job")
                    .header(header::AUTHORIZATION, "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = cron_router(Some("s3cret"))
            .oneshot(
                axum::http::Request::post("/job")
                    .header(CRON_SECRET_HEADER, "wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
