//! Request extractors that reject with the error envelope.
//!
//! axum's own `Json` and `Query` answer malformed input with a plain-text body
//! (and 422 for a missing field). These wrappers route the rejection through
//! [`AppError`] so clients always get `{success:false,error}` and a 400.

use axum::extract::{FromRequest, FromRequestParts};

use crate::errors::AppError;

/// JSON body extractor.
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

/// Query-string extractor.
#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(AppError))]
pub struct ApiQuery<T>(pub T);
