//! HTTP surface for the counting service.
//!
//! Thin layer: validates input, maps [`TallyError`] classes to status codes, and caches
//! counts per sender. Upstream error text never reaches a response body.

pub mod cache;
pub mod emails;
pub mod validation;

pub use cache::CountCache;
pub use emails::create_emails_router;

use crate::error::{ErrorClass, TallyError};
use crate::service::EmailCountService;
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    Router,
};
use serde::Serialize;
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<EmailCountService>,
    pub count_cache: Arc<CountCache>,
    /// Required bearer token for credential routes. None = unrestricted.
    pub admin_token: Option<String>,
}

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    create_emails_router(state)
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Application error types
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    TooManyRequests(String),
    ServerError(String),
    BadGateway(String),
    /// Caller went away; nothing useful to send
    ClientClosedRequest,
}

/// Non-standard status for a request the client abandoned.
const CLIENT_CLOSED_REQUEST: u16 = 499;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::TooManyRequests(msg) => (StatusCode::TOO_MANY_REQUESTS, msg),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            AppError::ClientClosedRequest => {
                let status = StatusCode::from_u16(CLIENT_CLOSED_REQUEST)
                    .unwrap_or(StatusCode::BAD_REQUEST);
                return status.into_response();
            }
        };

        let body = Json(ErrorResponse {
            error: error_message,
        });

        (status, body).into_response()
    }
}

impl From<TallyError> for AppError {
    fn from(error: TallyError) -> Self {
        match error.class() {
            ErrorClass::Client => AppError::BadRequest(error.to_string()),
            ErrorClass::Auth => AppError::Unauthorized(
                "Authentication with the mail provider failed, re-authorization may be required"
                    .to_string(),
            ),
            ErrorClass::RateLimit => AppError::TooManyRequests(
                "Mail provider rate limit exceeded, retry later".to_string(),
            ),
            ErrorClass::Upstream => AppError::BadGateway("Mail provider request failed".to_string()),
            ErrorClass::Cancelled => AppError::ClientClosedRequest,
            ErrorClass::Server => match error {
                TallyError::CallbackPortExhausted { .. } => AppError::ServerError(error.to_string()),
                _ => AppError::ServerError("Internal server error".to_string()),
            },
        }
    }
}

/// Returns true if the bearer token in `Authorization` matches the expected admin token.
/// Returns true (no restriction) when `expected` is None.
pub(crate) fn validate_admin_token(headers: &HeaderMap, expected: Option<&str>) -> bool {
    let Some(expected_token) = expected else {
        return true;
    };

    let Some(value) = headers.get("Authorization").and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(token) = value.strip_prefix("Bearer ") else {
        return false;
    };

    token == expected_token
}
