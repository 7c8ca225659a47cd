use super::validation::validate_sender;
use super::{validate_admin_token, AppError, AppState};
use crate::audit;
use crate::error::ErrorClass;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Query parameters for GET /api/v1/emails/count
#[derive(Deserialize)]
pub struct CountQuery {
    #[serde(rename = "senderEmail")]
    sender_email: Option<String>,
}

/// Count response
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountResponse {
    pub sender_email: String,
    pub email_count: u64,
    pub cached_result: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

pub fn create_emails_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/emails/count", get(count_emails))
        .route(
            "/api/v1/emails/credentials",
            post(upload_credentials).delete(delete_credentials),
        )
        .route("/api/v1/emails/credentials/status", get(credentials_status))
        .route("/api/v1/emails/health", get(health))
        .with_state(state)
}

/// GET /api/v1/emails/count?senderEmail=...
///
/// Counting runs in its own task. If the client disconnects, this handler's future is
/// dropped, the drop guard cancels the token, and pagination stops at the next page.
async fn count_emails(
    State(state): State<AppState>,
    Query(query): Query<CountQuery>,
) -> Result<Json<CountResponse>, AppError> {
    let sender = validate_sender(query.sender_email.as_deref().unwrap_or_default())
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    let masked = audit::mask_email(&sender);

    if let Some(count) = state.count_cache.get(&sender) {
        debug!(sender = %masked, "Count cache hit");
        return Ok(Json(CountResponse {
            sender_email: sender,
            email_count: count,
            cached_result: true,
            timestamp: Utc::now(),
        }));
    }

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let service = state.service.clone();
    let task_sender = sender.clone();
    let handle = tokio::spawn(async move { service.count_emails(&task_sender, &cancel).await });

    let result = handle.await.map_err(|e| {
        error!(error = %e, "Count task failed");
        AppError::ServerError("Internal server error".to_string())
    })?;
    guard.disarm();

    match result {
        Ok(count) => {
            state.count_cache.insert(&sender, count);
            info!(sender = %masked, count, "Email count served");
            Ok(Json(CountResponse {
                sender_email: sender,
                email_count: count,
                cached_result: false,
                timestamp: Utc::now(),
            }))
        }
        Err(e) => {
            match e.class() {
                ErrorClass::Cancelled => info!(sender = %masked, "Count request cancelled"),
                _ if e.is_disconnect() => {
                    info!(sender = %masked, "Mail provider closed the connection")
                }
                ErrorClass::Server => error!(sender = %masked, error = %e, "Count request failed"),
                _ => warn!(sender = %masked, error = %e, "Count request failed"),
            }
            Err(e.into())
        }
    }
}

/// POST /api/v1/emails/credentials
///
/// Body is a client secret JSON document. Rejected unless it parses as one.
async fn upload_credentials(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if !validate_admin_token(&headers, state.admin_token.as_deref()) {
        return AppError::Unauthorized("Unauthorized".to_string()).into_response();
    }

    match state.service.upload_client_secret(&body) {
        Ok(()) => {
            state.count_cache.clear();
            Json(MessageResponse {
                message: "Credentials uploaded".to_string(),
            })
            .into_response()
        }
        Err(e) => {
            warn!(error = %e, "Rejected credentials upload");
            AppError::from(e).into_response()
        }
    }
}

/// DELETE /api/v1/emails/credentials
///
/// Clears the uploaded client secret and every stored token. The key file stays.
async fn delete_credentials(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !validate_admin_token(&headers, state.admin_token.as_deref()) {
        return AppError::Unauthorized("Unauthorized".to_string()).into_response();
    }

    match state.service.clear_credentials() {
        Ok(cleared) => {
            state.count_cache.clear();
            Json(cleared).into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to clear credentials");
            AppError::from(e).into_response()
        }
    }
}

/// GET /api/v1/emails/credentials/status
async fn credentials_status(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !validate_admin_token(&headers, state.admin_token.as_deref()) {
        return AppError::Unauthorized("Unauthorized".to_string()).into_response();
    }

    match state.service.status() {
        Ok(status) => Json(status).into_response(),
        Err(e) => AppError::from(e).into_response(),
    }
}

/// GET /api/v1/emails/health
async fn health() -> impl IntoResponse {
    (StatusCode::OK, "mailtally is running")
}
