//! HTTP surface: shared state, router and the JSON error envelope.
//!
//! Handlers live in `commands/`; they parse the request, hop onto a blocking
//! thread for the SQLite work and map domain errors through [`ApiError`].

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use zeroize::Zeroizing;

use crate::business_time::BusinessClock;
use crate::commands;
use crate::db::DbState;
use crate::error::{AggregationError, HarvestError, HistoryError, LedgerError};
use crate::harvest;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbState>,
    pub clock: BusinessClock,
    pub harvest_key: Arc<Zeroizing<String>>,
}

impl AppState {
    pub fn new(db: Arc<DbState>, clock: BusinessClock, harvest_key: Zeroizing<String>) -> Self {
        Self {
            db,
            clock,
            harvest_key: Arc::new(harvest_key),
        }
    }

    /// Gate for the secret-protected write endpoints.
    pub fn require_key(&self, provided: Option<&str>) -> Result<(), ApiError> {
        if harvest::keys_match(provided.unwrap_or_default(), self.harvest_key.as_str()) {
            Ok(())
        } else {
            Err(ApiError::unauthorized("Invalid key")
                .with_suggestion("Send the configured harvest key in the `key` field"))
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(commands::health::health))
        .route("/api/harvest", post(commands::harvest::harvest))
        .route("/api/sales", post(commands::sales::record_sale))
        .route(
            "/api/aggregation/run",
            post(commands::aggregation::run_aggregation),
        )
        .route(
            "/api/aggregation/status",
            get(commands::aggregation::aggregation_status),
        )
        .route(
            "/api/branches/{branch_id}/aggregates",
            get(commands::history::branch_aggregates),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Run store work off the async runtime.
pub async fn run_blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::internal(format!("blocking task failed: {e}")))?
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<String>,
    suggestion: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
            suggestion: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        warn!("Bad request: {msg}");
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        warn!("Unauthorized: {msg}");
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        warn!("Not found: {msg}");
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", msg)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        warn!("Conflict: {msg}");
        Self::new(StatusCode::CONFLICT, "CONFLICT", msg)
    }

    /// The cause goes to the log and to `details`; the message stays generic.
    pub fn internal(cause: impl Into<String>) -> Self {
        let cause = cause.into();
        error!("Internal error: {cause}");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            "Internal server error",
        )
        .with_details(cause)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorBody<'a> {
            error: &'a str,
            message: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            details: Option<&'a str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            suggestion: Option<&'a str>,
        }

        (
            self.status,
            Json(ErrorBody {
                error: self.code,
                message: &self.message,
                details: self.details.as_deref(),
                suggestion: self.suggestion.as_deref(),
            }),
        )
            .into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Validation(msg) => Self::bad_request(msg),
            LedgerError::NotFound(msg) => Self::not_found(msg),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<HarvestError> for ApiError {
    fn from(err: HarvestError) -> Self {
        match err {
            HarvestError::InvalidCredential => Self::unauthorized(err.to_string())
                .with_suggestion("Send the configured harvest key in the `key` field"),
            HarvestError::MissingDeviceId => Self::bad_request(err.to_string())
                .with_suggestion("Include the unit's `deviceId` in the request body"),
            HarvestError::NothingToHarvest { .. } => Self::not_found(err.to_string())
                .with_suggestion("Daily unit aggregates may not have been produced yet"),
            HarvestError::Conflict { .. } => Self::conflict(err.to_string())
                .with_suggestion("Another settlement for this device ran concurrently; retry"),
            HarvestError::Store(inner) => Self::internal(inner.to_string())
                .with_suggestion("Check the server logs and retry the settlement"),
        }
    }
}

impl From<HistoryError> for ApiError {
    fn from(err: HistoryError) -> Self {
        match err {
            HistoryError::BranchNotFound(_) => Self::not_found(err.to_string()),
            HistoryError::Store(inner) => Self::from(inner),
        }
    }
}

impl From<AggregationError> for ApiError {
    fn from(err: AggregationError) -> Self {
        match err {
            AggregationError::InvalidDate(_) => Self::bad_request(err.to_string()),
            AggregationError::Store { ref date_id, .. } => {
                let suggestion =
                    format!("Nothing was written; replay with {{\"date\": \"{date_id}\"}}");
                Self::internal(err.to_string()).with_suggestion(suggestion)
            }
        }
    }
}
