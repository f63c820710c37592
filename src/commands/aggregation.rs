use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::aggregation::{self, AggregationOutcome};
use crate::api::{self, ApiError, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct RunAggregationRequest {
    #[serde(default)]
    pub key: Option<String>,
    /// `YYYY-MM-DD`; the current business day when absent.
    #[serde(default)]
    pub date: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationStatus {
    pub last_run_date_id: Option<String>,
    pub last_run_at: Option<String>,
}

/// `POST /api/aggregation/run`: on-demand run or replay of a named day.
#[tracing::instrument(name = "POST /api/aggregation/run", skip(state, payload))]
pub async fn run_aggregation(
    State(state): State<AppState>,
    payload: Result<Json<RunAggregationRequest>, JsonRejection>,
) -> Result<Json<AggregationOutcome>, ApiError> {
    let Json(request) = payload.map_err(super::rejection_to_error)?;
    state.require_key(request.key.as_deref())?;

    let outcome = api::run_blocking(move || {
        let now = Utc::now();
        let result = match request.date.as_deref().map(str::trim) {
            Some(date_id) if !date_id.is_empty() => {
                info!(date_id = %date_id, "Manual aggregation replay requested");
                aggregation::run_aggregation_for_date(&state.db, &state.clock, date_id, now)
            }
            _ => aggregation::run_daily_aggregation(&state.db, &state.clock, now),
        };
        result.map_err(ApiError::from)
    })
    .await?;

    Ok(Json(outcome))
}

/// `GET /api/aggregation/status`: marker of the last committed run.
#[tracing::instrument(name = "GET /api/aggregation/status", skip(state))]
pub async fn aggregation_status(
    State(state): State<AppState>,
) -> Result<Json<AggregationStatus>, ApiError> {
    let last = api::run_blocking(move || aggregation::last_run(&state.db).map_err(ApiError::from))
        .await?;

    let (last_run_date_id, last_run_at) = match last {
        Some((date_id, at)) => (Some(date_id), Some(at)),
        None => (None, None),
    };
    Ok(Json(AggregationStatus {
        last_run_date_id,
        last_run_at,
    }))
}
