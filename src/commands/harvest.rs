use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use chrono::Utc;

use crate::api::{self, ApiError, AppState};
use crate::harvest::{self, HarvestRequest};
use crate::model::HarvestResult;

/// `POST /api/harvest` with `{ deviceId, key }`.
#[tracing::instrument(name = "POST /api/harvest", skip(state, payload))]
pub async fn harvest(
    State(state): State<AppState>,
    payload: Result<Json<HarvestRequest>, JsonRejection>,
) -> Result<Json<HarvestResult>, ApiError> {
    let Json(request) = payload.map_err(super::rejection_to_error)?;

    let result = api::run_blocking(move || {
        harvest::settle_harvest(&state.db, &request, state.harvest_key.as_str(), Utc::now())
            .map_err(ApiError::from)
    })
    .await?;

    Ok(Json(result))
}
