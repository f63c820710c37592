use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::api::{self, ApiError, AppState};
use crate::ingest::{self, SalePayload};

#[derive(Debug, Deserialize)]
pub struct RecordSaleRequest {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(flatten)]
    pub sale: SalePayload,
}

#[derive(Debug, Serialize)]
pub struct RecordSaleResponse {
    pub id: String,
}

/// `POST /api/sales`: append one raw coin event from a unit.
#[tracing::instrument(name = "POST /api/sales", skip(state, payload))]
pub async fn record_sale(
    State(state): State<AppState>,
    payload: Result<Json<RecordSaleRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RecordSaleResponse>), ApiError> {
    let Json(request) = payload.map_err(super::rejection_to_error)?;
    state.require_key(request.key.as_deref())?;

    let id = api::run_blocking(move || {
        ingest::record_sale(&state.db, &request.sale, Utc::now()).map_err(ApiError::from)
    })
    .await?;

    Ok((StatusCode::CREATED, Json(RecordSaleResponse { id })))
}
