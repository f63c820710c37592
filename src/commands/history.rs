use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::api::{self, ApiError, AppState};
use crate::history::{self, BranchHistory};

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// `GET /api/branches/{branch_id}/aggregates?limit=N`
#[tracing::instrument(name = "GET /api/branches/{branch_id}/aggregates", skip(state))]
pub async fn branch_aggregates(
    State(state): State<AppState>,
    Path(branch_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<BranchHistory>, ApiError> {
    let history = api::run_blocking(move || {
        history::read_history(&state.db, &state.clock, &branch_id, query.limit)
            .map_err(ApiError::from)
    })
    .await?;

    Ok(Json(history))
}
