use axum::Json;
use serde::Serialize;

use crate::diagnostics::{self, AboutInfo};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub build: AboutInfo,
}

#[tracing::instrument(name = "GET /health")]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        build: diagnostics::about_info(),
    })
}
