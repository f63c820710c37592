//! Request handlers. Each one parses its payload and delegates to a domain
//! module; none of them touch SQL directly.

pub mod aggregation;
pub mod harvest;
pub mod health;
pub mod history;
pub mod sales;

use axum::extract::rejection::JsonRejection;

use crate::api::ApiError;

/// Malformed or non-JSON bodies become our 400 envelope instead of axum's
/// plain-text rejection.
pub(crate) fn rejection_to_error(rejection: JsonRejection) -> ApiError {
    ApiError::bad_request(rejection.body_text())
        .with_suggestion("Send a JSON object with Content-Type: application/json")
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use axum::response::{IntoResponse, Response};
    use zeroize::Zeroizing;

    use crate::api::AppState;
    use crate::business_time::BusinessClock;
    use crate::db;

    pub const KEY: &str = "test-harvest-key";

    pub fn app_state() -> AppState {
        AppState::new(
            Arc::new(db::test_state()),
            BusinessClock::new(480).unwrap(),
            Zeroizing::new(KEY.to_string()),
        )
    }

    pub async fn into_json(response: impl IntoResponse) -> (u16, serde_json::Value) {
        let response: Response = response.into_response();
        let status = response.status().as_u16();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }
}
