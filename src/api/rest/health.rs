use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, Json};

use crate::infrastructure::state::AppState;

/// Gateway liveness: a trivial round trip to the primary store.
pub async fn healthcheck(
    Extension(state): Extension<Arc<AppState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "unavailable",
                "error": err.to_string(),
            })),
        ),
    }
}
