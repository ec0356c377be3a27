use axum::{routing::get, Json, Router};

use crate::api::rest::{
    approvals::router as approvals_router, datasources::router as datasources_router,
    queries::router as queries_router, transactions::router as transactions_router,
};
use crate::services::errors::ServiceError;

pub mod approvals;
pub mod datasources;
pub mod health;
pub mod queries;
pub mod transactions;

pub fn router() -> Router {
    Router::new()
        .route("/health", get(health::healthcheck))
        .nest("/queries", queries_router())
        .nest("/approvals", approvals_router())
        .nest("/transactions", transactions_router())
        .nest("/datasources", datasources_router())
}

/// Shared error envelope: `{"error": {"kind": ..., "message": ...}}` with
/// the kind mirrored for machine handling.
pub fn to_response(err: ServiceError) -> (axum::http::StatusCode, Json<serde_json::Value>) {
    (
        err.status_code(),
        Json(serde_json::json!({
            "error": { "kind": err.kind(), "message": err.to_string() }
        })),
    )
}
