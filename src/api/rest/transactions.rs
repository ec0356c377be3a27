use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;

use crate::{
    api::rest::to_response,
    infrastructure::{auth::AuthenticatedUser, state::AppState},
    services::transactions::TransactionService,
};

pub fn router() -> Router {
    Router::new()
        .route("/:id", get(status))
        .route("/:id/commit", post(commit))
        .route("/:id/rollback", post(rollback))
}

async fn status(
    Extension(state): Extension<Arc<AppState>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, Json<serde_json::Value>)> {
    let service = TransactionService::new(state);
    let record = service.status(&user, id).await.map_err(to_response)?;
    Ok(Json(serde_json::json!({ "transaction": record })))
}

async fn commit(
    Extension(state): Extension<Arc<AppState>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, Json<serde_json::Value>)> {
    let service = TransactionService::new(state);
    let record = service.commit(&user, id).await.map_err(to_response)?;
    Ok(Json(serde_json::json!({ "transaction": record })))
}

async fn rollback(
    Extension(state): Extension<Arc<AppState>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, Json<serde_json::Value>)> {
    let service = TransactionService::new(state);
    let record = service.rollback(&user, id).await.map_err(to_response)?;
    Ok(Json(serde_json::json!({ "transaction": record })))
}
