use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    routing::{get, put},
    Json, Router,
};
use uuid::Uuid;

use crate::{
    api::rest::to_response,
    infrastructure::{auth::AuthenticatedUser, state::AppState},
    services::datasources::{CreateDataSourceRequest, DataSourceService, UpdateDataSourceRequest},
};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list).post(create))
        .route("/:id", put(update).delete(deactivate))
        .route("/:id/health", get(health))
}

async fn list(
    Extension(state): Extension<Arc<AppState>>,
    user: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, Json<serde_json::Value>)> {
    let service = DataSourceService::new(state);
    let items = service.list(&user).await.map_err(to_response)?;
    Ok(Json(serde_json::json!({ "data_sources": items })))
}

async fn create(
    Extension(state): Extension<Arc<AppState>>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateDataSourceRequest>,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, Json<serde_json::Value>)> {
    let service = DataSourceService::new(state);
    let summary = service.create(&user, payload).await.map_err(to_response)?;
    Ok(Json(serde_json::json!({ "data_source": summary })))
}

async fn update(
    Extension(state): Extension<Arc<AppState>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateDataSourceRequest>,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, Json<serde_json::Value>)> {
    let service = DataSourceService::new(state);
    let summary = service
        .update(&user, id, payload)
        .await
        .map_err(to_response)?;
    Ok(Json(serde_json::json!({ "data_source": summary })))
}

async fn deactivate(
    Extension(state): Extension<Arc<AppState>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, Json<serde_json::Value>)> {
    let service = DataSourceService::new(state);
    service.deactivate(&user, id).await.map_err(to_response)?;
    Ok(Json(serde_json::json!({ "deactivated": true })))
}

async fn health(
    Extension(state): Extension<Arc<AppState>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, Json<serde_json::Value>)> {
    let service = DataSourceService::new(state);
    let report = service.health(&user, id).await.map_err(to_response)?;
    Ok(Json(serde_json::json!(report)))
}
