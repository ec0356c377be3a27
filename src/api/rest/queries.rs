use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;

use crate::{
    api::rest::to_response,
    infrastructure::{auth::AuthenticatedUser, state::AppState},
    services::queries::{
        DryRunRequest, ExplainRequest, HistoryFilter, QueryService, SubmitQueryRequest,
        ValidateRequest,
    },
};

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit))
        .route("/explain", post(explain))
        .route("/dry-run", post(dry_run))
        .route("/validate", post(validate))
        .route("/history", get(history))
        .route("/:id", get(get_query))
}

async fn submit(
    Extension(state): Extension<Arc<AppState>>,
    user: AuthenticatedUser,
    Json(payload): Json<SubmitQueryRequest>,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, Json<serde_json::Value>)> {
    let service = QueryService::new(state);
    let response = service.submit(&user, payload).await.map_err(to_response)?;
    Ok(Json(serde_json::json!(response)))
}

async fn explain(
    Extension(state): Extension<Arc<AppState>>,
    user: AuthenticatedUser,
    Json(payload): Json<ExplainRequest>,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, Json<serde_json::Value>)> {
    let service = QueryService::new(state);
    let response = service.explain(&user, payload).await.map_err(to_response)?;
    Ok(Json(serde_json::json!(response)))
}

async fn dry_run(
    Extension(state): Extension<Arc<AppState>>,
    user: AuthenticatedUser,
    Json(payload): Json<DryRunRequest>,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, Json<serde_json::Value>)> {
    let service = QueryService::new(state);
    let response = service.dry_run(&user, payload).await.map_err(to_response)?;
    Ok(Json(serde_json::json!(response)))
}

async fn validate(
    Extension(state): Extension<Arc<AppState>>,
    user: AuthenticatedUser,
    Json(payload): Json<ValidateRequest>,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, Json<serde_json::Value>)> {
    let service = QueryService::new(state);
    let response = service.validate(&user, payload).await.map_err(to_response)?;
    Ok(Json(serde_json::json!(response)))
}

async fn history(
    Extension(state): Extension<Arc<AppState>>,
    user: AuthenticatedUser,
    Query(filter): Query<HistoryFilter>,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, Json<serde_json::Value>)> {
    let service = QueryService::new(state);
    let page = service.history(&user, filter).await.map_err(to_response)?;
    Ok(Json(serde_json::json!(page)))
}

async fn get_query(
    Extension(state): Extension<Arc<AppState>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, Json<serde_json::Value>)> {
    let service = QueryService::new(state);
    let detail = service.get(&user, id).await.map_err(to_response)?;
    Ok(Json(serde_json::json!(detail)))
}
