use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    routing::{delete, get, post},
    Json, Router,
};
use uuid::Uuid;

use crate::{
    api::rest::to_response,
    infrastructure::{auth::AuthenticatedUser, state::AppState},
    services::{
        approvals::{ApprovalListFilter, ApprovalService, CommentRequest, ReviewRequest},
        transactions::TransactionService,
    },
};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list))
        .route("/counts", get(counts))
        .route("/:id", get(detail))
        .route("/:id/review", post(review))
        .route("/:id/comments", post(add_comment))
        .route("/:id/comments/:comment_id", delete(delete_comment))
        .route("/:id/transaction-start", post(transaction_start))
}

async fn list(
    Extension(state): Extension<Arc<AppState>>,
    user: AuthenticatedUser,
    Query(filter): Query<ApprovalListFilter>,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, Json<serde_json::Value>)> {
    let service = ApprovalService::new(state);
    let page = service.list(&user, filter).await.map_err(to_response)?;
    Ok(Json(serde_json::json!(page)))
}

async fn counts(
    Extension(state): Extension<Arc<AppState>>,
    user: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, Json<serde_json::Value>)> {
    let service = ApprovalService::new(state);
    let counts = service.counts(&user).await.map_err(to_response)?;
    Ok(Json(serde_json::json!(counts)))
}

async fn detail(
    Extension(state): Extension<Arc<AppState>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, Json<serde_json::Value>)> {
    let service = ApprovalService::new(state);
    let detail = service.detail(&user, id).await.map_err(to_response)?;
    Ok(Json(serde_json::json!(detail)))
}

async fn review(
    Extension(state): Extension<Arc<AppState>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReviewRequest>,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, Json<serde_json::Value>)> {
    let service = ApprovalService::new(state);
    let review = service
        .review(&user, id, payload)
        .await
        .map_err(to_response)?;
    Ok(Json(serde_json::json!({ "review": review })))
}

async fn add_comment(
    Extension(state): Extension<Arc<AppState>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<CommentRequest>,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, Json<serde_json::Value>)> {
    let service = ApprovalService::new(state);
    let comment = service
        .add_comment(&user, id, payload)
        .await
        .map_err(to_response)?;
    Ok(Json(serde_json::json!({ "comment": comment })))
}

async fn delete_comment(
    Extension(state): Extension<Arc<AppState>>,
    user: AuthenticatedUser,
    Path((id, comment_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, Json<serde_json::Value>)> {
    let service = ApprovalService::new(state);
    service
        .delete_comment(&user, id, comment_id)
        .await
        .map_err(to_response)?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn transaction_start(
    Extension(state): Extension<Arc<AppState>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, Json<serde_json::Value>)> {
    let service = TransactionService::new(state);
    let preview = service.start(&user, id).await.map_err(to_response)?;
    Ok(Json(serde_json::json!({
        "transaction_id": preview.transaction.id,
        "status": preview.transaction.status,
        "preview": {
            "affected_rows": preview.affected_rows,
            "duration_ms": preview.duration_ms,
            "deadline": preview.transaction.deadline,
        }
    })))
}
