use std::sync::Arc;

use axum::{
    http::{HeaderValue, Method, StatusCode},
    Json, Router,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::infrastructure::config::{Config, CorsConfig};

use self::rest::router as rest_router;

pub mod rest;

pub fn build_router(config: Arc<Config>) -> Router {
    Router::new()
        .nest("/api", rest_router())
        .fallback(not_found)
        .layer(build_cors(&config.cors))
        .layer(TraceLayer::new_for_http())
}

fn build_cors(config: &CorsConfig) -> CorsLayer {
    if config.allowed_origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "ignoring malformed CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any)
}

pub async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": {"kind": "NotFound", "message": "no such route"}})),
    )
}
