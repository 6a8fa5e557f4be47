//! Router assembly.

use axum::middleware::from_fn;
use axum::routing::{get, post};
use axum::Router;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use super::handlers::{hash_check, health, make_html, new_pages, ocr};
use super::middleware::{cors_layer, request_id_middleware, request_logging_middleware};
use super::state::AppState;

/// Build the `/v1` API router plus the static front-end mount.
pub fn build_router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/health", get(health))
        .route("/hash_check", post(hash_check))
        .route("/ocr", post(ocr))
        .route("/new_pages", post(new_pages))
        .route("/make_html", post(make_html));

    Router::new()
        .nest("/v1", v1)
        .fallback_service(ServeDir::new(&state.config.static_dir).append_index_html_on_directories(true))
        .layer(from_fn(request_logging_middleware))
        .layer(from_fn(request_id_middleware))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
