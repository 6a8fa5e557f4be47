//! Request-id tagging, access logging and CORS.
//!
//! Stripped to the slice this service actually needs: there is no
//! authentication layer or rate limiter here (this service has no
//! auth/authz), only request-id propagation and structured logging,
//! applied ahead of every other concern.

use axum::{
    extract::Request,
    http::{header, HeaderName, HeaderValue, Method},
    middleware::Next,
    response::Response,
};
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Attach a request id to every request (reusing an inbound one if the
/// caller already supplied it) and echo it back on the response.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(request_id.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Log method, path, status and latency for every request.
pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let request_id = request
        .extensions()
        .get::<String>()
        .cloned()
        .unwrap_or_else(|| "unknown".to_string());

    tracing::info!(request_id = %request_id, method = %method, uri = %uri, "incoming request");

    let response = next.run(request).await;

    tracing::info!(
        request_id = %request_id,
        method = %method,
        uri = %uri,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}

/// Permissive CORS: the upload/query endpoints are meant to be called
/// from a browser extension and a bundled web UI, neither of which is
/// fixed to one origin.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static("x-request-id"),
        ])
        .expose_headers([HeaderName::from_static("x-request-id")])
        .max_age(Duration::from_secs(3600))
}
