//! `/v1` request handlers.
//!
//! Each handler stays thin: parse and validate the request shape, hand
//! the real work to the module that owns it (cache, coalescer, upload
//! pipeline, renderer), and map the result onto the wire contract.

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use crate::cache::Cache;
use crate::hash::PageHash;
use crate::upload::ProgressEvent;

use super::responses::{ApiError, ComponentHealth, HealthResponse, HealthStatus, ValidatedJson};
use super::state::AppState;

/// Liveness/readiness probe: overall status plus a per-component
/// breakdown. The cache is probed with a cheap `has` lookup; the
/// executor has no observable failure mode short of a panicked worker,
/// so it reports healthy unconditionally.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let probe_hash = PageHash::parse(&"0".repeat(32)).expect("valid literal hash");
    let cache_check = match state.cache.has(&probe_hash).await {
        Ok(_) => ComponentHealth::healthy(),
        Err(e) => ComponentHealth::unhealthy(e.to_string()),
    };
    let overall = if matches!(cache_check.status, HealthStatus::Healthy) {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unhealthy
    };

    let mut checks = std::collections::HashMap::new();
    checks.insert("cache".to_string(), cache_check);
    checks.insert("executor".to_string(), ComponentHealth::healthy());

    Json(HealthResponse {
        status: overall,
        version: crate::VERSION.to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        checks,
    })
}

fn parse_hashes(raw: &[String]) -> Result<Vec<PageHash>, ApiError> {
    raw.iter()
        .map(|h| PageHash::parse(h).map_err(|e| ApiError::Validation(e.to_string())))
        .collect()
}

/// `POST /v1/hash_check` — partition a set of hashes into "needs
/// upload" and "currently in flight". Cached hashes are silently
/// dropped from both lists per the contract.
pub async fn hash_check(
    State(state): State<AppState>,
    ValidatedJson(raw): ValidatedJson<Vec<String>>,
) -> Result<Json<Value>, ApiError> {
    let hashes = parse_hashes(&raw)?;

    // Coalescer membership is checked per-hash (an in-memory map lookup
    // with no round-trip cost); the cache check for everything not
    // already in flight goes through `has_many` in one round trip.
    let mut new = Vec::new();
    let mut queue = Vec::new();
    let mut uncached_candidates = Vec::new();

    for hash in hashes {
        if state.coalescer.contains(&hash) {
            queue.push(hash.to_string());
        } else {
            uncached_candidates.push(hash);
        }
    }

    let cached = state.cache.has_many(&uncached_candidates).await?;
    for (hash, is_cached) in uncached_candidates.into_iter().zip(cached) {
        if !is_cached {
            new.push(hash.to_string());
        }
    }

    Ok(Json(json!({ "new": new, "queue": queue })))
}

/// `POST /v1/ocr` — fetch cached OCR results for a hash set, reporting
/// misses separately rather than erroring on them.
pub async fn ocr(
    State(state): State<AppState>,
    ValidatedJson(raw): ValidatedJson<Vec<String>>,
) -> Result<Json<Value>, ApiError> {
    let hashes = parse_hashes(&raw)?;

    let mut ocr = serde_json::Map::new();
    let mut new = Vec::new();

    let results = state.cache.get_many(&hashes).await?;
    for (hash, result) in hashes.into_iter().zip(results) {
        match result {
            Some(value) => {
                ocr.insert(hash.to_string(), value);
            }
            None => new.push(hash.to_string()),
        }
    }

    Ok(Json(json!({ "ocr": Value::Object(ocr), "new": new })))
}

#[derive(Debug, Deserialize)]
pub struct NewPagesQuery {
    #[serde(default)]
    stream: u8,
}

/// `POST /v1/new_pages?stream=<0|1>` — drive the upload pipeline and
/// return its progress events either as a buffered JSON array or as a
/// newline-delimited stream, per the `stream` flag.
pub async fn new_pages(
    State(state): State<AppState>,
    Query(query): Query<NewPagesQuery>,
    multipart: axum::extract::Multipart,
) -> Response {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<ProgressEvent>();
    let pipeline = state.upload_pipeline();

    tokio::spawn(async move {
        pipeline.run(multipart, tx).await;
    });

    if query.stream == 1 {
        let body_stream = UnboundedReceiverStream::new(rx).map(|event| {
            let line = serde_json::to_string(&(event.0, category_str(&event.1)))
                .unwrap_or_else(|_| "[]".to_string());
            Ok::<_, std::convert::Infallible>(format!("{line}\n"))
        });

        let body = axum::body::Body::from_stream(body_stream);
        Response::builder()
            .header(axum::http::header::CONTENT_TYPE, "application/jsonlines")
            .body(body)
            .unwrap()
    } else {
        let mut events = Vec::new();
        let mut rx = rx;
        while let Some(event) = rx.recv().await {
            events.push((event.0, category_str(&event.1)));
        }
        Json(events).into_response()
    }
}

fn category_str(category: &crate::upload::Category) -> &'static str {
    match category {
        crate::upload::Category::Info => "info",
        crate::upload::Category::Success => "success",
        crate::upload::Category::Warning => "warning",
        crate::upload::Category::Error => "error",
    }
}

#[derive(Debug, Deserialize)]
pub struct MakeHtmlRequest {
    title: String,
    page_map: Vec<(String, String)>,
}

/// `POST /v1/make_html` — render every page named in `page_map` from
/// its cached OCR result, in the order supplied.
pub async fn make_html(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<MakeHtmlRequest>,
) -> Result<Response, ApiError> {
    let title = request.title.trim().to_string();

    let mut rendered_pages = Vec::with_capacity(request.page_map.len());
    for (path, raw_hash) in &request.page_map {
        let path = path.trim();
        let hash = PageHash::parse(raw_hash.trim())
            .map_err(|e| ApiError::Validation(e.to_string()))?;

        let result = state
            .cache
            .get(&hash)
            .await?
            .ok_or(ApiError::NotInCache)?;

        rendered_pages.push(state.renderer.page_html(&result, path));
    }

    let document_title = format!("{title} | mokuro");
    let html = state.renderer.render(&rendered_pages, &document_title);

    Ok((
        [(axum::http::header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
        .into_response())
}
