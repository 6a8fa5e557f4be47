//! Integration tests driving the full `/v1` router with
//! `tower::ServiceExt::oneshot`, exercising the assembled app rather
//! than individual handlers.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use mokuro_online::api::{build_router, AppState};
use mokuro_online::cache::Cache;
use mokuro_online::config::Config;
use mokuro_online::render::DefaultRenderer;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

async fn test_state() -> AppState {
    AppState::new(Config::for_tests(), Arc::new(DefaultRenderer))
        .await
        .expect("state construction")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let app = build_router(test_state().await);

    let response = app
        .oneshot(Request::builder().uri("/v1/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["cache"]["status"], "healthy");
    assert_eq!(body["checks"]["executor"]["status"], "healthy");
}

/// Scenario 1: hash-check partitions a hash set into new/queue/cached.
#[tokio::test]
async fn hash_check_partitions_new_queue_and_cached() {
    let state = test_state().await;

    let h1 = "0".repeat(31) + "1"; // md5("1") would be computed normally; any valid hash works here
    let h1 = fixed_hash(&h1);
    let h2 = fixed_hash("22222222222222222222222222222222");
    let h3 = fixed_hash("33333333333333333333333333333333");

    state.cache.set(&h1, json!({"blocks": []}), None).await.unwrap();
    let (_fut, _admitted) = state.coalescer.submit_or_join(h2.clone(), || {
        Box::pin(async {
            mokuro_online::upload::JobOutcome {
                hash: fixed_hash("22222222222222222222222222222222"),
                display_name: "x".to_string(),
                outcome: Ok(json!({})),
            }
        })
    });

    let app = build_router(state);
    let body = json!([h1.as_str(), h2.as_str(), h3.as_str()]);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/hash_check")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let result = body_json(response).await;
    assert_eq!(result["new"], json!([h3.to_string()]));
    assert_eq!(result["queue"], json!([h2.to_string()]));
}

/// Scenario 5: make_html round-trips a preloaded cache entry through
/// the default renderer.
#[tokio::test]
async fn make_html_renders_preloaded_page() {
    let state = test_state().await;
    let hash = fixed_hash("00000000000000000000000000000001");
    let result = json!({"version": "0.1.7", "img_width": 1350, "img_height": 1920, "blocks": []});
    state.cache.set(&hash, result.clone(), None).await.unwrap();

    let renderer = DefaultRenderer;
    let page_html = mokuro_online::render::Renderer::page_html(&renderer, &result, "page1.jpg");
    let expected = mokuro_online::render::Renderer::render(
        &renderer,
        &[page_html],
        "Chapter 1.1 | mokuro",
    );

    let app = build_router(state);
    let request_body = json!({
        "title": "Chapter 1.1",
        "page_map": [["page1.jpg", hash.to_string()]],
    });

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/make_html")
                .header("content-type", "application/json")
                .body(Body::from(request_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let html = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(html, expected.as_bytes());
}

#[tokio::test]
async fn make_html_reports_missing_cache_entry() {
    let state = test_state().await;
    let app = build_router(state);

    let request_body = json!({
        "title": "Chapter 1.1",
        "page_map": [["page1.jpg", "0".repeat(32)]],
    });

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/make_html")
                .header("content-type", "application/json")
                .body(Body::from(request_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

fn fixed_hash(raw: &str) -> mokuro_online::hash::PageHash {
    mokuro_online::hash::PageHash::parse(raw).unwrap()
}

#[tokio::test]
async fn hash_check_rejects_malformed_hash_with_415() {
    let app = build_router(test_state().await);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/hash_check")
                .header("content-type", "application/json")
                .body(Body::from(json!(["not-a-hash"]).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().to_lowercase().contains("hash"));
}

#[tokio::test]
async fn ocr_endpoint_reports_hits_and_misses() {
    let state = test_state().await;
    let hit = fixed_hash(&"a".repeat(32));
    let miss = fixed_hash(&"b".repeat(32));
    state.cache.set(&hit, json!({"blocks": []}), None).await.unwrap();

    let app = build_router(state);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/ocr")
                .header("content-type", "application/json")
                .body(Body::from(json!([hit.to_string(), miss.to_string()]).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ocr"][hit.to_string()], json!({"blocks": []}));
    assert_eq!(body["new"], json!([miss.to_string()]));
}

/// Scenario 4: oversize rejection via the real HTTP multipart surface.
#[tokio::test]
async fn new_pages_rejects_oversize_upload() {
    let mut config = Config::for_tests();
    config.max_image_size = 5;
    let state = AppState::new(config, Arc::new(DefaultRenderer)).await.unwrap();
    let app = build_router(state);

    let boundary = "X-TEST-BOUNDARY";
    let hash = "c".repeat(32);
    let bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"{hash}\"; filename=\"p.png\"\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: image/png\r\n\r\n");
    body.extend_from_slice(&bytes);
    body.extend_from_slice(b"\r\n");
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/new_pages")
                .header(
                    "content-type",
                    format!("multipart/form-data; boundary={boundary}"),
                )
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let events = body_json(response).await;
    let events = events.as_array().unwrap();
    assert!(events
        .iter()
        .any(|e| e[0].as_str().unwrap().to_lowercase().contains("large")));
}

/// Scenario 2: two concurrent uploads for the same hash are coalesced
/// into exactly one OCR invocation; both responses report success.
#[tokio::test]
async fn concurrent_uploads_for_same_hash_coalesce() {
    let state = AppState::new(Config::for_tests(), Arc::new(DefaultRenderer))
        .await
        .unwrap();
    let app = build_router(state);

    let boundary = "X-TEST-BOUNDARY";
    let bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 1, 1];
    let hash = mokuro_online::hash::PageHash::of_bytes(&bytes).to_string();

    let make_body = || {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{hash}\"; filename=\"p.png\"\r\n")
                .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: image/png\r\n\r\n");
        body.extend_from_slice(&bytes);
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        body
    };

    let make_request = || {
        Request::builder()
            .method("POST")
            .uri("/v1/new_pages")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(make_body()))
            .unwrap()
    };

    let (r1, r2) = tokio::join!(
        app.clone().oneshot(make_request()),
        app.clone().oneshot(make_request())
    );
    let r1 = r1.unwrap();
    let r2 = r2.unwrap();

    assert_eq!(r1.status(), StatusCode::OK);
    assert_eq!(r2.status(), StatusCode::OK);

    let events1 = body_json(r1).await;
    let events2 = body_json(r2).await;

    let has_success = |events: &Value| {
        events
            .as_array()
            .unwrap()
            .iter()
            .any(|e| e[1].as_str().unwrap() == "success")
    };
    assert!(has_success(&events1) || events1.as_array().unwrap().iter().any(|e| {
        e[0].as_str().unwrap().contains("Already have file in queue")
    }));
    assert!(has_success(&events2) || events2.as_array().unwrap().iter().any(|e| {
        e[0].as_str().unwrap().contains("Already have file in queue")
    }));
}
