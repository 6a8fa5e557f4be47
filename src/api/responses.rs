//! HTTP-edge error type.
//!
//! A flat `{"error": "..."}` body rather than an RFC 7807 envelope —
//! this service's wire contract has no use for problem-details fields.

use axum::body::Bytes;
use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{async_trait, Json};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;

use crate::cache::CacheError;

/// Overall / per-component health: an overall status plus a
/// per-component breakdown, trimmed of fields (timestamp,
/// response-time) this service's single `/v1/health` probe has no use
/// for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentHealth {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub checks: HashMap<String, ComponentHealth>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed request body / schema mismatch. HTTP 415.
    #[error("{0}")]
    Validation(String),

    /// A requested page was absent from the cache. HTTP 400.
    #[error("Asked for page not in cache")]
    NotInCache,

    /// Rendering failed. HTTP 400.
    #[error("{0}")]
    Render(String),

    /// Cache backend failure not covered by `ignore_errors`. HTTP 500.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Validation(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::NotInCache | ApiError::Render(_) => StatusCode::BAD_REQUEST,
            ApiError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// A `Json<T>` stand-in whose rejection is the service's own
/// `{"error": "..."}` / 415 wire contract rather than axum's default
/// `JsonRejection` body. Every structural mismatch — a body that isn't
/// valid JSON, one that parses but doesn't match `T`'s shape (wrong
/// top-level type, non-string array elements, a `page_map` entry of the
/// wrong arity) — lands on the same `ApiError::Validation` path as the
/// handlers' own hash-format checks, so §4.5's "any structural mismatch
/// yields 415" holds uniformly.
pub struct ValidatedJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::Validation(e.to_string()))?;
        let value = serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::Validation(e.to_string()))?;
        Ok(ValidatedJson(value))
    }
}
