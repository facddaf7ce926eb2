//! Gateway error types and their HTTP mapping.
//!
//! Clients only ever see a short error kind. Details stay in the log.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use sandgate_auth::AuthError;
use sandgate_supervisor::LifecycleError;

/// Seconds a client should wait before retrying a 503.
const RETRY_AFTER_SECS: &str = "5";

/// Forwarding to the backend failed.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream connection reset: {0}")]
    UpstreamReset(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        warn!(error = %self, "proxy error");
        (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": "bad_gateway" })),
        )
            .into_response()
    }
}

/// Everything a gated request can fail with.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            GatewayError::Auth(e) => {
                debug!(error = %e, "request rejected by access gate");
                let mut resp = (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({ "error": e.kind() })),
                )
                    .into_response();
                resp.headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
                resp
            }
            GatewayError::Lifecycle(e) => {
                warn!(error = %e, "backend not available");
                let mut resp = (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "error": e.kind() })),
                )
                    .into_response();
                resp.headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
                resp
            }
            GatewayError::Proxy(e) => e.into_response(),
        }
    }
}
