//! Trace-context middleware.
//!
//! Reads `X-Trace-ID` from the request (distributed callers propagate it)
//! or mints a UUIDv4, stores it in the request extensions as [`TraceId`],
//! and echoes it on the response together with the identity headers
//! `X-Dragonfly-Env` and `X-Dragonfly-SHA-Short`.
//!
//! The trace id travels as an explicit extension, never a global; handlers
//! take `Extension<TraceId>` and pass it into the envelope constructors.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use crate::state::AppState;

pub const TRACE_HEADER: &str = "x-trace-id";
pub const ENV_HEADER: &str = "x-dragonfly-env";
pub const SHA_HEADER: &str = "x-dragonfly-sha-short";

/// Per-request trace identifier.
#[derive(Debug, Clone)]
pub struct TraceId(pub String);

impl TraceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub async fn trace_middleware(
    State(app): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let trace_id = req
        .headers()
        .get(TRACE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    req.extensions_mut().insert(TraceId(trace_id.clone()));

    let mut resp = next.run(req).await;

    let headers = resp.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&trace_id) {
        headers.insert(TRACE_HEADER, v);
    }
    if let Ok(v) = HeaderValue::from_str(app.settings.dragonfly_env.as_str()) {
        headers.insert(ENV_HEADER, v);
    }
    if let Ok(v) = HeaderValue::from_str(&app.settings.git_sha_short()) {
        headers.insert(SHA_HEADER, v);
    }

    resp
}
