//! In-memory request/error counters and the middleware that feeds them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::state::AppState;

/// Process-local vital signs.
#[derive(Debug)]
pub struct Metrics {
    requests_total: AtomicU64,
    errors_total: AtomicU64,
    started_at: DateTime<Utc>,
    started_instant: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            requests_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            started_at: Utc::now(),
            started_instant: Instant::now(),
        }
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn errors_total(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_instant.elapsed().as_secs()
    }

    pub fn started_at_rfc3339(&self) -> String {
        self.started_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

/// Count every request; count 5xx responses as errors.
pub async fn metrics_middleware(
    State(app): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    app.metrics.record_request();
    let resp = next.run(req).await;
    if resp.status().is_server_error() {
        app.metrics.record_error();
    }
    resp
}
