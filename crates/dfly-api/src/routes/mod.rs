//! Router assembly and all HTTP handlers.
//!
//! `build_router` wires the middleware chain in spec order (outermost
//! first): trace-context injection, metrics counters, then auth on the
//! protected group. CORS and request logging are attached by `main.rs` so
//! tests can drive the bare router via `tower::ServiceExt::oneshot`.

pub mod intake;
pub mod metrics_api;
pub mod ops;
pub mod platform;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::state::SharedState;
use crate::{auth, metrics, trace};

pub fn build_router(state: SharedState) -> Router {
    let public = Router::new()
        .route("/", get(platform::root))
        .route("/whoami", get(platform::whoami))
        .route("/health", get(platform::health))
        .route("/api/health", get(platform::health))
        .route("/readyz", get(platform::readyz))
        .route("/api/ready", get(platform::readyz))
        .route("/api/version", get(platform::version));

    let protected = Router::new()
        .route("/api/v1/intake/batches", get(intake::list_batches))
        .route("/api/v1/intake/state", get(intake::intake_state))
        .route("/api/v1/intake/upload", post(intake::upload_csv))
        .route("/api/v1/intake/batches/:batch_id", get(intake::get_batch))
        .route(
            "/api/v1/intake/batches/:batch_id/errors",
            get(intake::get_batch_errors),
        )
        .route("/api/v1/ops/guardian/run", post(ops::run_guardian))
        .route("/api/v1/ops/guardian/status", get(ops::guardian_status))
        .route("/api/metrics", get(metrics_api::get_metrics))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth_middleware,
        ));

    public
        .merge(protected)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            metrics::metrics_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            trace::trace_middleware,
        ))
        .with_state(state)
}
