//! Ops endpoints: manual guardian trigger and guardian configuration.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde_json::json;
use tracing::info;

use dfly_intake::IntakeGuardian;

use crate::auth::AuthContext;
use crate::state::AppState;

/// POST /api/v1/ops/guardian/run - run the stuck-batch check now instead of
/// waiting for the scheduled tick.
pub(crate) async fn run_guardian(
    State(app): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Response {
    info!(via = auth.via.as_str(), "guardian manual run triggered");

    let Some(pool) = app.db.pool().await else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "error",
                "checked": 0,
                "marked_failed": 0,
                "errors": ["database pool is not initialized"],
            })),
        )
            .into_response();
    };

    let guardian = IntakeGuardian::new(pool);
    let result = guardian.check_stuck_batches().await;

    Json(json!({
        "status": "ok",
        "checked": result.checked,
        "marked_failed": result.marked_failed,
        "errors": result.errors,
    }))
    .into_response()
}

/// GET /api/v1/ops/guardian/status - current guardian tunables.
pub(crate) async fn guardian_status(State(app): State<Arc<AppState>>) -> Response {
    // Config is static; report it even while the DB is down.
    let (stale_minutes, max_retries) = match app.db.pool().await {
        Some(pool) => {
            let g = IntakeGuardian::new(pool);
            (g.stale_minutes, g.max_retries)
        }
        None => (
            dfly_intake::guardian::DEFAULT_STALE_MINUTES,
            dfly_intake::guardian::DEFAULT_MAX_RETRIES,
        ),
    };

    Json(json!({
        "status": "ok",
        "stale_minutes": stale_minutes,
        "max_retries": max_retries,
    }))
    .into_response()
}
