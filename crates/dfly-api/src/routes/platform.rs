//! Platform endpoints: root, whoami, health, readiness, version.
//!
//! `/health` is the liveness contract: it must return 200 without touching
//! the database, even mid-lockout. `/readyz` is the gate orchestrators use
//! and returns 503 with a category-only reason until every check passes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{SecondsFormat, Utc};
use serde_json::json;

use crate::envelope::ApiEnvelope;
use crate::state::AppState;
use crate::trace::TraceId;

/// GET / - service identity. Never 503.
pub(crate) async fn root(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "service_name": app.build.service,
        "env": app.settings.dragonfly_env.as_str(),
        "sha_short": app.settings.git_sha_short(),
        "version": app.build.version,
    }))
}

/// GET /whoami - process identity for operators. The DSN identity is the
/// safe component set only; the password never appears.
pub(crate) async fn whoami(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    let dsn_identity = app.settings.database_url.as_deref().map(|dsn| {
        let c = dfly_db::dsn::extract_safe_components(dsn);
        format!(
            "{}@{}:{}/{}",
            c.user.as_deref().unwrap_or("?"),
            c.host.as_deref().unwrap_or("?"),
            c.port,
            c.dbname.as_deref().unwrap_or("?"),
        )
    });

    let ready = app.db.snapshot().await.ready;

    Json(json!({
        "service_name": app.build.service,
        "hostname": std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
        "pid": std::process::id(),
        "listening_port": app.settings.port,
        "database_ready": ready,
        "dsn_identity": dsn_identity,
    }))
}

/// GET /health and /api/health - liveness. Always 200, never touches the
/// database.
pub(crate) async fn health(
    State(app): State<Arc<AppState>>,
    Extension(trace): Extension<TraceId>,
) -> impl IntoResponse {
    let data = json!({
        "status": "ok",
        "environment": app.settings.environment,
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
    });
    Json(ApiEnvelope::ok(data, trace.as_str()))
}

/// GET /api/version - build/version report.
pub(crate) async fn version(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "git_sha": app.settings.git_sha_short(),
        "environment": app.settings.environment,
        "service": app.build.service,
        "version": app.build.version,
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
    }))
}

/// GET /readyz and /api/ready - readiness gate.
///
/// 200 only when the DB probe, the required views, the REST credential,
/// and the readiness flag all pass; otherwise 503. The failure reason is a
/// category, never an error string that could carry credential fragments.
pub(crate) async fn readyz(
    State(app): State<Arc<AppState>>,
    Extension(trace): Extension<TraceId>,
) -> Response {
    let (db_ok, _probe_msg) = app.db.check_ready(dfly_db::READINESS_CHECK_TIMEOUT).await;

    let views_ok = match app.db.pool().await {
        Some(pool) => {
            let count: Result<(i64,), _> = sqlx::query_as(
                r#"
                select count(*) from information_schema.views
                 where table_schema = 'ops'
                   and table_name in ('v_intake_monitor', 'v_system_health')
                "#,
            )
            .fetch_one(&pool)
            .await;
            matches!(count, Ok((2,)))
        }
        None => false,
    };

    let rest_ok = check_rest_credential(&app).await;

    let snapshot = app.db.snapshot().await;
    let all_ok = db_ok && views_ok && rest_ok && snapshot.ready;

    let data = json!({
        "ready": all_ok,
        "checks": {
            "database": db_ok,
            "views": views_ok,
            "rest": rest_ok,
            "db_state_ready": snapshot.ready,
        },
        "db": {
            "last_error_class": snapshot.last_error_class.map(|c| c.as_str()),
            "consecutive_failures": snapshot.consecutive_failures,
            "next_retry_in_seconds": snapshot.next_retry_in_seconds(),
            "init_attempts": snapshot.init_attempts,
        },
        "failure_reason": if all_ok { serde_json::Value::Null } else { json!("not_ready") },
    });

    if all_ok {
        (StatusCode::OK, Json(ApiEnvelope::ok(data, trace.as_str()))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiEnvelope::failed("not_ready", Some(data), trace.as_str())),
        )
            .into_response()
    }
}

/// Verify the REST source accepts our credential. Unconfigured REST is
/// treated as passing: a DB-only deployment has nothing to verify.
async fn check_rest_credential(app: &AppState) -> bool {
    let (Some(base), Some(key)) = (
        app.settings.supabase_url.as_deref(),
        app.settings.supabase_service_role_key.as_deref(),
    ) else {
        return true;
    };

    let url = format!("{}/rest/v1/", base.trim_end_matches('/'));
    match app.http.get(&url).header("apikey", key).bearer_auth(key).send().await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            status != 401 && status != 403 && status < 500
        }
        Err(_) => false,
    }
}
