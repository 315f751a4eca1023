//! Failover behavior against a mock REST source served in-process.
//!
//! No database is involved: the healthy-REST path never touches the pool,
//! and the cache-error path is asserted up to the heal scheduling (the
//! direct-SQL leg fails over an absent pool, which is exactly what the
//! combined error message must report).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use dfly_data::{DataService, FetchSource};
use dfly_db::{Db, ProcessRole};

#[derive(Clone)]
struct MockBehavior {
    cache_error: bool,
}

async fn mock_view(State(b): State<Arc<MockBehavior>>) -> axum::response::Response {
    if b.cache_error {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "code": "PGRST002",
                "message": "schema cache stale",
            })),
        )
            .into_response()
    } else {
        Json(serde_json::json!([
            {"id": 1, "status": "completed"},
            {"id": 2, "status": "failed"},
        ]))
        .into_response()
    }
}

async fn spawn_mock(cache_error: bool) -> SocketAddr {
    let app = Router::new()
        .route("/rest/v1/:view", get(mock_view))
        .route("/rest/v1/:schema/:view", get(mock_view))
        .with_state(Arc::new(MockBehavior { cache_error }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

fn service_for(addr: SocketAddr) -> DataService {
    let mut settings = settings_stub();
    settings.supabase_url = Some(format!("http://{addr}"));
    settings.supabase_service_role_key = Some("service-key".to_string());
    DataService::new(&settings, Db::new(None, ProcessRole::Api))
}

fn settings_stub() -> dfly_config::Settings {
    // No env reads: construct directly so tests stay hermetic.
    dfly_config::Settings {
        database_url: None,
        supabase_url: None,
        supabase_service_role_key: None,
        supabase_anon_key: None,
        api_key: None,
        jwt_secret: None,
        cors_origins: None,
        environment: "dev".to_string(),
        dragonfly_env: dfly_config::EnvName::Dev,
        log_level: "info".to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
        git_sha: None,
    }
}

#[tokio::test]
async fn healthy_rest_returns_rows_unchanged_and_schedules_no_heal() {
    let addr = spawn_mock(false).await;
    let svc = service_for(addr);

    let result = svc
        .fetch_view_with_metadata("v_dashboard", &[], 100)
        .await
        .unwrap();

    assert_eq!(result.metadata.source, FetchSource::Rest);
    assert!(result.metadata.rest_error.is_none());
    assert!(!result.metadata.cache_reload_triggered);
    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.rows[0]["status"], "completed");
    assert_eq!(svc.cache_reload_count(), 0);
}

#[tokio::test]
async fn cache_error_schedules_exactly_one_heal_per_window() {
    let addr = spawn_mock(true).await;
    let svc = service_for(addr);

    // Both legs fail (no pool), but the combined error names both causes.
    let err = svc.fetch_view("v_dashboard", &[], 50).await.unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("PGRST002"), "missing REST cause: {msg}");
    assert!(msg.contains("DB="), "missing DB cause: {msg}");

    // The heal was scheduled once despite the failed fallback.
    assert_eq!(svc.cache_reload_count(), 1);

    // A second call inside the 30s window must not schedule another heal.
    let _ = svc.fetch_view("v_dashboard", &[], 50).await;
    assert_eq!(svc.cache_reload_count(), 1);
}

#[tokio::test]
async fn schema_qualified_views_reach_the_schema_route() {
    let addr = spawn_mock(false).await;
    let svc = service_for(addr);

    let rows = svc.fetch_view("ops.v_batch_performance", &[], 10).await.unwrap();
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn invalid_view_name_is_rejected_before_any_io() {
    let svc = service_for("127.0.0.1:9".parse().unwrap());
    let err = svc
        .fetch_view("ops.v_x; drop table judgments", &[], 10)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("invalid view name"));
}
