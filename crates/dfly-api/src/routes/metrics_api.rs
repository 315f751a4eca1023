//! GET /api/metrics - process counters plus cheap DB-derived sections.
//!
//! The in-memory portion always renders; each DB-derived section degrades
//! to an empty value independently, so a dead database never breaks the
//! metrics feed.

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde_json::{json, Value};
use sqlx::PgPool;

use crate::envelope::ApiEnvelope;
use crate::state::AppState;
use crate::trace::TraceId;

pub(crate) async fn get_metrics(
    State(app): State<Arc<AppState>>,
    Extension(trace): Extension<TraceId>,
) -> Response {
    let process = json!({
        "requests_total": app.metrics.requests_total(),
        "errors_total": app.metrics.errors_total(),
        "uptime_seconds": app.metrics.uptime_seconds(),
        "started_at": app.metrics.started_at_rfc3339(),
        "service": app.build.service,
        "version": app.build.version,
    });

    let (pool_stats, queues, workers, ingest) = match app.db.pool().await {
        Some(pool) => (
            json!({
                "size": pool.size(),
                "idle": pool.num_idle(),
            }),
            queue_stats(&pool).await,
            worker_heartbeats(&pool).await,
            ingest_backlog(&pool).await,
        ),
        None => (json!({}), json!({}), json!([]), json!({})),
    };

    let data = json!({
        "process": process,
        "pool": pool_stats,
        "queues": queues,
        "workers": workers,
        "ingest": ingest,
        "database_ready": app.db.snapshot().await.ready,
    });

    Json(ApiEnvelope::ok(data, trace.as_str())).into_response()
}

async fn queue_stats(pool: &PgPool) -> Value {
    let rows: Result<Vec<(String, i64)>, _> = sqlx::query_as(
        "select status, count(*) from ops.job_queue group by status",
    )
    .fetch_all(pool)
    .await;

    match rows {
        Ok(rows) => {
            let mut out = serde_json::Map::new();
            for (status, count) in rows {
                out.insert(status, json!(count));
            }
            Value::Object(out)
        }
        Err(_) => json!({}),
    }
}

async fn worker_heartbeats(pool: &PgPool) -> Value {
    let rows: Result<Vec<Value>, _> = sqlx::query_scalar(
        r#"
        select jsonb_build_object(
                   'worker_id', worker_id,
                   'worker_type', worker_type,
                   'status', status,
                   'last_seen_at', last_seen_at)
          from ops.worker_heartbeats
         order by last_seen_at desc
         limit 10
        "#,
    )
    .fetch_all(pool)
    .await;

    match rows {
        Ok(rows) => json!(rows),
        Err(_) => json!([]),
    }
}

async fn ingest_backlog(pool: &PgPool) -> Value {
    let row: Result<(i64, i64, i64), _> = sqlx::query_as(
        r#"
        select
            count(*) filter (where status = 'pending'),
            count(*) filter (where status = 'processing'),
            count(*) filter (where status = 'failed' and created_at > now() - interval '24 hours')
        from ops.ingest_batches
        "#,
    )
    .fetch_one(pool)
    .await;

    match row {
        Ok((pending, processing, failed_24h)) => json!({
            "pending": pending,
            "processing": processing,
            "failed_24h": failed_24h,
        }),
        Err(_) => json!({}),
    }
}
