//! Intake endpoints: upload, batch listing, batch detail, error log, state.
//!
//! The listing and state endpoints are UI-critical: they apply the
//! degrade-guard pattern and never surface a 5xx to the dashboard. Upload
//! returns immediately with a batch id and processes in the background.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::Row;
use tracing::{error, info, warn};
use uuid::Uuid;

use dfly_intake::{IntakeService, UploadArgs, VALID_SOURCES};

use crate::envelope::ApiEnvelope;
use crate::state::AppState;
use crate::trace::TraceId;

// ---------------------------------------------------------------------------
// Response models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub id: String,
    pub filename: String,
    pub source: String,
    pub status: String,
    pub total_rows: i32,
    pub valid_rows: i32,
    pub error_rows: i32,
    pub success_rate: f64,
    pub duration_seconds: Option<f64>,
    pub health_status: String,
    pub created_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchListData {
    pub batches: Vec<BatchSummary>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeStateData {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub total_batches: i64,
    pub last_batch_at: Option<String>,
    pub queue_depth: i64,
    pub checked_at: String,
}

// ---------------------------------------------------------------------------
// Derived fields
// ---------------------------------------------------------------------------

/// Success rate in percent, 0 when the batch is empty.
pub fn success_rate(total: i32, valid: i32) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    (valid as f64 / total as f64 * 10_000.0).round() / 100.0
}

/// Derive the operator-facing health classification for a batch.
///
/// `failed` is always critical; error-bearing batches degrade by success
/// rate (under 80% critical, under 95% warning).
pub fn health_status(status: &str, total: i32, valid: i32, errors: i32) -> &'static str {
    if status == "failed" {
        return "critical";
    }
    let rate = success_rate(total, valid);
    if errors > 0 && rate < 80.0 {
        "critical"
    } else if errors > 0 && rate < 95.0 {
        "warning"
    } else {
        "healthy"
    }
}

fn ts(t: chrono::DateTime<chrono::Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

// ---------------------------------------------------------------------------
// GET /api/v1/intake/batches
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct BatchListQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
    pub status: Option<String>,
}

fn default_page() -> i64 {
    1
}
fn default_page_size() -> i64 {
    20
}

pub(crate) async fn list_batches(
    State(app): State<Arc<AppState>>,
    Extension(trace): Extension<TraceId>,
    Query(q): Query<BatchListQuery>,
) -> Response {
    let page = q.page.max(1);
    let page_size = q.page_size.clamp(1, 100);

    match list_batches_inner(&app, page, page_size, q.status.as_deref()).await {
        Ok(data) => Json(ApiEnvelope::ok(data, trace.as_str())).into_response(),
        Err(e) => {
            // Degrade guard: never 500 toward the dashboard.
            error!(trace_id = trace.as_str(), error = %format!("{e:#}"), "list_batches degraded");
            let empty = BatchListData {
                batches: Vec::new(),
                total: 0,
                page,
                page_size,
            };
            Json(ApiEnvelope::degraded(&format!("{e:#}"), Some(empty), trace.as_str()))
                .into_response()
        }
    }
}

async fn list_batches_inner(
    app: &AppState,
    page: i64,
    page_size: i64,
    status: Option<&str>,
) -> Result<BatchListData> {
    let pool = app.db.require_pool().await?;

    if let Some(s) = status {
        if !matches!(s, "pending" | "processing" | "completed" | "failed") {
            anyhow::bail!("invalid status filter: {s}");
        }
    }

    let where_clause = if status.is_some() { " where status = $1" } else { "" };

    let total: i64 = {
        let sql = format!("select count(*) from ops.ingest_batches{where_clause}");
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        if let Some(s) = status {
            query = query.bind(s);
        }
        query.fetch_one(&pool).await.context("batch count failed")?
    };

    // Base table only: no joins, no views, maximum availability.
    let sql = format!(
        r#"
        select id, filename, source, status,
               row_count_raw, row_count_valid, row_count_invalid,
               created_at, started_at, completed_at
          from ops.ingest_batches{where_clause}
         order by created_at desc
         limit ${} offset ${}
        "#,
        if status.is_some() { 2 } else { 1 },
        if status.is_some() { 3 } else { 2 },
    );

    let mut query = sqlx::query(&sql);
    if let Some(s) = status {
        query = query.bind(s);
    }
    query = query.bind(page_size).bind((page - 1) * page_size);

    let rows = query.fetch_all(&pool).await.context("batch page query failed")?;

    let mut batches = Vec::with_capacity(rows.len());
    for row in rows {
        let total_rows: i32 = row.try_get("row_count_raw")?;
        let valid_rows: i32 = row.try_get("row_count_valid")?;
        let error_rows: i32 = row.try_get("row_count_invalid")?;
        let status: String = row.try_get("status")?;
        let started_at: Option<chrono::DateTime<chrono::Utc>> = row.try_get("started_at")?;
        let completed_at: Option<chrono::DateTime<chrono::Utc>> = row.try_get("completed_at")?;

        let duration_seconds = match (started_at, completed_at) {
            (Some(s), Some(c)) => Some(((c - s).num_milliseconds() as f64 / 10.0).round() / 100.0),
            _ => None,
        };

        batches.push(BatchSummary {
            id: row.try_get::<Uuid, _>("id")?.to_string(),
            filename: row
                .try_get::<Option<String>, _>("filename")?
                .unwrap_or_else(|| "unknown".to_string()),
            source: row.try_get("source")?,
            health_status: health_status(&status, total_rows, valid_rows, error_rows).to_string(),
            success_rate: success_rate(total_rows, valid_rows),
            status,
            total_rows,
            valid_rows,
            error_rows,
            duration_seconds,
            created_at: ts(row.try_get("created_at")?),
            completed_at: completed_at.map(ts),
        });
    }

    Ok(BatchListData {
        batches,
        total,
        page,
        page_size,
    })
}

// ---------------------------------------------------------------------------
// GET /api/v1/intake/state
// ---------------------------------------------------------------------------

pub(crate) async fn intake_state(
    State(app): State<Arc<AppState>>,
    Extension(trace): Extension<TraceId>,
) -> Response {
    let checked_at = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true);

    match intake_state_inner(&app, &checked_at).await {
        Ok(data) => Json(ApiEnvelope::ok(data, trace.as_str())).into_response(),
        Err(e) => {
            warn!(trace_id = trace.as_str(), error = %format!("{e:#}"), "intake_state degraded");
            let empty = IntakeStateData {
                pending: 0,
                processing: 0,
                completed: 0,
                failed: 0,
                total_batches: 0,
                last_batch_at: None,
                queue_depth: 0,
                checked_at,
            };
            Json(ApiEnvelope::degraded(&format!("{e:#}"), Some(empty), trace.as_str()))
                .into_response()
        }
    }
}

async fn intake_state_inner(app: &AppState, checked_at: &str) -> Result<IntakeStateData> {
    let pool = app.db.require_pool().await?;

    let row = sqlx::query(
        r#"
        select
            count(*) filter (where status = 'pending')    as pending,
            count(*) filter (where status = 'processing') as processing,
            count(*) filter (where status = 'completed')  as completed,
            count(*) filter (where status = 'failed')     as failed,
            count(*)                                      as total,
            max(created_at)                               as last_batch_at
        from ops.ingest_batches
        "#,
    )
    .fetch_one(&pool)
    .await
    .context("batch aggregate query failed")?;

    // ops.job_queue may not exist in a fresh schema; fall back gracefully.
    let queue_depth: i64 =
        sqlx::query_scalar("select count(*) from ops.job_queue where status = 'pending'")
            .fetch_one(&pool)
            .await
            .unwrap_or(0);

    Ok(IntakeStateData {
        pending: row.try_get("pending")?,
        processing: row.try_get("processing")?,
        completed: row.try_get("completed")?,
        failed: row.try_get("failed")?,
        total_batches: row.try_get("total")?,
        last_batch_at: row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>("last_batch_at")?
            .map(ts),
        queue_depth,
        checked_at: checked_at.to_string(),
    })
}

// ---------------------------------------------------------------------------
// POST /api/v1/intake/upload
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_source() -> String {
    "simplicity".to_string()
}

fn is_permission_error(message: &str) -> bool {
    let msg = message.to_ascii_lowercase();
    ["row-level security", "row level security", "rls policy", "permission denied", "insufficient_privilege", "42501"]
        .iter()
        .any(|kw| msg.contains(kw))
}

fn upload_error(status: StatusCode, error: &str, message: String) -> Response {
    (status, Json(json!({ "error": error, "message": message }))).into_response()
}

pub(crate) async fn upload_csv(
    State(app): State<Arc<AppState>>,
    Extension(auth): Extension<crate::auth::AuthContext>,
    Query(q): Query<UploadQuery>,
    mut multipart: Multipart,
) -> Response {
    if !VALID_SOURCES.contains(&q.source.as_str()) {
        return upload_error(
            StatusCode::BAD_REQUEST,
            "invalid_source",
            format!("Invalid source: {}. Must be one of: {}", q.source, VALID_SOURCES.join(", ")),
        );
    }

    // Pull the file part out of the multipart body.
    let (filename, bytes) = loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("file") => {
                let Some(filename) = field.file_name().map(|f| f.to_string()) else {
                    return upload_error(
                        StatusCode::BAD_REQUEST,
                        "missing_filename",
                        "No filename provided".to_string(),
                    );
                };
                match field.bytes().await {
                    Ok(bytes) => break (filename, bytes),
                    Err(e) => {
                        return upload_error(
                            StatusCode::BAD_REQUEST,
                            "unreadable_upload",
                            format!("Failed to read uploaded file: {e}"),
                        );
                    }
                }
            }
            Ok(Some(_)) => continue,
            Ok(None) => {
                return upload_error(
                    StatusCode::BAD_REQUEST,
                    "missing_file",
                    "Multipart field 'file' is required".to_string(),
                );
            }
            Err(e) => {
                return upload_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_multipart",
                    format!("Invalid multipart body: {e}"),
                );
            }
        }
    };

    if !filename.to_ascii_lowercase().ends_with(".csv") {
        return upload_error(
            StatusCode::BAD_REQUEST,
            "invalid_extension",
            "File must be a CSV".to_string(),
        );
    }

    info!(via = auth.via.as_str(), filename = %filename, source = %q.source, "intake upload started");

    let pool = match app.db.pool().await {
        Some(p) => p,
        None => {
            return upload_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "database_unavailable",
                "Database pool is not initialized".to_string(),
            );
        }
    };

    // Spool the body to a temp file the background task will consume.
    let tmp_path: PathBuf = match spool_to_tempfile(&q.source, &bytes) {
        Ok(p) => p,
        Err(e) => {
            return upload_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "spool_failed",
                format!("Failed to save uploaded file: {e}"),
            );
        }
    };

    let service = IntakeService::new(pool);
    let created_by = auth.subject.clone().unwrap_or_else(|| auth.via.as_str().to_string());

    // Idempotency: identical content under the same filename maps back to
    // the original batch and is never reprocessed.
    match dfly_intake::sha256_file(&tmp_path) {
        Ok(content_sha256) => {
            match service.find_ledger_batch(&filename, &content_sha256).await {
                Ok(Some(existing)) => {
                    let _ = std::fs::remove_file(&tmp_path);
                    info!(batch_id = %existing, filename = %filename, "duplicate upload; returning original batch");
                    return (
                        StatusCode::OK,
                        Json(json!({
                            "batch_id": existing.to_string(),
                            "status": "duplicate",
                            "message": format!("File '{filename}' was already ingested; returning the original batch"),
                        })),
                    )
                        .into_response();
                }
                Ok(None) => {}
                Err(e) => warn!(error = %format!("{e:#}"), "ingest ledger lookup failed; proceeding"),
            }
        }
        Err(e) => warn!(error = %format!("{e:#}"), "content hash failed; proceeding without dedupe"),
    }

    let batch_id = match service.create_batch(&filename, &q.source, Some(&created_by)).await {
        Ok(id) => id,
        Err(e) => {
            let _ = std::fs::remove_file(&tmp_path);
            let msg = format!("{e:#}");
            let status = if is_permission_error(&msg) {
                StatusCode::FORBIDDEN
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            return upload_error(status, "batch_create_failed", msg);
        }
    };

    // Process in the background; the response returns immediately.
    let args = UploadArgs {
        source: q.source.clone(),
        created_by: Some(created_by),
        worker_id: Some(format!("api-background-{batch_id}")),
        batch_id: Some(batch_id),
        filename: Some(filename.clone()),
    };
    tokio::spawn(async move {
        let outcome = service.process_csv_upload(&tmp_path, &args).await;
        match outcome {
            Ok(result) => info!(
                %batch_id,
                valid = result.valid_rows,
                total = result.total_rows,
                "background processing complete"
            ),
            Err(e) => error!(%batch_id, error = %format!("{e:#}"), "background processing failed"),
        }
        if let Err(e) = std::fs::remove_file(&tmp_path) {
            warn!(path = %tmp_path.display(), error = %e, "failed to delete temp upload");
        }
    });

    (
        StatusCode::OK,
        Json(json!({
            "batch_id": batch_id.to_string(),
            "status": "processing",
            "message": format!("File '{filename}' accepted; processing started"),
        })),
    )
        .into_response()
}

fn spool_to_tempfile(source: &str, bytes: &[u8]) -> Result<PathBuf> {
    use std::io::Write;
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!("intake_{source}_"))
        .suffix(".csv")
        .tempfile()
        .context("create temp file")?;
    tmp.write_all(bytes).context("write temp file")?;
    let (_file, path) = tmp.keep().context("persist temp file")?;
    Ok(path)
}

// ---------------------------------------------------------------------------
// GET /api/v1/intake/batches/:batch_id
// ---------------------------------------------------------------------------

pub(crate) async fn get_batch(
    State(app): State<Arc<AppState>>,
    Extension(trace): Extension<TraceId>,
    Path(batch_id): Path<Uuid>,
) -> Response {
    match get_batch_inner(&app, batch_id).await {
        Ok(Some(data)) => Json(ApiEnvelope::ok(data, trace.as_str())).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "Batch not found" })),
        )
            .into_response(),
        Err(e) => Json(ApiEnvelope::<serde_json::Value>::degraded(
            &format!("{e:#}"),
            None,
            trace.as_str(),
        ))
        .into_response(),
    }
}

async fn get_batch_inner(app: &AppState, batch_id: Uuid) -> Result<Option<serde_json::Value>> {
    let pool = app.db.require_pool().await?;

    // The monitor view is consumed by column name, never position.
    let row = sqlx::query(
        r#"
        select id, filename, source, status,
               total_rows, valid_rows, error_rows,
               success_rate::float8 as success_rate,
               duration_seconds::float8 as duration_seconds,
               error_summary, stats,
               created_at, started_at, completed_at, created_by, worker_id
          from ops.v_intake_monitor
         where id = $1
        "#,
    )
    .bind(batch_id)
    .fetch_optional(&pool)
    .await
    .context("batch detail query failed")?;

    let Some(row) = row else { return Ok(None) };

    let stats: serde_json::Value = row.try_get("stats")?;
    let status: String = row.try_get("status")?;
    let total_rows: i32 = row.try_get("total_rows")?;
    let valid_rows: i32 = row.try_get("valid_rows")?;
    let error_rows: i32 = row.try_get("error_rows")?;

    let recent_errors: Vec<serde_json::Value> = sqlx::query_scalar(
        r#"
        select jsonb_build_object(
                   'row_index', row_index,
                   'error_code', error_code,
                   'error_details', error_details,
                   'created_at', created_at)
          from ops.intake_logs
         where batch_id = $1 and status in ('error', 'skipped')
         order by created_at desc
         limit 5
        "#,
    )
    .bind(batch_id)
    .fetch_all(&pool)
    .await
    .unwrap_or_default();

    Ok(Some(json!({
        "id": row.try_get::<Uuid, _>("id")?.to_string(),
        "filename": row.try_get::<Option<String>, _>("filename")?,
        "source": row.try_get::<String, _>("source")?,
        "status": status,
        "total_rows": total_rows,
        "valid_rows": valid_rows,
        "error_rows": error_rows,
        "duplicate_rows": stats.get("duplicates").and_then(|v| v.as_i64()).unwrap_or(0),
        "skipped_rows": stats.get("skipped").and_then(|v| v.as_i64()).unwrap_or(0),
        "success_rate": row.try_get::<Option<f64>, _>("success_rate")?.unwrap_or(0.0),
        "duration_seconds": row.try_get::<Option<f64>, _>("duration_seconds")?,
        "health_status": health_status(&status, total_rows, valid_rows, error_rows),
        "error_summary": row.try_get::<Option<String>, _>("error_summary")?,
        "stats": stats,
        "created_at": ts(row.try_get("created_at")?),
        "started_at": row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>("started_at")?.map(ts),
        "completed_at": row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>("completed_at")?.map(ts),
        "created_by": row.try_get::<Option<String>, _>("created_by")?,
        "worker_id": row.try_get::<Option<String>, _>("worker_id")?,
        "recent_errors": recent_errors,
    })))
}

// ---------------------------------------------------------------------------
// GET /api/v1/intake/batches/:batch_id/errors
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ErrorLogQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_error_page_size")]
    pub page_size: i64,
}

fn default_error_page_size() -> i64 {
    50
}

pub(crate) async fn get_batch_errors(
    State(app): State<Arc<AppState>>,
    Extension(trace): Extension<TraceId>,
    Path(batch_id): Path<Uuid>,
    Query(q): Query<ErrorLogQuery>,
) -> Response {
    let page = q.page.max(1);
    let page_size = q.page_size.clamp(1, 200);

    match get_batch_errors_inner(&app, batch_id, page, page_size).await {
        Ok(Some(data)) => Json(ApiEnvelope::ok(data, trace.as_str())).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "Batch not found" })),
        )
            .into_response(),
        Err(e) => Json(ApiEnvelope::<serde_json::Value>::degraded(
            &format!("{e:#}"),
            None,
            trace.as_str(),
        ))
        .into_response(),
    }
}

async fn get_batch_errors_inner(
    app: &AppState,
    batch_id: Uuid,
    page: i64,
    page_size: i64,
) -> Result<Option<serde_json::Value>> {
    let pool = app.db.require_pool().await?;

    let exists: Option<i32> = sqlx::query_scalar("select 1 from ops.ingest_batches where id = $1")
        .bind(batch_id)
        .fetch_optional(&pool)
        .await
        .context("batch existence check failed")?;
    if exists.is_none() {
        return Ok(None);
    }

    let total: i64 = sqlx::query_scalar(
        "select count(*) from ops.intake_logs where batch_id = $1 and status in ('error', 'skipped')",
    )
    .bind(batch_id)
    .fetch_one(&pool)
    .await
    .context("error log count failed")?;

    let errors: Vec<serde_json::Value> = sqlx::query_scalar(
        r#"
        select jsonb_build_object(
                   'row_index', row_index,
                   'status', status,
                   'error_code', error_code,
                   'error_details', error_details,
                   'judgment_id', judgment_id,
                   'created_at', created_at)
          from ops.intake_logs
         where batch_id = $1 and status in ('error', 'skipped')
         order by row_index asc nulls first
         limit $2 offset $3
        "#,
    )
    .bind(batch_id)
    .bind(page_size)
    .bind((page - 1) * page_size)
    .fetch_all(&pool)
    .await
    .context("error log page query failed")?;

    Ok(Some(json!({
        "batch_id": batch_id.to_string(),
        "errors": errors,
        "total": total,
        "page": page,
        "page_size": page_size,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_rounds_to_two_decimals() {
        assert_eq!(success_rate(0, 0), 0.0);
        assert_eq!(success_rate(10, 8), 80.0);
        assert_eq!(success_rate(3, 1), 33.33);
    }

    #[test]
    fn health_status_thresholds() {
        // Failed batches are always critical, even with perfect rates.
        assert_eq!(health_status("failed", 10, 10, 0), "critical");
        // Clean batches are healthy.
        assert_eq!(health_status("completed", 10, 10, 0), "healthy");
        // Success rate in [80, 95) with errors: warning.
        assert_eq!(health_status("completed", 10, 8, 2), "warning");
        assert_eq!(health_status("completed", 100, 94, 6), "warning");
        // Under 80: critical.
        assert_eq!(health_status("completed", 10, 7, 3), "critical");
        // Errors but rate at/above 95: healthy.
        assert_eq!(health_status("completed", 100, 99, 1), "healthy");
    }

    #[test]
    fn permission_errors_detected() {
        assert!(is_permission_error("new row violates row-level security policy"));
        assert!(is_permission_error("ERROR: permission denied for table ingest_batches"));
        assert!(is_permission_error("sqlstate 42501 insufficient_privilege"));
        assert!(!is_permission_error("connection refused"));
    }
}
