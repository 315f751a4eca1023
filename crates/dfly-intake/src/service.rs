//! Chunked, idempotent, error-isolating CSV batch pipeline.
//!
//! Every row runs inside its own transaction and produces exactly one
//! `ops.intake_logs` entry keyed by `(batch_id, row_index)`; a replay
//! overwrites the prior entry. Batch bookkeeping lives in
//! `ops.ingest_batches`, and completed files are recorded in
//! `ops.ingest_ledger` keyed by `(filename, content hash)` so re-uploads
//! of identical files short-circuit to the original batch.

use std::io::Read;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::columns::{HeaderMap, RowData};
use crate::parse::{clean_text, parse_amount, parse_date};

/// Rows per chunk for memory efficiency.
pub const CHUNK_SIZE: usize = 500;

/// Abort the batch once this many rows fail back to back.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 100;

const ERROR_DETAIL_MAX: usize = 500;

/// Error taxonomy recorded in the row log.
pub mod error_code {
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const DUPLICATE: &str = "DUPLICATE";
    pub const VALIDATION_SKIPPED: &str = "VALIDATION_SKIPPED";
    pub const DB_ERROR: &str = "DB_ERROR";
    pub const BATCH_ERROR: &str = "BATCH_ERROR";
}

/// Accepted batch sources.
pub const VALID_SOURCES: &[&str] = &["simplicity", "jbi", "foil", "manual", "csv_upload", "api"];

/// Outcome of processing one row.
#[derive(Debug, Clone)]
pub struct IntakeResult {
    pub success: bool,
    pub row_index: i32,
    pub judgment_id: Option<Uuid>,
    pub error_code: Option<&'static str>,
    pub error_details: Option<String>,
    pub processing_time_ms: i32,
}

impl IntakeResult {
    fn failure(row_index: i32, code: &'static str, details: String, started: Instant) -> Self {
        IntakeResult {
            success: false,
            row_index,
            judgment_id: None,
            error_code: Some(code),
            error_details: Some(truncate(&details, ERROR_DETAIL_MAX)),
            processing_time_ms: started.elapsed().as_millis() as i32,
        }
    }

    /// Status string stored in `ops.intake_logs`.
    pub fn log_status(&self) -> &'static str {
        if self.success {
            return "success";
        }
        match self.error_code {
            Some(error_code::DUPLICATE) => "duplicate",
            Some(error_code::VALIDATION_SKIPPED) => "skipped",
            _ => "error",
        }
    }
}

/// Aggregate result of one batch run.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub batch_id: Uuid,
    pub total_rows: i32,
    pub valid_rows: i32,
    pub error_rows: i32,
    pub duplicate_rows: i32,
    pub skipped_rows: i32,
    pub duration_seconds: f64,
    pub errors: Vec<serde_json::Value>,
    /// True when the upload matched the ledger and nothing was reprocessed.
    pub duplicate_of_existing: bool,
}

impl BatchResult {
    pub fn new(batch_id: Uuid) -> Self {
        BatchResult {
            batch_id,
            total_rows: 0,
            valid_rows: 0,
            error_rows: 0,
            duplicate_rows: 0,
            skipped_rows: 0,
            duration_seconds: 0.0,
            errors: Vec::new(),
            duplicate_of_existing: false,
        }
    }

    fn stats_json(&self, content_sha256: &str) -> serde_json::Value {
        json!({
            "total": self.total_rows,
            "valid": self.valid_rows,
            "error": self.error_rows,
            "duplicates": self.duplicate_rows,
            "skipped": self.skipped_rows,
            "duration_seconds": self.duration_seconds,
            "content_sha256": content_sha256,
            "errors": self.errors,
        })
    }
}

/// Arguments for one upload run.
#[derive(Debug, Clone, Default)]
pub struct UploadArgs {
    pub source: String,
    pub created_by: Option<String>,
    pub worker_id: Option<String>,
    /// Reuse an existing batch row (API upload pre-creates it) instead of
    /// creating one. Ledger dedupe is skipped in that case.
    pub batch_id: Option<Uuid>,
    /// Logical filename for bookkeeping and the ledger key. Defaults to the
    /// on-disk name; API uploads pass the original upload name because the
    /// file has been spooled to a temp path.
    pub filename: Option<String>,
}

/// Intake processing service.
pub struct IntakeService {
    pool: PgPool,
}

impl IntakeService {
    pub fn new(pool: PgPool) -> Self {
        IntakeService { pool }
    }

    /// Create a new batch row in `pending`.
    pub async fn create_batch(
        &self,
        filename: &str,
        source: &str,
        created_by: Option<&str>,
    ) -> Result<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            insert into ops.ingest_batches (filename, source, status, created_by, stats)
            values ($1, $2, 'pending', $3, '{}'::jsonb)
            returning id
            "#,
        )
        .bind(filename)
        .bind(source)
        .bind(created_by)
        .fetch_one(&self.pool)
        .await
        .context("create_batch failed")?;
        Ok(id)
    }

    /// Transition pending -> processing and claim the batch for a worker.
    pub async fn start_batch(&self, batch_id: Uuid, worker_id: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            update ops.ingest_batches
               set status = 'processing',
                   started_at = now(),
                   worker_id = $2
             where id = $1
            "#,
        )
        .bind(batch_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .context("start_batch failed")?;
        Ok(())
    }

    /// Write the aggregate counts and move the batch to a terminal status.
    pub async fn finalize_batch(
        &self,
        batch_id: Uuid,
        result: &BatchResult,
        status: &str,
        content_sha256: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            update ops.ingest_batches
               set status = $2,
                   row_count_raw = $3,
                   row_count_valid = $4,
                   row_count_invalid = $5,
                   completed_at = now(),
                   stats = $6
             where id = $1
            "#,
        )
        .bind(batch_id)
        .bind(status)
        .bind(result.total_rows)
        .bind(result.valid_rows)
        .bind(result.error_rows)
        .bind(result.stats_json(content_sha256))
        .execute(&self.pool)
        .await
        .context("finalize_batch failed")?;
        Ok(())
    }

    /// Upsert one row-log entry. `(batch_id, row_index)` is unique, so a
    /// replay of the same row supersedes the previous outcome.
    pub async fn log_row_result(&self, batch_id: Uuid, r: &IntakeResult) -> Result<()> {
        sqlx::query(
            r#"
            insert into ops.intake_logs (
                batch_id, row_index, status, judgment_id,
                error_code, error_details, processing_time_ms
            ) values ($1, $2, $3, $4, $5, $6, $7)
            on conflict (batch_id, row_index) do update set
                status = excluded.status,
                judgment_id = excluded.judgment_id,
                error_code = excluded.error_code,
                error_details = excluded.error_details,
                processing_time_ms = excluded.processing_time_ms
            "#,
        )
        .bind(batch_id)
        .bind(r.row_index)
        .bind(r.log_status())
        .bind(r.judgment_id)
        .bind(r.error_code)
        .bind(&r.error_details)
        .bind(r.processing_time_ms)
        .execute(&self.pool)
        .await
        .context("log_row_result failed")?;
        Ok(())
    }

    /// Look up a prior completed batch for this exact file content.
    pub async fn find_ledger_batch(
        &self,
        filename: &str,
        content_sha256: &str,
    ) -> Result<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            select batch_id
              from ops.ingest_ledger
             where filename = $1
               and content_sha256 = $2
            "#,
        )
        .bind(filename)
        .bind(content_sha256)
        .fetch_optional(&self.pool)
        .await
        .context("ingest ledger lookup failed")?;
        Ok(row.map(|(id,)| id))
    }

    async fn record_ledger(&self, filename: &str, content_sha256: &str, batch_id: Uuid) {
        let res = sqlx::query(
            r#"
            insert into ops.ingest_ledger (filename, content_sha256, batch_id)
            values ($1, $2, $3)
            on conflict (filename, content_sha256) do nothing
            "#,
        )
        .bind(filename)
        .bind(content_sha256)
        .bind(batch_id)
        .execute(&self.pool)
        .await;
        if let Err(e) = res {
            warn!(%batch_id, error = %e, "failed to record ingest ledger entry");
        }
    }

    /// Process a single row: validate, upsert the judgment, fire downstream.
    ///
    /// Runs inside its own transaction so one bad row cannot poison its
    /// neighbors.
    pub async fn process_row(
        &self,
        row: &RowData,
        row_index: i32,
        source_batch: &str,
    ) -> IntakeResult {
        let started = Instant::now();

        let Some(case_number) = clean_text(row.get("case_number")) else {
            return IntakeResult::failure(
                row_index,
                error_code::VALIDATION_ERROR,
                "Missing required field: case_number".to_string(),
                started,
            );
        };

        let judgment_amount = match parse_amount(row.get("judgment_amount")) {
            Ok(v) => v,
            Err(e) => {
                return IntakeResult::failure(
                    row_index,
                    error_code::VALIDATION_ERROR,
                    e.to_string(),
                    started,
                );
            }
        };

        let plaintiff_name = clean_text(row.get("plaintiff_name"));
        let defendant_name = clean_text(row.get("defendant_name"));
        let entry_date = parse_date(row.get("judgment_date"));
        let court = clean_text(row.get("court"));
        let county = clean_text(row.get("county"));

        let upsert = async {
            let mut tx = self.pool.begin().await?;
            let row: (Uuid, bool) = sqlx::query_as(
                r#"
                insert into public.judgments (
                    case_number, plaintiff_name, defendant_name, judgment_amount,
                    entry_date, source_file, court, county, created_at, updated_at
                ) values ($1, $2, $3, $4, $5, $6, $7, $8, now(), now())
                on conflict (case_number) do update set
                    plaintiff_name  = coalesce(excluded.plaintiff_name, judgments.plaintiff_name),
                    defendant_name  = coalesce(excluded.defendant_name, judgments.defendant_name),
                    judgment_amount = coalesce(excluded.judgment_amount, judgments.judgment_amount),
                    entry_date      = coalesce(excluded.entry_date, judgments.entry_date),
                    court           = coalesce(excluded.court, judgments.court),
                    county          = coalesce(excluded.county, judgments.county),
                    updated_at      = now()
                returning id, (xmax = 0) as inserted
                "#,
            )
            .bind(&case_number)
            .bind(&plaintiff_name)
            .bind(&defendant_name)
            .bind(judgment_amount)
            .bind(entry_date)
            .bind(source_batch)
            .bind(&court)
            .bind(&county)
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok::<(Uuid, bool), sqlx::Error>(row)
        };

        let (judgment_id, was_inserted) = match upsert.await {
            Ok(r) => r,
            Err(e) => {
                if is_unique_violation(&e) {
                    return IntakeResult::failure(
                        row_index,
                        error_code::DUPLICATE,
                        format!("duplicate case_number: {case_number}"),
                        started,
                    );
                }
                return IntakeResult::failure(
                    row_index,
                    error_code::DB_ERROR,
                    e.to_string(),
                    started,
                );
            }
        };

        // Downstream hooks fire only for fresh inserts and never fail the row.
        if was_inserted {
            if let Err(e) = self.queue_enrichment(judgment_id).await {
                warn!(%judgment_id, error = %e, "enrichment queue failed");
            }
            if let Err(e) = self.touch_graph(judgment_id).await {
                warn!(%judgment_id, error = %e, "graph update failed");
            }
        }

        IntakeResult {
            success: true,
            row_index,
            judgment_id: Some(judgment_id),
            error_code: None,
            error_details: None,
            processing_time_ms: started.elapsed().as_millis() as i32,
        }
    }

    /// Queue an enrichment job for a freshly inserted judgment.
    async fn queue_enrichment(&self, judgment_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            insert into ops.job_queue (job_type, status, payload)
            values ('enrichment', 'pending', $1)
            "#,
        )
        .bind(json!({ "judgment_id": judgment_id }))
        .execute(&self.pool)
        .await
        .context("enrichment enqueue failed")?;
        Ok(())
    }

    /// Touch the entity graph for a freshly inserted judgment.
    async fn touch_graph(&self, judgment_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            insert into ops.job_queue (job_type, status, payload)
            values ('graph_update', 'pending', $1)
            "#,
        )
        .bind(json!({ "judgment_id": judgment_id }))
        .execute(&self.pool)
        .await
        .context("graph enqueue failed")?;
        Ok(())
    }

    /// Process a CSV upload end to end.
    ///
    /// Idempotency: when no explicit batch id is supplied and the ledger
    /// already holds `(filename, content hash)` from a completed batch, the
    /// prior batch id is returned with `duplicate_of_existing` set and no
    /// rows are touched.
    pub async fn process_csv_upload(&self, file_path: &Path, args: &UploadArgs) -> Result<BatchResult> {
        let started = Instant::now();

        let content_sha256 = sha256_file(file_path)
            .with_context(|| format!("hashing {} failed", file_path.display()))?;
        let filename = args.filename.clone().unwrap_or_else(|| {
            file_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "unknown.csv".to_string())
        });

        if args.batch_id.is_none() {
            if let Some(existing) = self.find_ledger_batch(&filename, &content_sha256).await? {
                info!(batch_id = %existing, filename = %filename, "identical file already ingested; skipping");
                let mut result = BatchResult::new(existing);
                result.duplicate_of_existing = true;
                return Ok(result);
            }
        }

        let batch_id = match args.batch_id {
            Some(id) => id,
            None => {
                self.create_batch(&filename, &args.source, args.created_by.as_deref())
                    .await?
            }
        };
        self.start_batch(batch_id, args.worker_id.as_deref()).await?;

        let source_batch = format!("{}:{}", args.source, batch_id);
        let mut result = BatchResult::new(batch_id);

        match self
            .run_pipeline(file_path, batch_id, &source_batch, &mut result)
            .await
        {
            Ok(completed) => {
                result.duration_seconds = started.elapsed().as_secs_f64();
                let status = if completed { "completed" } else { "failed" };
                self.finalize_batch(batch_id, &result, status, &content_sha256)
                    .await?;
                if completed {
                    self.record_ledger(&filename, &content_sha256, batch_id).await;
                }
                info!(
                    %batch_id,
                    status,
                    total = result.total_rows,
                    valid = result.valid_rows,
                    errors = result.error_rows,
                    duplicates = result.duplicate_rows,
                    duration_s = result.duration_seconds,
                    "batch finished"
                );
                Ok(result)
            }
            Err(e) => {
                // Whole-batch failure: preserve stats to date and record the
                // batch-level error under row index -1.
                result.duration_seconds = started.elapsed().as_secs_f64();
                let msg = truncate(&format!("{e:#}"), ERROR_DETAIL_MAX);
                result.errors.push(json!({
                    "row": -1,
                    "code": error_code::BATCH_ERROR,
                    "message": msg,
                }));
                let batch_err = IntakeResult {
                    success: false,
                    row_index: -1,
                    judgment_id: None,
                    error_code: Some(error_code::BATCH_ERROR),
                    error_details: Some(msg),
                    processing_time_ms: started.elapsed().as_millis() as i32,
                };
                if let Err(log_err) = self.log_row_result(batch_id, &batch_err).await {
                    warn!(%batch_id, error = %log_err, "failed to log batch error");
                }
                if let Err(fin_err) = self
                    .finalize_batch(batch_id, &result, "failed", &content_sha256)
                    .await
                {
                    warn!(%batch_id, error = %fin_err, "failed to finalize failed batch");
                }
                Err(e)
            }
        }
    }

    /// Inner pipeline: returns `Ok(true)` for a completed batch, `Ok(false)`
    /// for a runaway abort, `Err` for a batch-level failure.
    async fn run_pipeline(
        &self,
        file_path: &Path,
        batch_id: Uuid,
        source_batch: &str,
        result: &mut BatchResult,
    ) -> Result<bool> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(file_path)
            .with_context(|| format!("open {} failed", file_path.display()))?;

        let header_map = HeaderMap::build(
            &reader
                .headers()
                .context("reading CSV header row failed")?
                .clone(),
        );

        let mut consecutive_errors: u32 = 0;
        let mut chunk: Vec<(i32, Result<RowData, String>)> = Vec::with_capacity(CHUNK_SIZE);
        let mut row_index: i32 = 0;
        let mut chunk_index: u32 = 0;

        let mut records = reader.into_records();
        loop {
            let item = records.next();
            let done = item.is_none();
            match item {
                Some(Ok(record)) => {
                    chunk.push((row_index, Ok(header_map.project(&record))));
                    row_index += 1;
                }
                Some(Err(e)) => {
                    chunk.push((row_index, Err(format!("malformed CSV record: {e}"))));
                    row_index += 1;
                }
                None => {}
            }

            let flush = chunk.len() >= CHUNK_SIZE || (done && !chunk.is_empty());
            if flush {
                chunk_index += 1;
                info!(%batch_id, chunk = chunk_index, rows = chunk.len(), "processing chunk");
                let aborted = self
                    .process_chunk(
                        batch_id,
                        source_batch,
                        std::mem::take(&mut chunk),
                        result,
                        &mut consecutive_errors,
                    )
                    .await?;
                if aborted {
                    return Ok(false);
                }
            }

            if done {
                break;
            }
        }

        Ok(true)
    }

    /// Returns `Ok(true)` when the consecutive-error threshold aborted the
    /// batch.
    async fn process_chunk(
        &self,
        batch_id: Uuid,
        source_batch: &str,
        chunk: Vec<(i32, Result<RowData, String>)>,
        result: &mut BatchResult,
        consecutive_errors: &mut u32,
    ) -> Result<bool> {
        for (idx, parsed) in chunk {
            result.total_rows += 1;

            let row_result = match parsed {
                Err(details) => IntakeResult::failure(
                    idx,
                    error_code::VALIDATION_ERROR,
                    details,
                    Instant::now(),
                ),
                Ok(row) if row.is_blank() => IntakeResult::failure(
                    idx,
                    error_code::VALIDATION_SKIPPED,
                    "blank row".to_string(),
                    Instant::now(),
                ),
                Ok(row) => self.process_row(&row, idx, source_batch).await,
            };

            self.log_row_result(batch_id, &row_result).await?;

            if row_result.success {
                result.valid_rows += 1;
                *consecutive_errors = 0;
            } else {
                match row_result.error_code {
                    Some(error_code::DUPLICATE) => {
                        result.duplicate_rows += 1;
                        *consecutive_errors = 0;
                    }
                    Some(error_code::VALIDATION_SKIPPED) => {
                        result.skipped_rows += 1;
                    }
                    _ => {
                        result.error_rows += 1;
                        *consecutive_errors += 1;
                        result.errors.push(json!({
                            "row": row_result.row_index,
                            "code": row_result.error_code,
                            "message": row_result.error_details,
                        }));
                    }
                }
            }

            if *consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                tracing::error!(
                    %batch_id,
                    consecutive = *consecutive_errors,
                    "aborting batch: consecutive error threshold reached"
                );
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Streaming SHA-256 of a file, hex encoded.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
