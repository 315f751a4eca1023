//! End-to-end ingest scenarios against a real database.
//!
//! These tests need `DATABASE_URL` pointing at a disposable Postgres; when
//! it is not set they skip silently so the suite stays green on machines
//! without a database.

use std::io::Write;
use std::path::PathBuf;

use dfly_intake::{IntakeService, UploadArgs};
use sqlx::PgPool;
use uuid::Uuid;

async fn test_pool() -> Option<PgPool> {
    if std::env::var("DATABASE_URL").is_err() {
        eprintln!("DATABASE_URL not set; skipping DB-backed scenario");
        return None;
    }
    Some(dfly_db::testkit_db_pool().await.expect("test db setup failed"))
}

/// Write a CSV with 10 rows where rows 8 and 9 are missing case_number.
/// Case numbers are salted per test run so reruns do not collide.
fn write_sample_csv(dir: &tempfile::TempDir, salt: &str) -> PathBuf {
    let path = dir.path().join(format!("sample_{salt}.csv"));
    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(f, "Case #,Plaintiff,Defendant,Amount Awarded,Entry Date,County").unwrap();
    for i in 0..8 {
        writeln!(
            f,
            "{salt}-{i},Acme LLC,Debtor {i},\"$1,{i}00.50\",2024-03-0{},Kings",
            (i % 9) + 1
        )
        .unwrap();
    }
    writeln!(f, ",Acme LLC,Debtor 8,$100,2024-03-01,Kings").unwrap();
    writeln!(f, ",Acme LLC,Debtor 9,$100,2024-03-01,Kings").unwrap();
    path
}

fn args(source: &str) -> UploadArgs {
    UploadArgs {
        source: source.to_string(),
        created_by: Some("scenario-test".to_string()),
        worker_id: Some("test-worker".to_string()),
        ..UploadArgs::default()
    }
}

#[tokio::test]
async fn ten_row_file_with_two_invalid_rows_counts_correctly() {
    let Some(pool) = test_pool().await else { return };
    let service = IntakeService::new(pool.clone());

    let dir = tempfile::tempdir().unwrap();
    let salt = Uuid::new_v4().to_string()[..8].to_string();
    let path = write_sample_csv(&dir, &salt);

    let result = service.process_csv_upload(&path, &args("csv_upload")).await.unwrap();

    assert_eq!(result.total_rows, 10);
    assert_eq!(result.valid_rows, 8);
    assert_eq!(result.error_rows, 2);
    assert!(result.total_rows >= result.valid_rows + result.error_rows);

    let (status, raw, valid, invalid): (String, i32, i32, i32) = sqlx::query_as(
        "select status, row_count_raw, row_count_valid, row_count_invalid \
         from ops.ingest_batches where id = $1",
    )
    .bind(result.batch_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(status, "completed");
    assert_eq!((raw, valid, invalid), (10, 8, 2));

    let (log_count,): (i64,) =
        sqlx::query_as("select count(*) from ops.intake_logs where batch_id = $1")
            .bind(result.batch_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(log_count, 10);

    let rows: Vec<(i32, String, Option<String>)> = sqlx::query_as(
        "select row_index, status, error_code from ops.intake_logs \
         where batch_id = $1 and row_index in (8, 9) order by row_index",
    )
    .bind(result.batch_id)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(rows.len(), 2);
    for (_, status, code) in rows {
        assert_eq!(status, "error");
        assert_eq!(code.as_deref(), Some("VALIDATION_ERROR"));
    }
}

#[tokio::test]
async fn reuploading_identical_file_returns_same_batch_without_reprocessing() {
    let Some(pool) = test_pool().await else { return };
    let service = IntakeService::new(pool.clone());

    let dir = tempfile::tempdir().unwrap();
    let salt = Uuid::new_v4().to_string()[..8].to_string();
    let path = write_sample_csv(&dir, &salt);

    let first = service.process_csv_upload(&path, &args("csv_upload")).await.unwrap();
    assert!(!first.duplicate_of_existing);

    let (judgments_before,): (i64,) =
        sqlx::query_as("select count(*) from public.judgments where case_number like $1")
            .bind(format!("{salt}-%"))
            .fetch_one(&pool)
            .await
            .unwrap();

    let second = service.process_csv_upload(&path, &args("csv_upload")).await.unwrap();
    assert!(second.duplicate_of_existing);
    assert_eq!(second.batch_id, first.batch_id);
    assert_eq!(second.total_rows, 0, "duplicate upload must not reprocess rows");

    let (judgments_after,): (i64,) =
        sqlx::query_as("select count(*) from public.judgments where case_number like $1")
            .bind(format!("{salt}-%"))
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(judgments_before, judgments_after);

    // Batch counters are untouched by the duplicate upload.
    let (raw,): (i32,) =
        sqlx::query_as("select row_count_raw from ops.ingest_batches where id = $1")
            .bind(first.batch_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(raw, 10);
}

#[tokio::test]
async fn upsert_merges_non_null_fields_and_counts_duplicate_rows() {
    let Some(pool) = test_pool().await else { return };
    let service = IntakeService::new(pool.clone());

    let dir = tempfile::tempdir().unwrap();
    let salt = Uuid::new_v4().to_string()[..8].to_string();
    let case = format!("{salt}-merge");

    // First file: amount but no county.
    let p1 = dir.path().join("first.csv");
    let mut f = std::fs::File::create(&p1).unwrap();
    writeln!(f, "case_number,plaintiff,amount,county").unwrap();
    writeln!(f, "{case},Acme LLC,500,").unwrap();
    drop(f);
    service.process_csv_upload(&p1, &args("manual")).await.unwrap();

    // Second file, same case: county but null amount; plaintiff differs.
    let p2 = dir.path().join("second.csv");
    let mut f = std::fs::File::create(&p2).unwrap();
    writeln!(f, "case_number,plaintiff,amount,county").unwrap();
    writeln!(f, "{case},,,Queens").unwrap();
    drop(f);
    let second = service.process_csv_upload(&p2, &args("manual")).await.unwrap();

    // The conflict clause absorbs the second row as a successful update.
    assert_eq!(second.valid_rows, 1);

    let (plaintiff, amount, county): (Option<String>, Option<f64>, Option<String>) =
        sqlx::query_as(
            "select plaintiff_name, judgment_amount::float8, county \
             from public.judgments where case_number = $1",
        )
        .bind(&case)
        .fetch_one(&pool)
        .await
        .unwrap();

    // COALESCE semantics: nulls never clobber, non-nulls fill in.
    assert_eq!(plaintiff.as_deref(), Some("Acme LLC"));
    assert_eq!(amount, Some(500.0));
    assert_eq!(county.as_deref(), Some("Queens"));
}

#[tokio::test]
async fn row_log_overwrites_on_replay() {
    let Some(pool) = test_pool().await else { return };
    let service = IntakeService::new(pool.clone());

    let batch_id = service
        .create_batch("replay.csv", "manual", Some("test"))
        .await
        .unwrap();

    let failed = dfly_intake::IntakeResult {
        success: false,
        row_index: 0,
        judgment_id: None,
        error_code: Some("DB_ERROR"),
        error_details: Some("first attempt".to_string()),
        processing_time_ms: 5,
    };
    service.log_row_result(batch_id, &failed).await.unwrap();

    let succeeded = dfly_intake::IntakeResult {
        success: true,
        row_index: 0,
        judgment_id: None,
        error_code: None,
        error_details: None,
        processing_time_ms: 7,
    };
    service.log_row_result(batch_id, &succeeded).await.unwrap();

    let rows: Vec<(String, Option<String>)> = sqlx::query_as(
        "select status, error_code from ops.intake_logs where batch_id = $1 and row_index = 0",
    )
    .bind(batch_id)
    .fetch_all(&pool)
    .await
    .unwrap();

    assert_eq!(rows.len(), 1, "replay must overwrite, not append");
    assert_eq!(rows[0].0, "success");
    assert_eq!(rows[0].1, None);
}
