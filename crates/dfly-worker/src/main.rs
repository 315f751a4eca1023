//! dfly-worker entry point: CSV ingestion and guardian passes from the CLI.
//!
//! Exit-code contract: 0 normal, 1 generic failure, 78 when the database
//! rejected us with an auth or lockout class. Workers exit instead of
//! retrying those classes so a fleet of them cannot amplify a pooler
//! lockout; the API process is the one that rides it out in degraded mode.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use dfly_config::{EnvName, Settings};
use dfly_db::{Db, ProcessRole, EXIT_CODE_AUTH_LOCKOUT};
use dfly_heartbeat::WorkerHeartbeat;
use dfly_intake::{IntakeGuardian, IntakeService, UploadArgs, VALID_SOURCES};

const HEARTBEAT_TICK: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "dfly-worker", about = "Dragonfly ingest worker")]
struct Cli {
    /// Target environment (dev or prod). Precedence: this flag, then
    /// DRAGONFLY_ENV, then dev.
    #[arg(long, global = true, value_parser = parse_env)]
    env: Option<EnvName>,

    #[command(subcommand)]
    command: Command,
}

fn parse_env(s: &str) -> Result<EnvName, String> {
    EnvName::parse(s).map_err(|e| e.to_string())
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a CSV file into the judgments pipeline.
    Ingest {
        /// Path to the CSV file.
        #[arg(long)]
        file: PathBuf,
        /// Source system identifier.
        #[arg(long, default_value = "simplicity")]
        source: String,
        /// Operator or system label recorded on the batch.
        #[arg(long)]
        created_by: Option<String>,
        /// Resume an existing batch instead of creating one.
        #[arg(long)]
        batch_id: Option<Uuid>,
    },
    /// Run a single guardian pass over stuck batches.
    Guardian,
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let default = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.to_lowercase().into()),
        )
        .init();
}

async fn run(cli: Cli) -> Result<i32> {
    let env = dfly_config::load_environment(cli.env)?;
    let settings = Settings::from_env();
    info!(env = %env, "dfly-worker booting");

    let db = Db::new(settings.database_url.clone(), ProcessRole::Worker);
    if let Err(e) = db.connect().await {
        let snap = db.snapshot().await;
        let fatal_class = snap
            .last_error_class
            .map(|c| c.is_fatal_for_worker())
            .unwrap_or(false);
        if snap.should_exit_on_auth_failure() && fatal_class {
            // Kill-switch: one more login attempt from a retry loop is one
            // more contribution to the lockout. Stop the whole process.
            error!(
                class = snap.last_error_class.map(|c| c.as_str()).unwrap_or("unknown"),
                "fatal database error class for a worker; exiting with kill-switch code"
            );
            return Ok(EXIT_CODE_AUTH_LOCKOUT);
        }
        return Err(e);
    }
    let pool = db.require_pool().await?;

    let code = match cli.command {
        Command::Ingest {
            file,
            source,
            created_by,
            batch_id,
        } => {
            if !VALID_SOURCES.contains(&source.as_str()) {
                anyhow::bail!(
                    "invalid source '{source}'; must be one of: {}",
                    VALID_SOURCES.join(", ")
                );
            }

            let heartbeat = Arc::new(Mutex::new(WorkerHeartbeat::new(
                "ingest_processor",
                Some(pool.clone()),
            )));
            heartbeat.lock().await.startup().await;
            let worker_id = heartbeat.lock().await.worker_id.clone();

            // Keep beating while the batch runs; beat() rate-limits itself.
            let ticker = {
                let heartbeat = Arc::clone(&heartbeat);
                tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(HEARTBEAT_TICK).await;
                        heartbeat.lock().await.beat(false).await;
                    }
                })
            };

            let service = IntakeService::new(pool.clone());
            let args = UploadArgs {
                source,
                created_by,
                worker_id: Some(worker_id),
                batch_id,
                filename: None,
            };
            let outcome = service.process_csv_upload(&file, &args).await;
            ticker.abort();

            let mut hb = heartbeat.lock().await;
            match outcome {
                Ok(result) => {
                    hb.record_job_processed();
                    hb.shutdown("normal").await;
                    info!(
                        batch_id = %result.batch_id,
                        total = result.total_rows,
                        valid = result.valid_rows,
                        errors = result.error_rows,
                        duplicates = result.duplicate_rows,
                        skipped = result.skipped_rows,
                        already_ingested = result.duplicate_of_existing,
                        "ingest finished"
                    );
                    println!("{}", serde_json::json!({
                        "batch_id": result.batch_id.to_string(),
                        "total_rows": result.total_rows,
                        "valid_rows": result.valid_rows,
                        "error_rows": result.error_rows,
                        "duplicate_rows": result.duplicate_rows,
                        "skipped_rows": result.skipped_rows,
                        "duplicate_of_existing": result.duplicate_of_existing,
                    }));
                    0
                }
                Err(e) => {
                    hb.record_error(Some(&format!("{e:#}")));
                    hb.shutdown("error").await;
                    return Err(e);
                }
            }
        }
        Command::Guardian => {
            let guardian = IntakeGuardian::new(pool.clone());
            let result = guardian.check_stuck_batches().await;
            println!("{}", result.to_json());
            if result.errors.is_empty() {
                0
            } else {
                1
            }
        }
    };

    db.close().await;
    Ok(code)
}
