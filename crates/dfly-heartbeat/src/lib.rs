//! Worker heartbeat: periodic "alive" emissions to logs and the worker
//! registry.
//!
//! `beat()` is cheap and safe to call on every loop iteration; internal
//! rate limits keep log lines to one per minute and registry writes to one
//! per 30 seconds. Registry writes go through the `ops.register_heartbeat`
//! security-definer function so workers do not need table-write grants.
//! A failed registry write is a warning, never a reason to stop working.

use sqlx::PgPool;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_LOG_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_DB_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Starting,
    Running,
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Running => "running",
            WorkerStatus::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub log_interval_secs: u64,
    pub db_interval_secs: u64,
    pub enable_db_writes: bool,
    pub hostname: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            log_interval_secs: DEFAULT_LOG_INTERVAL_SECS,
            db_interval_secs: DEFAULT_DB_INTERVAL_SECS,
            enable_db_writes: true,
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
        }
    }
}

pub struct WorkerHeartbeat {
    pub worker_type: String,
    pub worker_id: String,
    config: HeartbeatConfig,
    pool: Option<PgPool>,

    started_at: Instant,
    last_log_at: Option<Instant>,
    last_db_at: Option<Instant>,
    status: WorkerStatus,
    jobs_processed: u64,
    errors_count: u64,
    last_error: Option<String>,
}

impl WorkerHeartbeat {
    pub fn new(worker_type: &str, pool: Option<PgPool>) -> Self {
        Self::with_config(worker_type, pool, HeartbeatConfig::default())
    }

    pub fn with_config(worker_type: &str, pool: Option<PgPool>, config: HeartbeatConfig) -> Self {
        let short = Uuid::new_v4().to_string().chars().take(8).collect::<String>();
        WorkerHeartbeat {
            worker_type: worker_type.to_string(),
            worker_id: format!("{worker_type}-{short}"),
            config,
            pool,
            started_at: Instant::now(),
            last_log_at: None,
            last_db_at: None,
            status: WorkerStatus::Starting,
            jobs_processed: 0,
            errors_count: 0,
            last_error: None,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn set_status(&mut self, status: WorkerStatus) {
        self.status = status;
    }

    pub fn record_job_processed(&mut self) {
        self.jobs_processed += 1;
    }

    pub fn record_error(&mut self, message: Option<&str>) {
        self.errors_count += 1;
        self.last_error = message.map(|m| m.chars().take(200).collect());
    }

    /// Emit a heartbeat if an interval has elapsed (or `force`).
    pub async fn beat(&mut self, force: bool) {
        if self.status == WorkerStatus::Starting {
            self.status = WorkerStatus::Running;
        }

        let now = Instant::now();

        let log_due = match self.last_log_at {
            None => true,
            Some(t) => now.duration_since(t).as_secs() >= self.config.log_interval_secs,
        };
        if force || log_due {
            self.emit_log_heartbeat();
            self.last_log_at = Some(now);
        }

        if self.config.enable_db_writes {
            let db_due = match self.last_db_at {
                None => true,
                Some(t) => now.duration_since(t).as_secs() >= self.config.db_interval_secs,
            };
            if force || db_due {
                self.emit_db_heartbeat().await;
                self.last_db_at = Some(now);
            }
        }
    }

    fn emit_log_heartbeat(&self) {
        info!(
            worker_id = %self.worker_id,
            worker_type = %self.worker_type,
            status = self.status.as_str(),
            uptime_m = self.uptime_secs() / 60,
            jobs = self.jobs_processed,
            errors = self.errors_count,
            last_error = self.last_error.as_deref().unwrap_or(""),
            hostname = %self.config.hostname,
            "worker heartbeat"
        );
    }

    async fn emit_db_heartbeat(&self) {
        let Some(pool) = &self.pool else { return };

        let result = sqlx::query("select ops.register_heartbeat($1, $2, $3, $4)")
            .bind(&self.worker_id)
            .bind(&self.worker_type)
            .bind(&self.config.hostname)
            .bind(self.status.as_str())
            .execute(pool)
            .await;

        if let Err(e) = result {
            warn!(
                worker_id = %self.worker_id,
                error = %e,
                "failed to write DB heartbeat"
            );
        }
    }

    /// Emit the initial heartbeat on worker startup.
    pub async fn startup(&mut self) {
        self.status = WorkerStatus::Starting;
        self.beat(true).await;
        info!(worker_id = %self.worker_id, "worker started");
    }

    /// Emit the final heartbeat on worker shutdown.
    pub async fn shutdown(&mut self, reason: &str) {
        self.status = WorkerStatus::Stopped;
        if self.config.enable_db_writes {
            self.emit_db_heartbeat().await;
        }
        info!(
            worker_id = %self.worker_id,
            reason,
            uptime_s = self.uptime_secs(),
            jobs = self.jobs_processed,
            errors = self.errors_count,
            "worker stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet(worker_type: &str) -> WorkerHeartbeat {
        WorkerHeartbeat::with_config(
            worker_type,
            None,
            HeartbeatConfig {
                log_interval_secs: 60,
                db_interval_secs: 30,
                enable_db_writes: false,
                hostname: "test-host".to_string(),
            },
        )
    }

    #[test]
    fn worker_id_is_type_prefixed_with_uuid_suffix() {
        let hb = quiet("ingest_processor");
        assert!(hb.worker_id.starts_with("ingest_processor-"));
        let suffix = hb.worker_id.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
    }

    #[tokio::test]
    async fn beat_transitions_starting_to_running() {
        let mut hb = quiet("w");
        assert_eq!(hb.status(), WorkerStatus::Starting);
        hb.beat(false).await;
        assert_eq!(hb.status(), WorkerStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn log_heartbeat_is_rate_limited() {
        let mut hb = quiet("w");
        hb.beat(false).await;
        let first = hb.last_log_at.unwrap();

        // Within the interval: no new log emission.
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        hb.beat(false).await;
        assert_eq!(hb.last_log_at.unwrap(), first);

        // Past the interval: emission timestamp advances.
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        hb.beat(false).await;
        assert!(hb.last_log_at.unwrap() > first);
    }

    #[tokio::test]
    async fn counters_track_jobs_and_errors() {
        let mut hb = quiet("w");
        hb.record_job_processed();
        hb.record_job_processed();
        hb.record_error(Some(&"e".repeat(500)));
        assert_eq!(hb.jobs_processed, 2);
        assert_eq!(hb.errors_count, 1);
        assert_eq!(hb.last_error.as_ref().unwrap().len(), 200);
    }

    #[tokio::test]
    async fn heartbeat_without_pool_never_panics() {
        let mut hb = quiet("w");
        hb.startup().await;
        hb.beat(true).await;
        hb.shutdown("normal").await;
        assert_eq!(hb.status(), WorkerStatus::Stopped);
    }
}
