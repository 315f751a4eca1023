// crates/dfly-db/src/lib.rs
//! Database layer: DSN sanitization, readiness state, resilient pool
//! initialization, readiness probe, and the reconnection supervisor.
//!
//! The central type is [`Db`]: it owns the (optional) pool plus the shared
//! readiness state, and is handed around as `Arc<Db>`.  A missing DSN is
//! not an error here; the state is marked `no_config` and the process keeps
//! running so `/health` stays green.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use rand::Rng;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{error, info, warn};

pub mod classify;
pub mod dsn;
pub mod state;
pub mod supervisor;

pub use classify::{backoff_delay, classify_db_error};
pub use dsn::{ensure_sslmode, sanitize_dsn, sanitize_dsn_lenient, DsnComponents, DsnError, SanitizedDsn};
pub use state::{
    detect_process_role, DbReadinessState, ErrorClass, ProcessRole, EXIT_CODE_AUTH_LOCKOUT,
};
pub use supervisor::{DbSupervisor, RETRY_SAFETY_MARGIN};

pub const ENV_DB_URL: &str = "DATABASE_URL";

/// Pool initialization retry budget.
const MAX_RETRY_ATTEMPTS: u32 = 6;
const MAX_TOTAL_WAIT: Duration = Duration::from_secs(60);
const INIT_BASE_DELAY_S: f64 = 1.0;

/// Default timeout for the readiness probe's `SELECT 1`.
pub const READINESS_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

const POOL_MIN_CONNECTIONS: u32 = 2;
const POOL_MAX_CONNECTIONS: u32 = 10;

/// Pool application name, alphanumerics and underscores only.
///
/// Load-bearing: spaces or dots in `application_name` break the pooler's
/// option parsing ("invalid command-line argument"), which surfaces as an
/// auth-shaped connect failure.
pub fn application_name() -> String {
    let safe: String = env!("CARGO_PKG_VERSION")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("dragonfly_v{safe}")
}

/// Shared database handle: optional pool + readiness state.
pub struct Db {
    dsn: Option<String>,
    state: Arc<RwLock<DbReadinessState>>,
    pool: RwLock<Option<PgPool>>,
}

pub type SharedDb = Arc<Db>;

impl Db {
    /// Build the handle. A `None` DSN immediately marks `no_config`.
    pub fn new(dsn: Option<String>, role: ProcessRole) -> SharedDb {
        let mut st = DbReadinessState::new(role);
        if dsn.is_none() {
            st.mark_no_config();
        }
        Arc::new(Db {
            dsn,
            state: Arc::new(RwLock::new(st)),
            pool: RwLock::new(None),
        })
    }

    /// Handle to the readiness state (shared with the supervisor).
    pub fn state_handle(&self) -> Arc<RwLock<DbReadinessState>> {
        Arc::clone(&self.state)
    }

    /// Cloned point-in-time snapshot of the readiness state.
    pub async fn snapshot(&self) -> DbReadinessState {
        self.state.read().await.clone()
    }

    pub async fn pool(&self) -> Option<PgPool> {
        self.pool.read().await.clone()
    }

    pub async fn require_pool(&self) -> Result<PgPool> {
        self.pool()
            .await
            .ok_or_else(|| anyhow!("database pool is not initialized"))
    }

    /// Initialize the connection pool with bounded retries.
    ///
    /// Up to 6 attempts inside a 60 second wall budget, exponential jittered
    /// delays between attempts, `SELECT 1` verification. Success calls
    /// `mark_connected`; exhaustion classifies the final error, schedules
    /// the backoff window via `mark_failed`, and returns the error.
    pub async fn connect(&self) -> Result<()> {
        if self.pool.read().await.is_some() {
            return Ok(());
        }

        let Some(raw_dsn) = self.dsn.as_deref() else {
            self.state.write().await.mark_no_config();
            bail!("DATABASE_URL not configured");
        };

        let sanitized = match dsn::sanitize_dsn(Some(raw_dsn)) {
            Ok(s) => s,
            Err(e) => {
                // Malformed DSN is a config problem, not a transient one:
                // no retry schedule, readiness stays red until it is fixed.
                let msg = format!("DSN sanitization failed: {e}");
                error!(components = ?e.components(), "{msg}");
                let mut st = self.state.write().await;
                st.mark_no_config();
                st.last_error = Some(state::truncate(&msg, 500));
                return Err(anyhow!(msg));
            }
        };

        if sanitized.stripped_leading || sanitized.stripped_trailing {
            warn!(
                original_length = sanitized.original_length,
                sanitized_length = sanitized.sanitized_length,
                "DSN edge whitespace stripped"
            );
        }

        let dsn = dsn::ensure_sslmode(&sanitized.dsn);
        let components = dsn::extract_safe_components(&dsn);
        let app_name = application_name();
        info!(%components, app_name = %app_name, "database connection parameters");

        let opts = match PgConnectOptions::from_str(&dsn) {
            Ok(o) => o.application_name(&app_name),
            Err(e) => {
                let msg = format!("DSN rejected by driver: {e}");
                let mut st = self.state.write().await;
                st.mark_no_config();
                st.last_error = Some(state::truncate(&msg, 500));
                return Err(anyhow!(msg));
            }
        };

        let started = Instant::now();
        let mut last_error: Option<String> = None;

        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            if started.elapsed() >= MAX_TOTAL_WAIT {
                warn!(
                    elapsed_s = started.elapsed().as_secs(),
                    "DB pool init: time budget exhausted"
                );
                break;
            }

            {
                let mut st = self.state.write().await;
                st.init_attempts += 1;
            }
            info!(attempt, max = MAX_RETRY_ATTEMPTS, "DB pool init attempt");

            match try_open(&opts).await {
                Ok(pool) => {
                    *self.pool.write().await = Some(pool);
                    self.state.write().await.mark_connected(started.elapsed());
                    return Ok(());
                }
                Err(e) => {
                    let msg = format!("{e:#}");
                    warn!(attempt, error = %msg, "DB pool init attempt failed");
                    last_error = Some(msg);

                    if attempt < MAX_RETRY_ATTEMPTS {
                        let base = INIT_BASE_DELAY_S * 2f64.powi(attempt as i32 - 1);
                        let jitter = rand::thread_rng().gen_range(0.0..=base * 0.3);
                        let remaining = MAX_TOTAL_WAIT.saturating_sub(started.elapsed());
                        let delay = Duration::from_secs_f64(base + jitter).min(remaining);
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }

        let err_msg = last_error
            .unwrap_or_else(|| "DB pool init: time budget exhausted before first attempt".to_string());
        let class = classify_db_error(&err_msg);
        let failures = self.state.read().await.consecutive_failures;
        let delay = backoff_delay(failures, class);
        self.state.write().await.mark_failed(&err_msg, class, delay);

        Err(anyhow!(
            "failed to initialize database pool after {MAX_RETRY_ATTEMPTS} attempts \
             ({:.1}s): {err_msg}",
            started.elapsed().as_secs_f64()
        ))
    }

    /// Readiness probe: `SELECT 1` under a timeout.
    ///
    /// Updates `healthy` (and `last_error` on failure) but never touches
    /// `ready`; only the pool initializer decides readiness.
    pub async fn check_ready(&self, timeout: Duration) -> (bool, String) {
        let Some(pool) = self.pool().await else {
            let st = self.state.read().await;
            let msg = st
                .last_error
                .clone()
                .unwrap_or_else(|| "pool not initialized".to_string());
            return (false, msg);
        };

        let started = Instant::now();
        let probe = sqlx::query_as::<_, (i32,)>("select 1").fetch_one(&pool);

        match tokio::time::timeout(timeout, probe).await {
            Ok(Ok((1,))) => {
                let mut st = self.state.write().await;
                st.healthy = true;
                st.last_error = None;
                (true, format!("ok ({}ms)", started.elapsed().as_millis()))
            }
            Ok(Ok((n,))) => {
                self.mark_unhealthy(format!("SELECT 1 returned {n}")).await;
                (false, format!("unexpected_result: {n}"))
            }
            Ok(Err(e)) => {
                let short = state::truncate(&e.to_string(), 100);
                self.mark_unhealthy(short.clone()).await;
                (false, format!("error: {short}"))
            }
            Err(_) => {
                self.mark_unhealthy(format!("query timeout ({}s)", timeout.as_secs_f64()))
                    .await;
                (false, format!("timeout ({}s)", timeout.as_secs_f64()))
            }
        }
    }

    /// Probe failure bookkeeping. `last_error` is only recorded while not
    /// ready, preserving the invariant that a ready state carries no error.
    async fn mark_unhealthy(&self, message: String) {
        let mut st = self.state.write().await;
        st.healthy = false;
        if !st.ready {
            st.last_error = Some(message);
        }
    }

    /// Close the pool on graceful shutdown.
    pub async fn close(&self) {
        if let Some(pool) = self.pool.write().await.take() {
            info!("closing PostgreSQL connection pool");
            pool.close().await;
        }
        let mut st = self.state.write().await;
        st.initialized = false;
        st.healthy = false;
    }

    /// Create and start a supervisor driving `Db::connect`.
    pub async fn start_supervisor(self: &Arc<Self>) -> Arc<DbSupervisor> {
        let sup = Arc::new(DbSupervisor::new(self.state_handle()));
        let db = Arc::clone(self);
        sup.start(move || {
            let db = Arc::clone(&db);
            async move {
                let _ = db.connect().await;
            }
        })
        .await;
        sup
    }
}

async fn try_open(opts: &PgConnectOptions) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .min_connections(POOL_MIN_CONNECTIONS)
        .max_connections(POOL_MAX_CONNECTIONS)
        .connect_with(opts.clone())
        .await
        .context("pool connect failed")?;

    let (one,): (i32,) = sqlx::query_as("select 1")
        .fetch_one(&pool)
        .await
        .context("SELECT 1 verification failed")?;
    if one != 1 {
        bail!("SELECT 1 did not return the expected result");
    }

    Ok(pool)
}

/// Connect to Postgres using `DATABASE_URL` (test/tool helper; production
/// code goes through [`Db`]).
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Run embedded SQLx migrations (schemas, tables, views, stored ops).
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Test helper: connect via `DATABASE_URL` and ensure migrations applied.
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_name_has_no_shell_significant_chars() {
        let name = application_name();
        assert!(name.starts_with("dragonfly_v"));
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }

    #[tokio::test]
    async fn db_without_dsn_boots_in_no_config() {
        let db = Db::new(None, ProcessRole::Api);
        let snap = db.snapshot().await;
        assert!(!snap.ready);
        assert_eq!(snap.last_error_class, Some(ErrorClass::NoConfig));
        assert!(snap.next_retry_at.is_none());

        assert!(db.connect().await.is_err());
        assert!(db.pool().await.is_none());
    }

    #[tokio::test]
    async fn db_with_malformed_dsn_marks_no_config_without_retry() {
        let db = Db::new(Some("\"postgresql://u:p@h/db\"".to_string()), ProcessRole::Api);
        assert!(db.connect().await.is_err());
        let snap = db.snapshot().await;
        assert_eq!(snap.last_error_class, Some(ErrorClass::NoConfig));
        assert!(snap.last_error.as_ref().unwrap().contains("sanitization"));
        assert!(snap.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn check_ready_without_pool_reports_not_initialized() {
        let db = Db::new(None, ProcessRole::Api);
        let (ok, msg) = db.check_ready(READINESS_CHECK_TIMEOUT).await;
        assert!(!ok);
        assert!(msg.contains("not configured") || msg.contains("not initialized"));
    }
}
