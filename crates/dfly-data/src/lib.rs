// crates/dfly-data/src/lib.rs
//! Unified resilient data access for dashboard reads.
//!
//! Pattern: try the REST source first, heal it when it reports a schema
//! cache problem, and fall back to direct SQL. A user-critical read is
//! never blocked on REST health.
//!
//! Pool protection: the direct-SQL leg takes a semaphore permit (capacity
//! 5) before touching the pool, so a dashboard stampede cannot starve the
//! ingest workers of connections. The heal (`NOTIFY pgrst`) is
//! fire-and-forget and rate-limited to one attempt per 30 seconds.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use sqlx::Connection;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use dfly_config::Settings;
use dfly_db::SharedDb;

pub const MAX_CONCURRENT_FALLBACK_QUERIES: usize = 5;
pub const CACHE_RELOAD_MIN_INTERVAL: Duration = Duration::from_secs(30);

/// PostgREST error codes that indicate a stale schema cache.
pub const PGRST_CACHE_ERRORS: &[&str] = &["PGRST002", "PGRST116"];
const RETRIABLE_STATUS: &[u16] = &[502, 503, 504];

const REST_TOTAL_TIMEOUT: Duration = Duration::from_secs(30);
const REST_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const NOTIFY_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a fetch was ultimately served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Rest,
    DirectDb,
}

impl FetchSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchSource::Rest => "rest",
            FetchSource::DirectDb => "direct_db",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchMetadata {
    pub source: FetchSource,
    pub latency_ms: f64,
    pub cache_reload_triggered: bool,
    pub rest_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DataServiceResult {
    pub rows: Vec<serde_json::Value>,
    pub metadata: FetchMetadata,
}

/// REST attempt outcome carrying the cache-error classification.
#[derive(Debug, Clone)]
struct RestError {
    message: String,
    cache_error: bool,
}

/// Rate limiter for schema-cache reload attempts.
#[derive(Debug)]
pub struct CacheReloadState {
    last_reload_at: Option<Instant>,
    reload_count: u64,
    min_interval: Duration,
}

impl CacheReloadState {
    pub fn new(min_interval: Duration) -> Self {
        CacheReloadState {
            last_reload_at: None,
            reload_count: 0,
            min_interval,
        }
    }

    pub fn should_reload(&self) -> bool {
        match self.last_reload_at {
            None => true,
            Some(t) => t.elapsed() >= self.min_interval,
        }
    }

    pub fn record_reload(&mut self) {
        self.last_reload_at = Some(Instant::now());
        self.reload_count += 1;
    }

    pub fn reload_count(&self) -> u64 {
        self.reload_count
    }
}

/// Validate a view name against `[A-Za-z0-9_]+` with an optional single
/// `schema.` prefix, and split it into (schema, view).
///
/// This runs before the name is interpolated into SQL; filter values are
/// always bound, never interpolated.
pub fn validate_view_name(view_name: &str) -> Result<(String, String)> {
    fn ident_ok(s: &str) -> bool {
        !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    let mut parts = view_name.splitn(3, '.');
    let first = parts.next().unwrap_or("");
    let second = parts.next();
    let third = parts.next();

    if third.is_some() {
        bail!("invalid view name: {view_name}");
    }

    match second {
        None if ident_ok(first) => Ok(("public".to_string(), first.to_string())),
        Some(view) if ident_ok(first) && ident_ok(view) => {
            Ok((first.to_string(), view.to_string()))
        }
        _ => bail!("invalid view name: {view_name}"),
    }
}

/// Translate PostgREST-style filters (`col=op.value`) into a parameterized
/// WHERE clause. Returns the clause (empty string when no filters) and the
/// bind values in order, starting at `$1`.
pub fn translate_filters(filters: &[(String, String)]) -> Result<(String, Vec<String>)> {
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<String> = Vec::new();

    for (column, raw) in filters {
        if column.is_empty()
            || !column.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            bail!("invalid filter column: {column}");
        }

        let (op, value) = match raw.split_once('.') {
            Some((op, value)) => (op, value),
            None => ("eq", raw.as_str()),
        };

        let sql_op = match op {
            "eq" => "=",
            "gt" => ">",
            "gte" => ">=",
            "lt" => "<",
            "lte" => "<=",
            "neq" => "!=",
            "like" => "LIKE",
            "ilike" => "ILIKE",
            "is" => {
                let clause = match value.to_ascii_lowercase().as_str() {
                    "null" => format!("{column} IS NULL"),
                    "true" => format!("{column} IS TRUE"),
                    "false" => format!("{column} IS FALSE"),
                    other => bail!("unsupported is-filter value: {other}"),
                };
                clauses.push(clause);
                continue;
            }
            // No recognized operator prefix: treat the whole value as an
            // equality match (the dot belonged to the data).
            _ => {
                params.push(raw.clone());
                clauses.push(format!("{column} = ${}", params.len()));
                continue;
            }
        };

        params.push(value.to_string());
        clauses.push(format!("{column} {sql_op} ${}", params.len()));
    }

    let clause = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    Ok((clause, params))
}

/// Centralized data service with automatic REST-to-DB failover.
pub struct DataService {
    supabase_url: Option<String>,
    service_key: Option<String>,
    dsn: Option<String>,
    db: SharedDb,
    http: reqwest::Client,
    fallback_permits: Arc<Semaphore>,
    cache_state: Arc<Mutex<CacheReloadState>>,
}

impl DataService {
    pub fn new(settings: &Settings, db: SharedDb) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REST_TOTAL_TIMEOUT)
            .connect_timeout(REST_CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();

        DataService {
            supabase_url: settings.supabase_url.clone().map(|u| u.trim_end_matches('/').to_string()),
            service_key: settings.supabase_service_role_key.clone(),
            dsn: settings.database_url.clone(),
            db,
            http,
            fallback_permits: Arc::new(Semaphore::new(MAX_CONCURRENT_FALLBACK_QUERIES)),
            cache_state: Arc::new(Mutex::new(CacheReloadState::new(CACHE_RELOAD_MIN_INTERVAL))),
        }
    }

    /// Number of reload attempts scheduled so far (observability/tests).
    pub fn cache_reload_count(&self) -> u64 {
        self.cache_state.lock().map(|s| s.reload_count()).unwrap_or(0)
    }

    /// Semaphore guarding the direct-SQL fallback (exposed for tests and
    /// the metrics endpoint).
    pub fn fallback_semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.fallback_permits)
    }

    /// Main entry point: fetch rows from a view with automatic failover.
    pub async fn fetch_view(
        &self,
        view_name: &str,
        filters: &[(String, String)],
        limit: i64,
    ) -> Result<Vec<serde_json::Value>> {
        let result = self.fetch_view_with_metadata(view_name, filters, limit).await;
        match result {
            Ok(r) => Ok(r.rows),
            Err(e) => Err(e),
        }
    }

    /// Fetch with full metadata about which leg served the request.
    pub async fn fetch_view_with_metadata(
        &self,
        view_name: &str,
        filters: &[(String, String)],
        limit: i64,
    ) -> Result<DataServiceResult> {
        let (schema, view) = validate_view_name(view_name)?;

        // Attempt 1: REST.
        let rest_started = Instant::now();
        let rest_outcome = self.fetch_via_rest(&schema, &view, filters, limit).await;
        let rest_latency = rest_started.elapsed().as_secs_f64() * 1000.0;

        let rest_error = match rest_outcome {
            Ok(rows) => {
                debug!(view = view_name, rows = rows.len(), "REST ok");
                return Ok(DataServiceResult {
                    rows,
                    metadata: FetchMetadata {
                        source: FetchSource::Rest,
                        latency_ms: rest_latency,
                        cache_reload_triggered: false,
                        rest_error: None,
                    },
                });
            }
            Err(e) => e,
        };

        // Heal: schedule a schema-cache reload for cache-shaped errors.
        let mut cache_reload_triggered = false;
        if rest_error.cache_error {
            warn!(view = view_name, error = %rest_error.message, "REST source unstable; initiating failover");
            cache_reload_triggered = self.trigger_cache_reload();
        } else {
            warn!(view = view_name, error = %rest_error.message, "REST fetch failed");
        }

        // Attempt 2: direct SQL, throttled.
        info!(view = view_name, "serving via direct database connection");
        let db_started = Instant::now();
        let _permit = self
            .fallback_permits
            .acquire()
            .await
            .map_err(|_| anyhow!("fallback semaphore closed"))?;
        let direct = self.fetch_via_direct_db(&schema, &view, filters, limit).await;
        let db_latency = db_started.elapsed().as_secs_f64() * 1000.0;

        match direct {
            Ok(rows) => {
                info!(view = view_name, rows = rows.len(), "direct DB ok");
                Ok(DataServiceResult {
                    rows,
                    metadata: FetchMetadata {
                        source: FetchSource::DirectDb,
                        latency_ms: rest_latency + db_latency,
                        cache_reload_triggered,
                        rest_error: Some(rest_error.message),
                    },
                })
            }
            Err(db_error) => Err(anyhow!(
                "Data fetch failed for {view_name}: REST={}, DB={db_error}",
                rest_error.message
            )),
        }
    }

    async fn fetch_via_rest(
        &self,
        schema: &str,
        view: &str,
        filters: &[(String, String)],
        limit: i64,
    ) -> std::result::Result<Vec<serde_json::Value>, RestError> {
        let (Some(base), Some(key)) = (&self.supabase_url, &self.service_key) else {
            return Err(RestError {
                message: "REST source not configured".to_string(),
                cache_error: false,
            });
        };

        // Schema-qualified views address as `schema/view` on the REST side.
        let endpoint = if schema == "public" {
            view.to_string()
        } else {
            format!("{schema}/{view}")
        };
        let url = format!("{base}/rest/v1/{endpoint}");

        let mut query: Vec<(String, String)> = vec![("limit".to_string(), limit.to_string())];
        query.extend(filters.iter().cloned());

        let resp = self
            .http
            .get(&url)
            .header("apikey", key)
            .bearer_auth(key)
            .query(&query)
            .send()
            .await
            .map_err(|e| RestError {
                message: if e.is_timeout() {
                    "request timeout".to_string()
                } else {
                    format!("request failed: {e}")
                },
                cache_error: false,
            })?;

        let status = resp.status().as_u16();
        if status == 200 {
            let rows: Vec<serde_json::Value> = resp.json().await.map_err(|e| RestError {
                message: format!("invalid REST payload: {e}"),
                cache_error: false,
            })?;
            return Ok(rows);
        }

        let body: Option<serde_json::Value> = resp.json().await.ok();
        let code = body
            .as_ref()
            .and_then(|b| b.get("code"))
            .and_then(|c| c.as_str())
            .unwrap_or("");
        let detail = body
            .as_ref()
            .and_then(|b| b.get("message"))
            .and_then(|m| m.as_str())
            .unwrap_or("");

        let cache_error =
            RETRIABLE_STATUS.contains(&status) || PGRST_CACHE_ERRORS.contains(&code);

        Err(RestError {
            message: if code.is_empty() {
                format!("HTTP {status}: {detail}")
            } else {
                format!("{code}: {detail}")
            },
            cache_error,
        })
    }

    /// Schedule a `NOTIFY pgrst, 'reload schema'` side task.
    ///
    /// Never blocks the failover path and never fires more than once per
    /// rate-limit window. Returns whether a reload was scheduled.
    fn trigger_cache_reload(&self) -> bool {
        {
            let Ok(mut state) = self.cache_state.lock() else { return false };
            if !state.should_reload() {
                debug!("cache reload rate-limited, skipping");
                return false;
            }
            state.record_reload();
        }

        let Some(dsn) = self.dsn.clone() else {
            warn!("cannot heal REST cache: no DSN configured");
            return false;
        };

        tokio::spawn(async move {
            // Brief pause so the triggering request settles first.
            tokio::time::sleep(Duration::from_millis(500)).await;
            match do_cache_reload(&dsn).await {
                Ok(()) => info!("NOTIFY pgrst sent (schema cache reload)"),
                Err(e) => warn!(error = %e, "failed to send NOTIFY pgrst"),
            }
        });
        true
    }

    async fn fetch_via_direct_db(
        &self,
        schema: &str,
        view: &str,
        filters: &[(String, String)],
        limit: i64,
    ) -> Result<Vec<serde_json::Value>> {
        let pool = self.db.require_pool().await?;

        let (where_clause, params) = translate_filters(filters)?;
        let sql = format!(
            "SELECT row_to_json(t) FROM {schema}.{view} t{where_clause} LIMIT ${}",
            params.len() + 1
        );

        let mut query = sqlx::query_scalar::<_, serde_json::Value>(&sql);
        for p in &params {
            query = query.bind(p);
        }
        query = query.bind(limit);

        let rows = query.fetch_all(&pool).await?;
        Ok(rows)
    }
}

async fn do_cache_reload(dsn: &str) -> Result<()> {
    let connect = sqlx::postgres::PgConnection::connect(dsn);
    let mut conn = tokio::time::timeout(NOTIFY_CONNECT_TIMEOUT, connect)
        .await
        .map_err(|_| anyhow!("NOTIFY connect timed out"))??;
    sqlx::query("NOTIFY pgrst, 'reload schema'")
        .execute(&mut conn)
        .await?;
    let _ = conn.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_names_validate_and_split() {
        assert_eq!(
            validate_view_name("v_plaintiffs_overview").unwrap(),
            ("public".to_string(), "v_plaintiffs_overview".to_string())
        );
        assert_eq!(
            validate_view_name("ops.v_batch_performance").unwrap(),
            ("ops".to_string(), "v_batch_performance".to_string())
        );
    }

    #[test]
    fn hostile_view_names_rejected() {
        for bad in [
            "v; drop table judgments",
            "a.b.c",
            "bad-name",
            "ops.",
            ".view",
            "",
            "v name",
            "v\"quoted\"",
        ] {
            assert!(validate_view_name(bad).is_err(), "accepted: {bad}");
        }
    }

    #[test]
    fn eq_filter_translates_to_bound_param() {
        let (clause, params) =
            translate_filters(&[("status".to_string(), "eq.completed".to_string())]).unwrap();
        assert_eq!(clause, " WHERE status = $1");
        assert_eq!(params, vec!["completed"]);
    }

    #[test]
    fn all_operators_translate() {
        let filters = vec![
            ("a".to_string(), "gt.1".to_string()),
            ("b".to_string(), "gte.2".to_string()),
            ("c".to_string(), "lt.3".to_string()),
            ("d".to_string(), "lte.4".to_string()),
            ("e".to_string(), "neq.5".to_string()),
            ("f".to_string(), "like.%x%".to_string()),
            ("g".to_string(), "ilike.%y%".to_string()),
        ];
        let (clause, params) = translate_filters(&filters).unwrap();
        assert_eq!(
            clause,
            " WHERE a > $1 AND b >= $2 AND c < $3 AND d <= $4 AND e != $5 AND f LIKE $6 AND g ILIKE $7"
        );
        assert_eq!(params.len(), 7);
    }

    #[test]
    fn is_filter_emits_no_params() {
        let filters = vec![
            ("x".to_string(), "is.null".to_string()),
            ("y".to_string(), "is.true".to_string()),
            ("z".to_string(), "is.false".to_string()),
        ];
        let (clause, params) = translate_filters(&filters).unwrap();
        assert_eq!(clause, " WHERE x IS NULL AND y IS TRUE AND z IS FALSE");
        assert!(params.is_empty());
        assert!(translate_filters(&[("x".to_string(), "is.banana".to_string())]).is_err());
    }

    #[test]
    fn bare_value_is_equality() {
        let (clause, params) =
            translate_filters(&[("tier".to_string(), "A".to_string())]).unwrap();
        assert_eq!(clause, " WHERE tier = $1");
        assert_eq!(params, vec!["A"]);
    }

    #[test]
    fn unknown_op_prefix_is_equality_on_whole_value() {
        let (clause, params) =
            translate_filters(&[("name".to_string(), "st. marks".to_string())]).unwrap();
        assert_eq!(clause, " WHERE name = $1");
        assert_eq!(params, vec!["st. marks"]);
    }

    #[test]
    fn hostile_filter_columns_rejected() {
        for bad in ["a; drop", "a b", "a\"b", ""] {
            assert!(
                translate_filters(&[(bad.to_string(), "eq.1".to_string())]).is_err(),
                "accepted: {bad}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cache_reload_rate_limits_to_one_per_window() {
        let mut state = CacheReloadState::new(Duration::from_secs(30));
        assert!(state.should_reload());
        state.record_reload();
        assert_eq!(state.reload_count(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!state.should_reload());

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(state.should_reload());
    }

    #[test]
    fn fallback_semaphore_caps_at_five() {
        let sem = Semaphore::new(MAX_CONCURRENT_FALLBACK_QUERIES);
        let mut held = Vec::new();
        for _ in 0..5 {
            held.push(sem.try_acquire().expect("permit should be available"));
        }
        assert!(sem.try_acquire().is_err(), "sixth permit must block");
        drop(held);
        assert!(sem.try_acquire().is_ok());
    }
}
