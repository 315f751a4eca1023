//! Process-wide database readiness state.
//!
//! This is what lets the API boot and serve `/health` while the database is
//! unavailable: the pool initializer and the supervisor record outcomes
//! here, and the readiness probe reports from it.  The struct itself is
//! plain data; concurrency is handled by the `RwLock` in [`crate::Db`].

use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

/// Process execution role, deciding the policy on fatal DB errors.
///
/// API processes never exit on connect failure (degraded mode + supervisor).
/// Workers exit with code 78 on auth/lockout to avoid amplifying a pooler
/// lockout spiral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Api,
    Worker,
}

impl ProcessRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessRole::Api => "api",
            ProcessRole::Worker => "worker",
        }
    }
}

/// Exit code for the auth/lockout kill-switch (EX_CONFIG from sysexits.h),
/// distinct from the generic exit(1).
pub const EXIT_CODE_AUTH_LOCKOUT: i32 = 78;

/// Detect the process role from the environment or entrypoint heuristics.
///
/// Priority: `PROCESS_ROLE`, legacy `WORKER_MODE`, argv[0] substrings,
/// default Api (the safe choice: no crash loops).
pub fn detect_process_role() -> ProcessRole {
    match std::env::var("PROCESS_ROLE")
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "api" => return ProcessRole::Api,
        "worker" => return ProcessRole::Worker,
        _ => {}
    }

    if matches!(
        std::env::var("WORKER_MODE")
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes"
    ) {
        return ProcessRole::Worker;
    }

    let argv0 = std::env::args().next().unwrap_or_default().to_ascii_lowercase();
    const WORKER_PATTERNS: &[&str] =
        &["worker", "ingest", "watcher", "scheduler", "sentinel", "orchestrator"];
    if WORKER_PATTERNS.iter().any(|p| argv0.contains(p)) {
        return ProcessRole::Worker;
    }

    ProcessRole::Api
}

/// Closed classification of low-level database errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    AuthFailure,
    Network,
    Lockout,
    NoConfig,
    Other,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::AuthFailure => "auth_failure",
            ErrorClass::Network => "network",
            ErrorClass::Lockout => "lockout",
            ErrorClass::NoConfig => "no_config",
            ErrorClass::Other => "other",
        }
    }

    /// Classes that trigger the worker kill-switch.
    pub fn is_fatal_for_worker(&self) -> bool {
        matches!(self, ErrorClass::AuthFailure | ErrorClass::Lockout)
    }
}

/// Global database readiness state for degraded-mode operation.
#[derive(Debug, Clone)]
pub struct DbReadinessState {
    pub ready: bool,
    pub healthy: bool,
    pub initialized: bool,

    pub last_error: Option<String>,
    pub last_error_class: Option<ErrorClass>,
    pub last_attempt_at: Option<Instant>,
    pub next_retry_at: Option<Instant>,

    pub init_attempts: u32,
    pub consecutive_failures: u32,
    pub init_duration_ms: Option<u64>,

    pub supervisor_running: bool,
    pub process_role: ProcessRole,
}

impl DbReadinessState {
    pub fn new(process_role: ProcessRole) -> Self {
        DbReadinessState {
            ready: false,
            healthy: false,
            initialized: false,
            last_error: None,
            last_error_class: None,
            last_attempt_at: None,
            next_retry_at: None,
            init_attempts: 0,
            consecutive_failures: 0,
            init_duration_ms: None,
            supervisor_running: false,
            process_role,
        }
    }

    /// Mark the database ready after a successful connection.
    pub fn mark_connected(&mut self, init_duration: Duration) {
        self.ready = true;
        self.healthy = true;
        self.initialized = true;
        self.last_error = None;
        self.last_error_class = None;
        self.consecutive_failures = 0;
        self.init_duration_ms = Some(init_duration.as_millis() as u64);
        self.last_attempt_at = Some(Instant::now());
        self.next_retry_at = None;

        tracing::info!(
            init_duration_ms = init_duration.as_millis() as u64,
            init_attempts = self.init_attempts,
            "[DB] READY=true"
        );
    }

    /// Record a failed connection attempt and schedule the next retry.
    pub fn mark_failed(&mut self, error: &str, class: ErrorClass, next_retry_delay: Duration) {
        self.ready = false;
        self.healthy = false;
        self.last_error = Some(truncate(error, 500));
        self.last_error_class = Some(class);
        self.consecutive_failures += 1;
        self.last_attempt_at = Some(Instant::now());
        self.next_retry_at = Some(Instant::now() + next_retry_delay);

        tracing::warn!(
            error_class = class.as_str(),
            consecutive_failures = self.consecutive_failures,
            next_retry_in_s = next_retry_delay.as_secs(),
            "[DB] READY=false reason={} next_retry_in={}s",
            class.as_str(),
            next_retry_delay.as_secs()
        );
    }

    /// Mark the database as unconfigured. No retry is scheduled; a config
    /// change and restart (or a supervisor with a fresh DSN) is required.
    pub fn mark_no_config(&mut self) {
        self.ready = false;
        self.healthy = false;
        self.initialized = false;
        self.last_error = Some("DATABASE_URL not configured".to_string());
        self.last_error_class = Some(ErrorClass::NoConfig);
        self.next_retry_at = None;

        tracing::warn!("[DB] READY=false reason=no_config");
    }

    /// Seconds until the next scheduled retry, or `None` when none is due.
    pub fn next_retry_in(&self) -> Option<Duration> {
        self.next_retry_at
            .map(|t| t.saturating_duration_since(Instant::now()))
    }

    pub fn next_retry_in_seconds(&self) -> Option<u64> {
        self.next_retry_in().map(|d| d.as_secs())
    }

    /// Single-line operator status for logs.
    pub fn operator_status(&self) -> String {
        if self.ready {
            return "[DB] READY=true".to_string();
        }
        let reason = self
            .last_error_class
            .map(|c| c.as_str())
            .unwrap_or("unknown");
        match self.next_retry_in_seconds() {
            Some(s) => format!("[DB] READY=false reason={reason} next_retry_in={s}s"),
            None => format!("[DB] READY=false reason={reason}"),
        }
    }

    /// Metadata map for `/readyz` responses.
    pub fn readiness_metadata(&self) -> serde_json::Value {
        json!({
            "ready": self.ready,
            "initialized": self.initialized,
            "last_error": self.last_error,
            "last_error_class": self.last_error_class.map(|c| c.as_str()),
            "consecutive_failures": self.consecutive_failures,
            "next_retry_in_seconds": self.next_retry_in_seconds(),
            "init_attempts": self.init_attempts,
        })
    }

    pub fn should_exit_on_auth_failure(&self) -> bool {
        self.process_role == ProcessRole::Worker
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    // Cut on a char boundary at or below max bytes.
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_connected_clears_error_state() {
        let mut s = DbReadinessState::new(ProcessRole::Api);
        s.mark_failed("boom", ErrorClass::Network, Duration::from_secs(4));
        assert!(!s.ready);
        assert_eq!(s.consecutive_failures, 1);
        assert!(s.next_retry_at.is_some());

        s.mark_connected(Duration::from_millis(250));
        assert!(s.ready && s.healthy && s.initialized);
        assert!(s.last_error.is_none());
        assert!(s.last_error_class.is_none());
        assert_eq!(s.consecutive_failures, 0);
        assert!(s.next_retry_at.is_none());
        assert_eq!(s.init_duration_ms, Some(250));
    }

    #[test]
    fn consecutive_failures_increase_until_connected() {
        let mut s = DbReadinessState::new(ProcessRole::Api);
        for n in 1..=3 {
            s.mark_failed("x", ErrorClass::Network, Duration::from_secs(1));
            assert_eq!(s.consecutive_failures, n);
        }
        s.mark_connected(Duration::from_millis(1));
        assert_eq!(s.consecutive_failures, 0);
    }

    #[test]
    fn mark_failed_truncates_error_to_500() {
        let mut s = DbReadinessState::new(ProcessRole::Api);
        let long = "e".repeat(2000);
        s.mark_failed(&long, ErrorClass::Other, Duration::from_secs(1));
        assert_eq!(s.last_error.as_ref().unwrap().len(), 500);
    }

    #[test]
    fn no_config_clears_retry_schedule() {
        let mut s = DbReadinessState::new(ProcessRole::Api);
        s.mark_failed("x", ErrorClass::Network, Duration::from_secs(60));
        s.mark_no_config();
        assert!(!s.ready);
        assert_eq!(s.last_error_class, Some(ErrorClass::NoConfig));
        assert!(s.next_retry_at.is_none());
        assert_eq!(s.next_retry_in_seconds(), None);
    }

    #[test]
    fn operator_status_formats() {
        let mut s = DbReadinessState::new(ProcessRole::Api);
        s.mark_connected(Duration::from_millis(1));
        assert_eq!(s.operator_status(), "[DB] READY=true");

        s.mark_failed("x", ErrorClass::Lockout, Duration::from_secs(900));
        let line = s.operator_status();
        assert!(line.starts_with("[DB] READY=false reason=lockout next_retry_in="));

        s.mark_no_config();
        assert_eq!(s.operator_status(), "[DB] READY=false reason=no_config");
    }

    #[test]
    fn readiness_metadata_shape() {
        let mut s = DbReadinessState::new(ProcessRole::Api);
        s.mark_failed("nope", ErrorClass::AuthFailure, Duration::from_secs(900));
        let meta = s.readiness_metadata();
        assert_eq!(meta["ready"], false);
        assert_eq!(meta["last_error_class"], "auth_failure");
        assert_eq!(meta["consecutive_failures"], 1);
        assert!(meta["next_retry_in_seconds"].as_u64().unwrap() <= 900);
    }

    #[test]
    fn worker_exit_policy() {
        let s = DbReadinessState::new(ProcessRole::Worker);
        assert!(s.should_exit_on_auth_failure());
        let s = DbReadinessState::new(ProcessRole::Api);
        assert!(!s.should_exit_on_auth_failure());
        assert!(ErrorClass::AuthFailure.is_fatal_for_worker());
        assert!(ErrorClass::Lockout.is_fatal_for_worker());
        assert!(!ErrorClass::Network.is_fatal_for_worker());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(300); // 2 bytes each
        let t = truncate(&s, 501);
        assert!(t.len() <= 501);
        assert!(t.chars().all(|c| c == 'é'));
    }
}
