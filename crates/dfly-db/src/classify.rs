//! Pure error classification and backoff policy.
//!
//! The classifier works on the low-level error *message*, not the driver's
//! error types: message patterns are stable across driver versions, and the
//! pooler's lockout signals only ever appear as text.

use std::time::Duration;

use rand::Rng;

use crate::state::ErrorClass;

// Normal transient failures: quick exponential backoff.
pub const NORMAL_BASE_DELAY_S: f64 = 2.0;
pub const NORMAL_MAX_DELAY_S: f64 = 60.0;
pub const NORMAL_JITTER_FACTOR: f64 = 0.2;

// Auth failures: polite backoff (15-30 min) to avoid a lockout spiral.
pub const AUTH_FAILURE_MIN_DELAY_S: f64 = 15.0 * 60.0;
pub const AUTH_FAILURE_MAX_DELAY_S: f64 = 30.0 * 60.0;

// Pooler lockout: 15-20 min recovery window, +-10% jitter. Must be waited
// out in full before any further connection attempt.
pub const LOCKOUT_BACKOFF_MIN_S: f64 = 900.0;
pub const LOCKOUT_BACKOFF_MAX_S: f64 = 1200.0;
pub const LOCKOUT_JITTER_FACTOR: f64 = 0.1;

/// Pooler signals of an active lockout.
const LOCKOUT_PATTERNS: &[&str] = &["server_login_retry", "query_wait_timeout"];

const AUTH_PATTERNS: &[&str] = &[
    "password authentication failed",
    "authentication failed",
    "no pg_hba.conf entry",
    "permission denied for user",
];

const NETWORK_PATTERNS: &[&str] = &[
    "connection refused",
    "could not connect",
    "connection timed out",
    "timed out",
    "timeout expired",
    "network is unreachable",
    "host is unreachable",
    "could not translate host name",
    "name or service not known",
    "failed to lookup address",
    "connection reset",
];

/// Classify a low-level database error message.
///
/// Lockout wins over everything else: a `FATAL: server_login_retry` line is
/// the pooler actively rejecting us, and retrying as an "auth failure"
/// would still be too aggressive.
pub fn classify_db_error(message: &str) -> ErrorClass {
    let msg = message.to_ascii_lowercase();

    if LOCKOUT_PATTERNS.iter().any(|p| msg.contains(p)) {
        return ErrorClass::Lockout;
    }

    if AUTH_PATTERNS.iter().any(|p| msg.contains(p)) {
        return ErrorClass::AuthFailure;
    }
    // `role "x" does not exist` / `database "x" does not exist` are login
    // failures from the server's perspective.
    if msg.contains("does not exist") && (msg.contains("role") || msg.contains("database")) {
        return ErrorClass::AuthFailure;
    }

    if NETWORK_PATTERNS.iter().any(|p| msg.contains(p)) {
        return ErrorClass::Network;
    }

    // Unrecognized FATAL server greetings are treated as auth-shaped: they
    // come from the server during login and retrying fast never helps.
    if msg.trim_start().starts_with("fatal:") {
        return ErrorClass::AuthFailure;
    }

    ErrorClass::Other
}

/// Compute the next retry delay for a failure of the given class.
pub fn backoff_delay(consecutive_failures: u32, class: ErrorClass) -> Duration {
    let mut rng = rand::thread_rng();

    let secs = match class {
        ErrorClass::Lockout => {
            let base = rng.gen_range(LOCKOUT_BACKOFF_MIN_S..=LOCKOUT_BACKOFF_MAX_S);
            let jitter = base * LOCKOUT_JITTER_FACTOR * rng.gen_range(-1.0..=1.0);
            let delay = base + jitter;
            tracing::info!(
                delay_s = delay as u64,
                "[DB] lockout circuit breaker engaged; waiting for pooler recovery"
            );
            delay
        }
        ErrorClass::AuthFailure => {
            let delay = rng.gen_range(AUTH_FAILURE_MIN_DELAY_S..=AUTH_FAILURE_MAX_DELAY_S);
            tracing::info!(
                delay_s = delay as u64,
                "[DB] auth failure; polite backoff to avoid lockout escalation"
            );
            delay
        }
        _ => {
            let base =
                (NORMAL_BASE_DELAY_S * 2f64.powi(consecutive_failures.min(5) as i32))
                    .min(NORMAL_MAX_DELAY_S);
            let jitter = rng.gen_range(-base * NORMAL_JITTER_FACTOR..=base * NORMAL_JITTER_FACTOR);
            (base + jitter).max(1.0)
        }
    };

    Duration::from_secs_f64(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_auth_failures() {
        for msg in [
            "FATAL: password authentication failed for user \"service_role\"",
            "FATAL:  password authentication failed for user",
            "no pg_hba.conf entry for host \"1.2.3.4\"",
            "authentication failed for user",
            "role \"missing_role\" does not exist",
            "database \"missing_db\" does not exist",
            "permission denied for user app",
            "FATAL: unexpected server greeting",
        ] {
            assert_eq!(classify_db_error(msg), ErrorClass::AuthFailure, "{msg}");
        }
    }

    #[test]
    fn classifies_lockout_even_with_fatal_prefix() {
        for msg in [
            "FATAL: server_login_retry=3, lockout imminent",
            "query_wait_timeout while waiting for connection",
            "server_login_retry",
        ] {
            assert_eq!(classify_db_error(msg), ErrorClass::Lockout, "{msg}");
        }
    }

    #[test]
    fn classifies_network_errors() {
        for msg in [
            "could not connect to server: Connection refused",
            "connection timed out",
            "timeout expired",
            "network is unreachable",
            "could not translate host name \"db.internal\" to address: Name or service not known",
        ] {
            assert_eq!(classify_db_error(msg), ErrorClass::Network, "{msg}");
        }
    }

    #[test]
    fn classifies_other_errors() {
        for msg in [
            "syntax error at or near \"SELECT\"",
            "unexpected error occurred",
            "some random failure message",
        ] {
            assert_eq!(classify_db_error(msg), ErrorClass::Other, "{msg}");
        }
    }

    #[test]
    fn lockout_delay_within_jittered_window() {
        for _ in 0..200 {
            let d = backoff_delay(1, ErrorClass::Lockout).as_secs_f64();
            // [900, 1200] with +-10% jitter on the sampled base.
            assert!(d >= 900.0 * 0.9, "too short: {d}");
            assert!(d <= 1200.0 * 1.1, "too long: {d}");
        }
    }

    #[test]
    fn auth_delay_between_15_and_30_minutes() {
        for _ in 0..200 {
            let d = backoff_delay(3, ErrorClass::AuthFailure).as_secs_f64();
            assert!((900.0..=1800.0).contains(&d), "out of range: {d}");
        }
    }

    #[test]
    fn network_delay_grows_exponentially_and_caps() {
        // attempt 0: base 2s; attempt 5+: capped at 60s, +-20% jitter.
        for _ in 0..100 {
            let d0 = backoff_delay(0, ErrorClass::Network).as_secs_f64();
            assert!((1.0..=2.4).contains(&d0), "attempt 0 out of range: {d0}");

            let d9 = backoff_delay(9, ErrorClass::Network).as_secs_f64();
            assert!(d9 <= 72.0, "cap exceeded: {d9}");
            assert!(d9 >= 48.0, "below jittered cap floor: {d9}");
        }
    }

    #[test]
    fn delay_never_below_one_second() {
        for n in 0..3 {
            assert!(backoff_delay(n, ErrorClass::Other).as_secs_f64() >= 1.0);
        }
    }
}
