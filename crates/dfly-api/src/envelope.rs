//! Standard API response envelope.
//!
//! Every UI-facing endpoint returns exactly this shape so the dashboard can
//! handle success, failure, and degradation uniformly:
//! `{ok, data, degraded, error, meta: {trace_id, timestamp}}`.
//!
//! The degrade-guard pattern builds on it: UI-critical handlers convert any
//! internal failure into `degraded(...)` at HTTP 200 instead of a 5xx, and
//! the trace id survives into the error envelope for correlation.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

const ERROR_MAX_LEN: usize = 500;

/// Metadata included in every response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub trace_id: String,
    /// RFC 3339 UTC instant.
    pub timestamp: String,
}

impl ResponseMeta {
    pub fn now(trace_id: &str) -> Self {
        ResponseMeta {
            trace_id: trace_id.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        }
    }
}

/// The uniform response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub ok: bool,
    pub data: Option<T>,
    pub degraded: bool,
    pub error: Option<String>,
    pub meta: ResponseMeta,
}

impl<T> ApiEnvelope<T> {
    /// Success envelope.
    pub fn ok(data: T, trace_id: &str) -> Self {
        ApiEnvelope {
            ok: true,
            data: Some(data),
            degraded: false,
            error: None,
            meta: ResponseMeta::now(trace_id),
        }
    }

    /// Degraded envelope: partial failure, still HTTP 200 at the transport
    /// level. The error string is truncated for safety.
    pub fn degraded(error: &str, data: Option<T>, trace_id: &str) -> Self {
        ApiEnvelope {
            ok: false,
            data,
            degraded: true,
            error: Some(truncate(error, ERROR_MAX_LEN)),
            meta: ResponseMeta::now(trace_id),
        }
    }

    /// Failure envelope that is *not* degraded (used by `/readyz`, which
    /// signals with a real 503 plus a category-only reason).
    pub fn failed(error: &str, data: Option<T>, trace_id: &str) -> Self {
        ApiEnvelope {
            ok: false,
            data,
            degraded: false,
            error: Some(truncate(error, ERROR_MAX_LEN)),
            meta: ResponseMeta::now(trace_id),
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_envelope_shape() {
        let env = ApiEnvelope::ok(serde_json::json!({"n": 1}), "trace-1");
        assert!(env.ok);
        assert!(!env.degraded);
        assert!(env.error.is_none());
        assert_eq!(env.meta.trace_id, "trace-1");
        assert_eq!(env.data.unwrap()["n"], 1);
    }

    #[test]
    fn degraded_envelope_truncates_error() {
        let env: ApiEnvelope<()> = ApiEnvelope::degraded(&"e".repeat(900), None, "t");
        assert!(!env.ok);
        assert!(env.degraded);
        assert_eq!(env.error.unwrap().len(), ERROR_MAX_LEN);
    }

    #[test]
    fn timestamp_is_rfc3339_utc() {
        let env = ApiEnvelope::ok((), "t");
        let parsed = chrono::DateTime::parse_from_rfc3339(&env.meta.timestamp).unwrap();
        assert_eq!(parsed.timezone().local_minus_utc(), 0);
    }

    #[test]
    fn serializes_with_expected_keys() {
        let env = ApiEnvelope::ok(serde_json::json!([1, 2]), "abc");
        let v = serde_json::to_value(&env).unwrap();
        for key in ["ok", "data", "degraded", "error", "meta"] {
            assert!(v.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(v["meta"]["trace_id"], "abc");
    }
}
