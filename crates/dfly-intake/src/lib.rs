// crates/dfly-intake/src/lib.rs
//! CSV intake engine and its guardian.
//!
//! The pipeline is chunked (500 rows), idempotent (content-hash ledger),
//! and error-isolating (per-row transactions + per-row log). See
//! [`service::IntakeService`] for the batch lifecycle and
//! [`guardian::IntakeGuardian`] for stuck-batch recovery.

pub mod columns;
pub mod guardian;
pub mod parse;
pub mod service;

pub use columns::{normalize_column_name, HeaderMap, RowData, COLUMN_ALIASES};
pub use guardian::{GuardianResult, IntakeGuardian};
pub use parse::{clean_text, parse_amount, parse_date};
pub use service::{
    error_code, sha256_file, BatchResult, IntakeResult, IntakeService, UploadArgs, CHUNK_SIZE,
    MAX_CONSECUTIVE_ERRORS, VALID_SOURCES,
};
