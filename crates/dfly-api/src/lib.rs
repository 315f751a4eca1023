//! HTTP layer for the Dragonfly control plane.
//!
//! Library crate so the scenario tests in `tests/` can compose the router
//! in-process; `main.rs` adds CORS + request logging and serves it.

pub mod auth;
pub mod envelope;
pub mod metrics;
pub mod routes;
pub mod state;
pub mod trace;

pub use envelope::{ApiEnvelope, ResponseMeta};
pub use state::{AppState, SharedState};
pub use trace::TraceId;
