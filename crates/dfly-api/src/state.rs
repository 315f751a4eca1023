//! Shared application state for the HTTP layer.
//!
//! Handlers receive `State<Arc<AppState>>`. Everything process-wide (DB
//! handle, data service, metrics) is constructed once in `main` and
//! injected here; no module-level globals.

use std::sync::Arc;

use dfly_config::Settings;
use dfly_data::DataService;
use dfly_db::SharedDb;

use crate::metrics::Metrics;

/// Static build metadata included in health/version responses.
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

pub struct AppState {
    pub settings: Settings,
    pub db: SharedDb,
    pub data: DataService,
    pub metrics: Metrics,
    pub build: BuildInfo,
    /// Shared client for outbound readiness probes (REST credential check).
    pub http: reqwest::Client,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(settings: Settings, db: SharedDb) -> SharedState {
        let data = DataService::new(&settings, Arc::clone(&db));
        Arc::new(AppState {
            settings,
            db,
            data,
            metrics: Metrics::new(),
            build: BuildInfo {
                service: "dragonfly-api",
                version: env!("CARGO_PKG_VERSION"),
            },
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
        })
    }
}
