//! dfly-api entry point.
//!
//! Boot order is load-bearing: resolve the environment (fatal on a
//! prod/dev credential mismatch), build settings, attempt the initial DB
//! connect (degraded mode on failure - the process serves `/health` no
//! matter what), start the reconnection supervisor and the guardian
//! schedule, then serve until shutdown.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, info, warn, Level};

use dfly_api::{routes, AppState};
use dfly_config::Settings;
use dfly_db::{Db, ProcessRole};
use dfly_intake::IntakeGuardian;
use dfly_scheduler::Scheduler;

const GUARDIAN_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    // Fatal only for a prod/dev credential mismatch; a missing .env file or
    // absent DSN boots degraded instead.
    let env = dfly_config::load_environment(None)?;
    let settings = Settings::from_env();
    info!(env = %env, sha = %settings.git_sha_short(), "booting dragonfly-api");

    let db = Db::new(settings.database_url.clone(), ProcessRole::Api);
    if settings.database_url.is_some() {
        if let Err(e) = db.connect().await {
            // Degraded mode: keep serving, the supervisor owns recovery.
            error!(error = %format!("{e:#}"), "initial DB connect failed; continuing degraded");
        }
    } else {
        warn!("DATABASE_URL not configured; booting in degraded mode");
    }
    info!("{}", db.snapshot().await.operator_status());

    let supervisor = db.start_supervisor().await;

    let mut scheduler = Scheduler::new();
    {
        let db = Arc::clone(&db);
        scheduler.add_job("intake_guardian", GUARDIAN_INTERVAL, move || {
            let db = Arc::clone(&db);
            async move {
                let Some(pool) = db.pool().await else {
                    // Nothing to guard while the DB is away.
                    return Ok(());
                };
                let result = IntakeGuardian::new(pool).check_stuck_batches().await;
                if result.errors.is_empty() {
                    Ok(())
                } else {
                    Err(result.errors.join("; "))
                }
            }
        });
    }
    scheduler.start();

    let state = AppState::new(settings.clone(), Arc::clone(&db));
    let app = routes::build_router(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_layer(&settings));

    let host: IpAddr = settings.host.parse().unwrap_or([0, 0, 0, 0].into());
    let addr = SocketAddr::from((host, settings.port));
    info!("dragonfly-api listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr} failed"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    info!("shutting down");
    supervisor.stop().await;
    scheduler.stop().await;
    db.close().await;
    info!("shutdown complete");

    Ok(())
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

/// CORS allowlist from `DRAGONFLY_CORS_ORIGINS`. Missing/empty denies all.
/// Production additionally admits dashboard preview domains.
fn cors_layer(settings: &Settings) -> CorsLayer {
    let origins = settings.cors_allowed_origins();
    let preview = settings.cors_preview_pattern();

    let allow = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let Ok(origin) = origin.to_str() else { return false };
        if origins.iter().any(|o| o == origin) {
            return true;
        }
        if let Some((prefix, suffix)) = preview {
            return origin.starts_with(prefix) && origin.ends_with(suffix);
        }
        false
    });

    CorsLayer::new()
        .allow_origin(allow)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install shutdown handler");
    }
}
