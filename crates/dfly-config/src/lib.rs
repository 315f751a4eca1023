//! Runtime settings for the Dragonfly control plane.
//!
//! `Settings::from_env()` is called once at boot, after
//! [`loader::load_environment`] has populated the process environment, and
//! the resulting value is passed into constructors. Do not scatter
//! `std::env::var` calls across the codebase.
//!
//! A missing or malformed database URL is NOT an error here: the settings
//! carry `database_url: None` and the DB layer marks itself `no_config` so
//! the API can boot degraded and keep serving `/health`.

pub mod loader;

pub use loader::{load_environment, verify_db_host, EnvName, ENV_MARKER};

use tracing::warn;

/// Immutable application settings, resolved once at startup.
#[derive(Clone)]
pub struct Settings {
    /// Effective Postgres DSN. `None` means degraded mode (no_config).
    pub database_url: Option<String>,
    /// REST source base URL (PostgREST front of the database).
    pub supabase_url: Option<String>,
    pub supabase_service_role_key: Option<String>,
    pub supabase_anon_key: Option<String>,

    pub api_key: Option<String>,
    pub jwt_secret: Option<String>,

    pub cors_origins: Option<String>,

    pub environment: String,
    pub dragonfly_env: EnvName,
    pub log_level: String,
    pub host: String,
    pub port: u16,
    pub git_sha: Option<String>,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Secrets and the DSN (which embeds a password) are redacted.
        f.debug_struct("Settings")
            .field("database_url", &self.database_url.as_ref().map(|_| "<REDACTED>"))
            .field("supabase_url", &self.supabase_url)
            .field(
                "supabase_service_role_key",
                &self.supabase_service_role_key.as_ref().map(|_| "<REDACTED>"),
            )
            .field("api_key", &self.api_key.as_ref().map(|_| "<REDACTED>"))
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<REDACTED>"))
            .field("environment", &self.environment)
            .field("log_level", &self.log_level)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("git_sha", &self.git_sha)
            .finish()
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl Settings {
    /// Build settings from the current process environment.
    pub fn from_env() -> Self {
        let dragonfly_env = env_opt(ENV_MARKER)
            .and_then(|v| EnvName::parse(&v).ok())
            .unwrap_or(EnvName::Dev);

        Settings {
            database_url: resolve_database_url(
                env_opt("DATABASE_URL").as_deref(),
                env_opt("SUPABASE_DB_URL").as_deref(),
            ),
            supabase_url: env_opt("SUPABASE_URL"),
            supabase_service_role_key: env_opt("SUPABASE_SERVICE_ROLE_KEY"),
            supabase_anon_key: env_opt("SUPABASE_ANON_KEY"),
            api_key: env_opt("DRAGONFLY_API_KEY"),
            jwt_secret: env_opt("SUPABASE_JWT_SECRET"),
            cors_origins: env_opt("DRAGONFLY_CORS_ORIGINS"),
            environment: env_opt("ENVIRONMENT").unwrap_or_else(|| dragonfly_env.as_str().to_string()),
            dragonfly_env,
            log_level: env_opt("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            host: env_opt("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env_opt("PORT").and_then(|v| v.parse().ok()).unwrap_or(8888),
            git_sha: env_opt("GIT_SHA").or_else(|| env_opt("RENDER_GIT_COMMIT")),
        }
    }

    pub fn is_production(&self) -> bool {
        self.dragonfly_env == EnvName::Prod || self.environment == "prod"
    }

    /// Short git SHA (at most 8 chars) for version reporting and the
    /// `X-Dragonfly-SHA-Short` identity header.
    pub fn git_sha_short(&self) -> String {
        match &self.git_sha {
            Some(sha) => sha.chars().take(8).collect(),
            None => "unknown".to_string(),
        }
    }

    /// Parse `DRAGONFLY_CORS_ORIGINS` into an allowlist.
    ///
    /// Missing or empty configuration yields an empty list: deny all.
    pub fn cors_allowed_origins(&self) -> Vec<String> {
        let Some(raw) = &self.cors_origins else {
            return Vec::new();
        };
        raw.replace(',', " ")
            .split_whitespace()
            .map(|o| o.trim_end_matches('/').to_string())
            .filter(|o| o.starts_with("http"))
            .collect()
    }

    /// Dashboard preview-domain prefix/suffix allowed in production on top of
    /// the explicit allowlist.
    pub fn cors_preview_pattern(&self) -> Option<(&'static str, &'static str)> {
        if self.is_production() {
            Some(("https://dragonfly-console1", ".vercel.app"))
        } else {
            None
        }
    }
}

/// Single DSN contract: `DATABASE_URL` primary, `SUPABASE_DB_URL` legacy
/// fallback (deprecation warning), neither set or a non-postgres scheme
/// resolves to `None` and the process boots degraded.
pub fn resolve_database_url(primary: Option<&str>, legacy: Option<&str>) -> Option<String> {
    let effective = match (primary, legacy) {
        (Some(p), _) if !p.trim().is_empty() => p.trim().to_string(),
        (_, Some(l)) if !l.trim().is_empty() => {
            warn!("using legacy SUPABASE_DB_URL; migrate to DATABASE_URL");
            l.trim().to_string()
        }
        _ => return None,
    };

    if !effective.starts_with("postgresql://") && !effective.starts_with("postgres://") {
        warn!(
            prefix = &effective[..effective.len().min(16)],
            "DATABASE_URL has an invalid scheme; entering degraded mode"
        );
        return None;
    }

    Some(effective)
}
