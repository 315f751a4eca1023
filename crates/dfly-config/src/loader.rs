//! Strict environment bootstrap.
//!
//! Resolution precedence (highest first): explicit parameter, `--env` CLI
//! flag, `DRAGONFLY_ENV` process variable, default `dev`.  When `--env prod`
//! is active the local `.env.dev` file is never read, so dev and prod
//! credentials cannot cross-contaminate.
//!
//! The `.env.<env>` file is optional: hosted deployments inject variables
//! through the platform and have no file on disk.  A missing file is a
//! warning, never an error.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use tracing::{debug, info, warn};
use url::Url;

/// Environment marker variable set after a successful load.
pub const ENV_MARKER: &str = "DRAGONFLY_ENV";

/// DB host substrings expected per environment.
const DEV_HOST_PATTERNS: &[&str] = &["ejiddanxtqcleyswqvkc", "localhost", "127.0.0.1"];
const PROD_HOST_PATTERNS: &[&str] = &["iaketsyhmqbwaabgykux"];

/// Active environment name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvName {
    Dev,
    Prod,
}

impl EnvName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvName::Dev => "dev",
            EnvName::Prod => "prod",
        }
    }

    /// Parse a user-supplied environment name, accepting common synonyms.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Ok(EnvName::Prod),
            "dev" | "development" | "" => Ok(EnvName::Dev),
            other => bail!("invalid environment '{other}': must be 'dev' or 'prod'"),
        }
    }
}

impl std::fmt::Display for EnvName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scan argv for a `--env <name>` or `--env=<name>` flag.
///
/// Only this flag is recognized; everything else is left for the real CLI
/// parser so scripts can pass their own arguments through.
fn env_from_cli_args<I: Iterator<Item = String>>(mut args: I) -> Option<String> {
    while let Some(arg) = args.next() {
        if arg == "--env" {
            return args.next();
        }
        if let Some(v) = arg.strip_prefix("--env=") {
            return Some(v.to_string());
        }
    }
    None
}

/// Extract the hostname from a database URL, if it parses at all.
pub fn extract_db_host(db_url: &str) -> Option<String> {
    Url::parse(db_url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
}

/// Verify that the DB host matches the target environment.
///
/// Fatal when `prod` resolves a host matching a dev pattern. The symmetric
/// case (dev pointed at prod) only warns: developers sometimes run read-only
/// checks against production on purpose.
pub fn verify_db_host(env: EnvName, db_url: Option<&str>) -> Result<()> {
    let Some(db_url) = db_url else {
        warn!("no DB URL present; skipping env/host verification");
        return Ok(());
    };
    let Some(host) = extract_db_host(db_url) else {
        warn!("DB URL has no parseable host; skipping env/host verification");
        return Ok(());
    };

    let expected: &[&str] = match env {
        EnvName::Dev => DEV_HOST_PATTERNS,
        EnvName::Prod => PROD_HOST_PATTERNS,
    };

    if expected.iter().any(|p| host.contains(p)) {
        return Ok(());
    }

    if env == EnvName::Prod {
        for dev_pattern in DEV_HOST_PATTERNS {
            if host.contains(dev_pattern) {
                bail!(
                    "CRITICAL: PROD CONFIG LOADED DEV CREDENTIALS\n\
                     \x20 environment: {env}\n\
                     \x20 db host: {host}\n\
                     \x20 expected pattern containing: {expected:?}\n\
                     Check the DATABASE_URL supplied to this process."
                );
            }
        }
    }

    warn!(%host, env = %env, "DB host does not match the expected patterns for this environment");
    Ok(())
}

fn find_project_root() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let mut dir: &Path = &cwd;
    loop {
        if dir.join("Cargo.toml").exists() {
            return dir.to_path_buf();
        }
        match dir.parent() {
            Some(p) => dir = p,
            None => return cwd,
        }
    }
}

/// Load environment configuration with strict precedence and set the
/// `DRAGONFLY_ENV` / `SUPABASE_MODE` / `ENVIRONMENT` markers.
///
/// Never fails because a `.env.<env>` file is absent. Fails only on an
/// invalid environment name or a prod/dev credential mismatch.
pub fn load_environment(explicit: Option<EnvName>) -> Result<EnvName> {
    let env = match explicit {
        Some(e) => e,
        None => {
            // Flag beats the inherited marker: `--env prod` must win even
            // when the parent shell exported DRAGONFLY_ENV=dev.
            let raw = env_from_cli_args(std::env::args())
                .or_else(|| std::env::var(ENV_MARKER).ok().filter(|v| !v.is_empty()))
                .unwrap_or_else(|| "dev".to_string());
            EnvName::parse(&raw)?
        }
    };

    let env_file = find_project_root().join(format!(".env.{env}"));
    if env_file.exists() {
        match dotenvy::from_filename_override(&env_file) {
            Ok(_) => info!(file = %env_file.display(), "loaded environment file"),
            Err(e) => warn!(file = %env_file.display(), error = %e, "failed to read environment file"),
        }
    } else {
        debug!(
            file = %env_file.display(),
            "env file not found; relying on process environment variables"
        );
    }

    std::env::set_var(ENV_MARKER, env.as_str());
    std::env::set_var("SUPABASE_MODE", env.as_str());
    std::env::set_var("ENVIRONMENT", env.as_str());

    let db_url = std::env::var("DATABASE_URL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| {
            std::env::var("SUPABASE_DB_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
        });
    verify_db_host(env, db_url.as_deref())?;

    info!(env = %env, "environment loaded");
    Ok(env)
}
