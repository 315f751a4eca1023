//! Request authentication: API key (constant-time compare) and Supabase
//! bearer tokens (HS256, audience `authenticated`).
//!
//! Public endpoints (health, version, root) skip this entirely; protected
//! route groups attach [`require_auth_middleware`], which rejects with 401
//! plus a `WWW-Authenticate` hint and otherwise stashes an [`AuthContext`]
//! in the request extensions.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use dfly_config::Settings;

use crate::state::AppState;

/// Canonical and legacy API-key headers.
pub const API_KEY_HEADER: &str = "x-dragonfly-api-key";
pub const API_KEY_HEADER_LEGACY: &str = "x-api-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthVia {
    ApiKey,
    Jwt,
    Anonymous,
}

impl AuthVia {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthVia::ApiKey => "api_key",
            AuthVia::Jwt => "jwt",
            AuthVia::Anonymous => "anonymous",
        }
    }
}

/// Authentication context for the current request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// User id from the JWT `sub` claim; `None` for API-key auth.
    pub subject: Option<String>,
    pub via: AuthVia,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        AuthContext {
            subject: None,
            via: AuthVia::Anonymous,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    MissingCredentials,
    InvalidApiKey,
    MalformedAuthorizationHeader,
    InvalidToken,
}

impl AuthError {
    fn detail(&self) -> &'static str {
        match self {
            AuthError::MissingCredentials => "Authentication required",
            AuthError::InvalidApiKey => "Invalid API key",
            AuthError::MalformedAuthorizationHeader => "Invalid authorization header format",
            AuthError::InvalidToken => "Invalid or expired token",
        }
    }

    fn challenge(&self) -> &'static str {
        match self {
            AuthError::InvalidApiKey => "API-Key",
            AuthError::MalformedAuthorizationHeader | AuthError::InvalidToken => "Bearer",
            AuthError::MissingCredentials => "Bearer, API-Key",
        }
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
}

fn verify_bearer(token: &str, settings: &Settings) -> Result<AuthContext, AuthError> {
    let Some(secret) = &settings.jwt_secret else {
        warn!("SUPABASE_JWT_SECRET not configured; cannot validate bearer tokens");
        return Err(AuthError::InvalidToken);
    };

    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&["authenticated"]);

    match decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation) {
        Ok(data) => {
            debug!(subject = ?data.claims.sub, "authenticated via JWT");
            Ok(AuthContext {
                subject: data.claims.sub,
                via: AuthVia::Jwt,
            })
        }
        Err(e) => {
            warn!(kind = ?e.kind(), "bearer token rejected");
            Err(AuthError::InvalidToken)
        }
    }
}

/// Authenticate a request from its headers.
///
/// Priority: API key (canonical, then legacy header), then bearer token.
pub fn authenticate(headers: &HeaderMap, settings: &Settings) -> Result<AuthContext, AuthError> {
    let presented_key = headers
        .get(API_KEY_HEADER)
        .or_else(|| headers.get(API_KEY_HEADER_LEGACY))
        .and_then(|v| v.to_str().ok());

    if let Some(presented) = presented_key {
        return match &settings.api_key {
            Some(expected) if constant_time_eq(presented, expected) => {
                debug!("authenticated via API key");
                Ok(AuthContext {
                    subject: None,
                    via: AuthVia::ApiKey,
                })
            }
            _ => {
                warn!("invalid API key attempted");
                Err(AuthError::InvalidApiKey)
            }
        };
    }

    if let Some(authorization) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        let Some(token) = authorization.strip_prefix("Bearer ") else {
            return Err(AuthError::MalformedAuthorizationHeader);
        };
        return verify_bearer(token, settings);
    }

    Err(AuthError::MissingCredentials)
}

/// Like [`authenticate`], but absence of credentials yields an anonymous
/// context instead of an error. Presented-but-invalid credentials still
/// fail.
pub fn authenticate_optional(
    headers: &HeaderMap,
    settings: &Settings,
) -> Result<AuthContext, AuthError> {
    match authenticate(headers, settings) {
        Err(AuthError::MissingCredentials) => Ok(AuthContext::anonymous()),
        other => other,
    }
}

/// Route-group middleware for endpoints that require authentication.
pub async fn require_auth_middleware(
    State(app): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    match authenticate(req.headers(), &app.settings) {
        Ok(ctx) => {
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        Err(e) => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, e.challenge())],
            Json(serde_json::json!({ "detail": e.detail() })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use dfly_config::EnvName;

    fn settings(api_key: Option<&str>, jwt_secret: Option<&str>) -> Settings {
        Settings {
            database_url: None,
            supabase_url: None,
            supabase_service_role_key: None,
            supabase_anon_key: None,
            api_key: api_key.map(|s| s.to_string()),
            jwt_secret: jwt_secret.map(|s| s.to_string()),
            cors_origins: None,
            environment: "dev".to_string(),
            dragonfly_env: EnvName::Dev,
            log_level: "info".to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            git_sha: None,
        }
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        h
    }

    #[test]
    fn valid_api_key_on_canonical_header() {
        let s = settings(Some("sekrit"), None);
        let ctx = authenticate(&headers(&[("x-dragonfly-api-key", "sekrit")]), &s).unwrap();
        assert_eq!(ctx.via, AuthVia::ApiKey);
        assert!(ctx.subject.is_none());
    }

    #[test]
    fn valid_api_key_on_legacy_header() {
        let s = settings(Some("sekrit"), None);
        let ctx = authenticate(&headers(&[("x-api-key", "sekrit")]), &s).unwrap();
        assert_eq!(ctx.via, AuthVia::ApiKey);
    }

    #[test]
    fn wrong_api_key_rejected() {
        let s = settings(Some("sekrit"), None);
        let err = authenticate(&headers(&[("x-dragonfly-api-key", "nope")]), &s).unwrap_err();
        assert_eq!(err, AuthError::InvalidApiKey);
        assert_eq!(err.challenge(), "API-Key");
    }

    #[test]
    fn api_key_rejected_when_none_configured() {
        let s = settings(None, None);
        let err = authenticate(&headers(&[("x-dragonfly-api-key", "anything")]), &s).unwrap_err();
        assert_eq!(err, AuthError::InvalidApiKey);
    }

    #[test]
    fn malformed_authorization_header_rejected() {
        let s = settings(None, Some("jwt-secret"));
        let err = authenticate(&headers(&[("authorization", "Token abc")]), &s).unwrap_err();
        assert_eq!(err, AuthError::MalformedAuthorizationHeader);
    }

    #[test]
    fn garbage_bearer_token_rejected() {
        let s = settings(None, Some("jwt-secret"));
        let err =
            authenticate(&headers(&[("authorization", "Bearer not.a.jwt")]), &s).unwrap_err();
        assert_eq!(err, AuthError::InvalidToken);
    }

    #[test]
    fn valid_jwt_yields_subject() {
        use jsonwebtoken::{encode, EncodingKey, Header};

        #[derive(serde::Serialize)]
        struct Out<'a> {
            sub: &'a str,
            aud: &'a str,
            exp: i64,
        }

        let secret = "jwt-secret";
        let token = encode(
            &Header::new(Algorithm::HS256),
            &Out {
                sub: "user-123",
                aud: "authenticated",
                exp: chrono::Utc::now().timestamp() + 600,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();

        let s = settings(None, Some(secret));
        let ctx =
            authenticate(&headers(&[("authorization", &format!("Bearer {token}"))]), &s).unwrap();
        assert_eq!(ctx.via, AuthVia::Jwt);
        assert_eq!(ctx.subject.as_deref(), Some("user-123"));
    }

    #[test]
    fn expired_jwt_rejected() {
        use jsonwebtoken::{encode, EncodingKey, Header};

        #[derive(serde::Serialize)]
        struct Out<'a> {
            sub: &'a str,
            aud: &'a str,
            exp: i64,
        }

        let secret = "jwt-secret";
        let token = encode(
            &Header::new(Algorithm::HS256),
            &Out {
                sub: "user-123",
                aud: "authenticated",
                exp: chrono::Utc::now().timestamp() - 600,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();

        let s = settings(None, Some(secret));
        let err = authenticate(&headers(&[("authorization", &format!("Bearer {token}"))]), &s)
            .unwrap_err();
        assert_eq!(err, AuthError::InvalidToken);
    }

    #[test]
    fn wrong_audience_rejected() {
        use jsonwebtoken::{encode, EncodingKey, Header};

        #[derive(serde::Serialize)]
        struct Out<'a> {
            sub: &'a str,
            aud: &'a str,
            exp: i64,
        }

        let secret = "jwt-secret";
        let token = encode(
            &Header::new(Algorithm::HS256),
            &Out {
                sub: "user-123",
                aud: "anon",
                exp: chrono::Utc::now().timestamp() + 600,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();

        let s = settings(None, Some(secret));
        assert!(
            authenticate(&headers(&[("authorization", &format!("Bearer {token}"))]), &s).is_err()
        );
    }

    #[test]
    fn no_credentials_is_missing_strict_anonymous_optional() {
        let s = settings(Some("k"), None);
        assert_eq!(
            authenticate(&HeaderMap::new(), &s).unwrap_err(),
            AuthError::MissingCredentials
        );
        let ctx = authenticate_optional(&HeaderMap::new(), &s).unwrap();
        assert_eq!(ctx.via, AuthVia::Anonymous);
    }

    #[test]
    fn optional_still_rejects_bad_credentials() {
        let s = settings(Some("k"), None);
        assert!(authenticate_optional(&headers(&[("x-api-key", "bad")]), &s).is_err());
    }
}
