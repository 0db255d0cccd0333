use axum::{
    body::Body,
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use connector_core::OperationOutcome;
use jsonwebtoken::{Algorithm, DecodingKey, TokenData, Validation, jwk::JwkSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{AppState, audit, config::ServerConfig};

/// Cached JWK key set fetched from the identity provider.
#[derive(Default)]
pub struct JwkCache {
    jwks: Option<JwkSet>,
    fetched_at: Option<std::time::Instant>,
}

/// Cache TTL: 15 minutes
const JWK_CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(15 * 60);

impl JwkCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_expired(&self) -> bool {
        match self.fetched_at {
            Some(t) => t.elapsed() > JWK_CACHE_TTL,
            None => true,
        }
    }
}

/// Fetch or return cached JWK set from the configured URL.
async fn get_jwks(jwk_url: &str, cache: &RwLock<JwkCache>) -> Result<JwkSet, String> {
    {
        let c = cache.read().await;
        if !c.is_expired()
            && let Some(ref jwks) = c.jwks
        {
            return Ok(jwks.clone());
        }
    }

    let mut c = cache.write().await;
    // Double-check after acquiring write lock
    if !c.is_expired()
        && let Some(ref jwks) = c.jwks
    {
        return Ok(jwks.clone());
    }

    let response = reqwest::get(jwk_url)
        .await
        .map_err(|e| format!("Failed to fetch JWK from {}: {}", jwk_url, e))?;

    let jwks: JwkSet = response
        .json()
        .await
        .map_err(|e| format!("Failed to parse JWK response: {}", e))?;

    c.jwks = Some(jwks.clone());
    c.fetched_at = Some(std::time::Instant::now());

    Ok(jwks)
}

/// Application role, ordered from least to most privileged
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    #[default]
    Standard,
    Admin,
    SuperAdmin,
}

impl Role {
    /// Accepts the identity provider's spellings ("Super Admin", "super_admin", ...)
    pub fn parse(s: &str) -> Option<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "standard" | "user" => Some(Role::Standard),
            "admin" => Some(Role::Admin),
            "superadmin" => Some(Role::SuperAdmin),
            _ => None,
        }
    }

    pub fn satisfies(self, required: Role) -> bool {
        self >= required
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthMethod {
    ApiKey,
    BasicAuth,
    Jwt,
    /// Authentication switched off in configuration
    Disabled,
}

/// The authenticated caller
#[derive(Debug, Clone)]
pub struct SessionUser {
    pub id: String,
    pub username: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Role,
    pub auth_method: AuthMethod,
}

impl SessionUser {
    pub fn new(username: impl Into<String>, role: Role, auth_method: AuthMethod) -> Self {
        let username = username.into();
        Self {
            id: username.clone(),
            username,
            first_name: None,
            last_name: None,
            role,
            auth_method,
        }
    }

    /// Caller used for every request when authentication is disabled
    pub fn local_super_admin() -> Self {
        Self::new("local-dev-user", Role::SuperAdmin, AuthMethod::Disabled)
    }
}

#[derive(Debug, Default, Deserialize)]
struct RealmAccess {
    #[serde(default)]
    roles: Vec<String>,
}

/// JWT claims structure
#[derive(Debug, Deserialize)]
struct JwtClaims {
    sub: Option<String>,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    given_name: Option<String>,
    #[serde(default)]
    family_name: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    realm_access: Option<RealmAccess>,
}

impl JwtClaims {
    /// Explicit `role` claim first, otherwise the highest known realm role
    fn role(&self) -> Role {
        if let Some(role) = self.role.as_deref().and_then(Role::parse) {
            return role;
        }
        self.realm_access
            .as_ref()
            .map(|r| r.roles.iter().filter_map(|s| Role::parse(s)).max())
            .unwrap_or_default()
            .unwrap_or_default()
    }
}

fn unauthorized(message: impl Into<String>) -> Response {
    let outcome = OperationOutcome::unauthorized(message);
    (StatusCode::UNAUTHORIZED, axum::Json(outcome)).into_response()
}

fn server_error(message: impl Into<String>) -> Response {
    let outcome = OperationOutcome::exception(message);
    (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(outcome)).into_response()
}

/// Authentication middleware
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    if !state.config.auth.enabled {
        request
            .extensions_mut()
            .insert(SessionUser::local_super_admin());
        return Ok(next.run(request).await);
    }

    // Allow public endpoints without auth
    let path = request.uri().path();
    if path == "/health" || path.starts_with("/.well-known/") {
        return Ok(next.run(request).await);
    }

    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let Some(auth_header) = auth_header else {
        return Err(unauthorized("Missing Authorization header"));
    };

    let session_user = if auth_header.starts_with("Bearer ") {
        authenticate_bearer(&state, auth_header).await?
    } else if auth_header.starts_with("Basic ") {
        authenticate_basic(&state.config, auth_header)?
    } else {
        return Err(unauthorized(
            "Invalid Authorization header format. Use 'Bearer <token>' or 'Basic <credentials>'",
        ));
    };

    let client_ip = request
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    audit::log_auth_attempt(&client_ip, Some(&session_user.username), true);

    request.extensions_mut().insert(session_user);

    Ok(next.run(request).await)
}

/// Authenticate using Bearer token (API key first, then JWT fallback)
#[allow(clippy::result_large_err)]
async fn authenticate_bearer(
    state: &Arc<AppState>,
    auth_header: &str,
) -> Result<SessionUser, Response> {
    let token = auth_header.trim_start_matches("Bearer ").trim();

    for api_key in &state.config.auth.api_keys {
        if api_key.key == token {
            return Ok(SessionUser::new(
                api_key.name.clone(),
                api_key.role,
                AuthMethod::ApiKey,
            ));
        }
    }

    if let Some(ref jwt_settings) = state.config.auth.jwt {
        return authenticate_jwt(jwt_settings, token, &state.jwk_cache).await;
    }

    Err(unauthorized("Invalid API key"))
}

/// Authenticate using a session JWT from the identity provider
#[allow(clippy::result_large_err)]
async fn authenticate_jwt(
    jwt_settings: &crate::config::JwtSettings,
    token: &str,
    jwk_cache: &RwLock<JwkCache>,
) -> Result<SessionUser, Response> {
    let (decoding_key, algorithm) = if let Some(ref jwk_url) = jwt_settings.jwk_url {
        let jwks = get_jwks(jwk_url, jwk_cache).await.map_err(server_error)?;

        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| unauthorized(format!("Invalid JWT header: {}", e)))?;

        let kid = header.kid.as_deref().unwrap_or("");
        let jwk = jwks
            .keys
            .iter()
            .find(|k| k.common.key_id.as_deref() == Some(kid))
            .or_else(|| jwks.keys.first())
            .ok_or_else(|| unauthorized("No matching JWK found"))?;

        let key =
            DecodingKey::from_jwk(jwk).map_err(|e| unauthorized(format!("Invalid JWK: {}", e)))?;

        let alg = jwk
            .common
            .key_algorithm
            .and_then(|a| match a {
                jsonwebtoken::jwk::KeyAlgorithm::RS256 => Some(Algorithm::RS256),
                jsonwebtoken::jwk::KeyAlgorithm::RS384 => Some(Algorithm::RS384),
                jsonwebtoken::jwk::KeyAlgorithm::RS512 => Some(Algorithm::RS512),
                jsonwebtoken::jwk::KeyAlgorithm::ES256 => Some(Algorithm::ES256),
                jsonwebtoken::jwk::KeyAlgorithm::ES384 => Some(Algorithm::ES384),
                _ => None,
            })
            .unwrap_or(Algorithm::RS256);

        (key, alg)
    } else if let Some(ref secret) = jwt_settings.secret {
        (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256)
    } else {
        return Err(server_error(
            "JWT is configured but neither secret nor jwk_url is set",
        ));
    };

    let mut validation = Validation::new(algorithm);

    if let Some(ref issuer) = jwt_settings.issuer {
        validation.set_issuer(&[issuer]);
    }

    if let Some(ref audience) = jwt_settings.audience {
        validation.set_audience(&[audience]);
    } else {
        validation.validate_aud = false;
    }

    let token_data: TokenData<JwtClaims> = jsonwebtoken::decode(token, &decoding_key, &validation)
        .map_err(|e| unauthorized(format!("Invalid JWT: {}", e)))?;
    let claims = token_data.claims;

    let role = claims.role();
    let id = claims.sub.clone().unwrap_or_else(|| "anonymous".to_string());
    Ok(SessionUser {
        username: claims.preferred_username.clone().unwrap_or_else(|| id.clone()),
        id,
        first_name: claims.given_name,
        last_name: claims.family_name,
        role,
        auth_method: AuthMethod::Jwt,
    })
}

/// Authenticate using Basic authentication
#[allow(clippy::result_large_err)]
fn authenticate_basic(config: &ServerConfig, auth_header: &str) -> Result<SessionUser, Response> {
    let credentials = auth_header.trim_start_matches("Basic ").trim();

    let decoded = STANDARD
        .decode(credentials)
        .map_err(|_| unauthorized("Invalid Base64 encoding in Basic auth"))?;

    let credentials_str = String::from_utf8(decoded)
        .map_err(|_| unauthorized("Invalid UTF-8 in Basic auth credentials"))?;

    let Some((username, password)) = credentials_str.split_once(':') else {
        return Err(unauthorized(
            "Invalid Basic auth format. Expected 'username:password'",
        ));
    };

    for user in &config.auth.basic_auth {
        if user.username == username && user.password == password {
            return Ok(SessionUser::new(username, user.role, AuthMethod::BasicAuth));
        }
    }

    Err(unauthorized("Invalid username or password"))
}
