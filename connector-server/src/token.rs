//! OAuth2 client-credentials and SMART backend-services token acquisition

use chrono::{DateTime, Duration, Utc};
use connector_core::{AuthType, ConnectorError, FhirServerConfig, Result};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::SmartSettings;

/// Token lifetime assumed when the server omits `expires_in`
pub const DEFAULT_EXPIRES_IN_SECS: i64 = 3300;

/// Subtracted from the lifetime so a token is refreshed before it lapses
pub const EXPIRY_BUFFER_SECS: i64 = 60;

/// Lifetime of a SMART client assertion
pub const ASSERTION_LIFETIME_SECS: i64 = 300;

pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// A bearer token and the instant it should no longer be used
#[derive(Debug, Clone, PartialEq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: Option<String>,
    pub expires_in: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AssertionClaims {
    iss: String,
    sub: String,
    aud: String,
    exp: i64,
    iat: i64,
    jti: String,
}

/// Expiry to store for a token issued at `now`, buffer already subtracted
pub fn token_expiry(now: DateTime<Utc>, expires_in: Option<i64>) -> DateTime<Utc> {
    let lifetime = expires_in
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_EXPIRES_IN_SECS);
    now + Duration::seconds(lifetime - EXPIRY_BUFFER_SECS)
}

/// Key id of the first key in a JWK Set document
pub fn key_id(jwks: &Value) -> Result<String> {
    jwks.get("keys")
        .and_then(Value::as_array)
        .and_then(|keys| keys.first())
        .and_then(|key| key.get("kid"))
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| ConnectorError::Authentication("No key ID found in JWKS".to_string()))
}

/// Sign the RS384 client assertion for a SMART backend-services token request
pub fn create_smart_jwt(
    client_id: &str,
    token_endpoint: &str,
    smart: &SmartSettings,
    now: DateTime<Utc>,
) -> Result<String> {
    let private_key = std::fs::read(&smart.private_key_file).map_err(|e| {
        ConnectorError::Authentication(format!(
            "Failed to load private key {}: {}",
            smart.private_key_file.display(),
            e
        ))
    })?;
    let jwks_text = std::fs::read_to_string(&smart.jwks_file).map_err(|e| {
        ConnectorError::Authentication(format!(
            "Failed to load JWKS {}: {}",
            smart.jwks_file.display(),
            e
        ))
    })?;
    let jwks: Value = serde_json::from_str(&jwks_text)?;

    sign_assertion(client_id, token_endpoint, &private_key, &key_id(&jwks)?, &smart.jku(), now)
}

fn sign_assertion(
    client_id: &str,
    token_endpoint: &str,
    private_key_pem: &[u8],
    kid: &str,
    jku: &str,
    now: DateTime<Utc>,
) -> Result<String> {
    let mut header = Header::new(Algorithm::RS384);
    header.typ = Some("JWT".to_string());
    header.kid = Some(kid.to_string());
    header.jku = Some(jku.to_string());

    let iat = now.timestamp();
    let claims = AssertionClaims {
        iss: client_id.to_string(),
        sub: client_id.to_string(),
        aud: token_endpoint.to_string(),
        exp: iat + ASSERTION_LIFETIME_SECS,
        iat,
        jti: uuid::Uuid::new_v4().to_string(),
    };

    let key = EncodingKey::from_rsa_pem(private_key_pem)
        .map_err(|e| ConnectorError::Authentication(format!("Invalid private key: {}", e)))?;
    jsonwebtoken::encode(&header, &claims, &key)
        .map_err(|e| ConnectorError::Authentication(format!("Failed to create JWT: {}", e)))
}

/// Form body of a client-credentials token request.
///
/// SMART sends the signed assertion, `client_credentials` sends the secret;
/// never both.
pub fn token_request_form(
    server: &FhirServerConfig,
    client_id: &str,
    client_assertion: Option<String>,
) -> Vec<(String, String)> {
    let mut form = vec![
        ("grant_type".to_string(), "client_credentials".to_string()),
        ("client_id".to_string(), client_id.to_string()),
    ];

    let scopes = match server.scopes.as_deref() {
        Some(scopes) if !scopes.is_empty() => Some(scopes),
        // Aidbox rejects requests without a scope
        _ if server.name == "Aidbox" => Some("system/*.read"),
        _ => None,
    };
    if let Some(scopes) = scopes {
        form.push(("scope".to_string(), scopes.to_string()));
    }

    match server.auth_type {
        AuthType::Smart => {
            if let Some(assertion) = client_assertion {
                form.push((
                    "client_assertion_type".to_string(),
                    CLIENT_ASSERTION_TYPE.to_string(),
                ));
                form.push(("client_assertion".to_string(), assertion));
            }
        }
        AuthType::ClientCredentials => {
            if let Some(secret) = server.client_secret.as_deref().filter(|s| !s.is_empty()) {
                form.push(("client_secret".to_string(), secret.to_string()));
            }
        }
        AuthType::None | AuthType::Basic => {}
    }

    form
}

/// Parse a token endpoint body into a token stamped against `now`
pub fn parse_token_response(body: &str, now: DateTime<Utc>) -> Result<AccessToken> {
    let response: TokenResponse = serde_json::from_str(body).map_err(|_| {
        ConnectorError::Authentication(format!("Invalid JSON response: {}", body))
    })?;
    let token = response
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            ConnectorError::Authentication(format!("No access token in response: {}", body))
        })?;
    Ok(AccessToken {
        token,
        expires_at: token_expiry(now, response.expires_in),
    })
}
