//! Outbound HTTP to one configured FHIR server
//!
//! Each client owns its own reqwest client, so certificate-validation bypass
//! and the mutual TLS identity never leak into requests for other servers.
//! Non-2xx responses are logged and handed back; only network and token
//! failures are errors.

use chrono::Utc;
use connector_core::{AuthData, AuthType, ConnectorError, FhirServerConfig, Result};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap};
use serde::Serialize;
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{MtlsSettings, ServerConfig, SmartSettings};
use crate::server_cache::ServerConfigCache;
use crate::tls::MtlsCredentials;
use crate::token::{self, AccessToken};

/// Search used to check that a server answers authenticated searches
pub const CONNECTION_PROBE_PATH: &str =
    "/Patient?name=AuthenticatedServerConnectionTest&_summary=count&_count=1";

/// Name and id given to throwaway clients that must not persist tokens
const TEST_CLIENT_ID: &str = "test";

/// Transport settings shared by every client
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub timeout: Duration,
    pub smart: SmartSettings,
    pub mtls: MtlsSettings,
    pub relaxed_url_validation: bool,
}

impl ClientSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.http.timeout_secs),
            smart: config.smart.clone(),
            mtls: config.mtls.clone(),
            relaxed_url_validation: config.relaxed_url_validation(),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Raw upstream response
#[derive(Debug, Clone)]
pub struct FhirResponse {
    pub status: StatusCode,
    pub url: String,
    pub headers: HeaderMap,
    pub body: String,
}

impl FhirResponse {
    pub fn is_ok(&self) -> bool {
        self.status == StatusCode::OK
    }

    pub fn json(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.body)?)
    }

    /// Log a response that will not be used
    pub fn log_unusable(&self, context: &str) {
        warn!(
            status = %self.status,
            url = %self.url,
            body = %self.body,
            headers = ?self.headers,
            "{}",
            context
        );
    }
}

/// Outcome of a connection test, shown to administrators as-is
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionTestResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionTestResult {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchSupport {
    pub supports_match: bool,
    pub fhir_version: Option<String>,
}

#[derive(Default)]
struct AuthState {
    token: Option<AccessToken>,
    token_endpoint: Option<String>,
}

pub struct FhirClient {
    http: reqwest::Client,
    server: FhirServerConfig,
    settings: Arc<ClientSettings>,
    auth: Mutex<AuthState>,
    token_sink: Option<Arc<ServerConfigCache>>,
}

impl FhirClient {
    /// Client for a stored server. Fresh tokens are written back through
    /// `token_sink` when one is given.
    pub fn new(
        server: FhirServerConfig,
        settings: Arc<ClientSettings>,
        token_sink: Option<Arc<ServerConfigCache>>,
    ) -> Result<Self> {
        let http = build_http_client(&server, &settings)?;
        let auth = AuthState {
            token: server
                .valid_token(Utc::now())
                .map(|t| AccessToken {
                    token: t.to_string(),
                    expires_at: server.token_expiry.unwrap_or_else(Utc::now),
                }),
            token_endpoint: server.token_endpoint.clone().filter(|e| !e.is_empty()),
        };
        Ok(Self {
            http,
            server,
            settings,
            auth: Mutex::new(auth),
            token_sink,
        })
    }

    /// Throwaway client for connection tests; never persists tokens
    pub fn for_connection_test(
        url: &str,
        disable_cert_validation: bool,
        mutual_tls: bool,
        auth_data: Option<&AuthData>,
        settings: Arc<ClientSettings>,
    ) -> Result<Self> {
        let mut server = FhirServerConfig::new(TEST_CLIENT_ID, url);
        server.id = TEST_CLIENT_ID.to_string();
        server.disable_cert_validation = disable_cert_validation;
        server.mutual_tls = mutual_tls;

        if let Some(auth) = auth_data {
            server.headers = auth.effective_headers();
            server.auth_type = auth.auth_type;
            if auth.auth_type.uses_token() {
                server.client_id = auth.client_id.clone();
                server.token_endpoint = auth.token_endpoint.clone();
                server.scopes = auth.scopes.clone();
            }
            if auth.auth_type == AuthType::ClientCredentials {
                server.client_secret = auth.client_secret.clone();
            }
        }

        Self::new(server, settings, None)
    }

    pub fn server(&self) -> &FhirServerConfig {
        &self.server
    }

    /// Bearer token to attach, acquiring one when the cached token is gone or stale
    pub async fn ensure_valid_token(&self) -> Result<Option<String>> {
        if !self.server.auth_type.uses_token() {
            return Ok(None);
        }

        let mut state = self.auth.lock().await;
        let now = Utc::now();
        if let Some(token) = &state.token
            && token.expires_at > now
        {
            return Ok(Some(token.token.clone()));
        }

        let token = self.acquire_token(&mut state).await?;
        let bearer = token.token.clone();
        state.token = Some(token);
        Ok(Some(bearer))
    }

    async fn acquire_token(&self, state: &mut AuthState) -> Result<AccessToken> {
        let client_id = self
            .server
            .client_id
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                ConnectorError::Authentication(
                    "Client ID is required for authentication".to_string(),
                )
            })?;

        let token_endpoint = match state.token_endpoint.clone() {
            Some(endpoint) => endpoint,
            None if self.server.auth_type == AuthType::Smart => {
                let endpoint = self.discover_token_endpoint().await?;
                state.token_endpoint = Some(endpoint.clone());
                endpoint
            }
            None => {
                return Err(ConnectorError::Authentication(
                    "Token endpoint is required for authentication".to_string(),
                ));
            }
        };

        let now = Utc::now();
        let assertion = match self.server.auth_type {
            AuthType::Smart => Some(token::create_smart_jwt(
                client_id,
                &token_endpoint,
                &self.settings.smart,
                now,
            )?),
            _ => None,
        };
        let form = token::token_request_form(&self.server, client_id, assertion);

        let response = self
            .http
            .post(&token_endpoint)
            .header(ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                ConnectorError::Authentication(format!("Token request failed: {}", e))
            })?;
        let status = response.status();
        let text = response.text().await.map_err(|e| {
            ConnectorError::Authentication(format!("Token request failed: {}", e))
        })?;
        if !status.is_success() {
            return Err(ConnectorError::Authentication(format!(
                "Token request failed: {}",
                text
            )));
        }

        let token = token::parse_token_response(&text, now)?;
        info!(
            server = %self.server.name,
            expires_at = %token.expires_at,
            "Acquired access token"
        );

        if let Some(sink) = &self.token_sink
            && self.server.id != TEST_CLIENT_ID
            && let Err(e) = sink
                .persist_token(&self.server.name, &token.token, token.expires_at)
                .await
        {
            warn!(server = %self.server.name, "Failed to persist access token: {}", e);
        }

        Ok(token)
    }

    async fn discover_token_endpoint(&self) -> Result<String> {
        let url = self.url("/.well-known/smart-configuration");
        let discovery_failed =
            || ConnectorError::Authentication("Failed to discover token endpoint".to_string());

        let response = self.http.get(&url).send().await.map_err(|e| {
            warn!(url = %url, "Error discovering token endpoint: {}", e);
            discovery_failed()
        })?;
        if !response.status().is_success() {
            warn!(
                url = %url,
                status = %response.status(),
                "Failed to fetch SMART configuration"
            );
            return Err(discovery_failed());
        }
        let config: Value = response.json().await.map_err(|_| discovery_failed())?;
        config
            .get("token_endpoint")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| {
                warn!(url = %url, "Token endpoint not found in SMART configuration");
                discovery_failed()
            })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server.hostname.trim_end_matches('/'), path)
    }

    fn with_headers(
        &self,
        builder: reqwest::RequestBuilder,
        bearer: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let mut builder = builder;
        for (name, value) in &self.server.headers {
            if bearer.is_some() && name.eq_ignore_ascii_case(AUTHORIZATION.as_str()) {
                continue;
            }
            builder = builder.header(name, value);
        }
        match bearer {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder, url: &str) -> Result<FhirResponse> {
        let response = builder
            .send()
            .await
            .map_err(|e| ConnectorError::Transport(format!("Request to {} failed: {}", url, e)))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(|e| {
            ConnectorError::Transport(format!("Failed to read response from {}: {}", url, e))
        })?;

        let response = FhirResponse {
            status,
            url: url.to_string(),
            headers,
            body,
        };
        if status.is_success() {
            debug!(status = %status, url = %url, "FHIR response");
        } else {
            response.log_unusable("FHIR server returned an error response");
        }
        Ok(response)
    }

    pub async fn get(&self, path: &str) -> Result<FhirResponse> {
        let bearer = self.ensure_valid_token().await?;
        let url = self.url(path);
        let builder = self.with_headers(self.http.get(&url), bearer.as_deref());
        self.send(builder, &url).await
    }

    /// Concurrent GETs; results come back in the order of `paths`
    pub async fn get_batch(self: &Arc<Self>, paths: &[String]) -> Result<Vec<Result<FhirResponse>>> {
        self.ensure_valid_token().await?;

        let mut tasks = JoinSet::new();
        for (index, path) in paths.iter().cloned().enumerate() {
            let client = Arc::clone(self);
            tasks.spawn(async move { (index, client.get(&path).await) });
        }

        let mut results: Vec<Option<Result<FhirResponse>>> = paths.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => warn!("GET task failed: {}", e),
            }
        }
        Ok(results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(ConnectorError::Transport("GET task failed".into()))))
            .collect())
    }

    /// Form-encoded POST, used for `_search`
    pub async fn post(&self, path: &str, params: &[(String, String)]) -> Result<FhirResponse> {
        let bearer = self.ensure_valid_token().await?;
        let url = self.url(path);
        let builder = self.with_headers(self.http.post(&url).form(params), bearer.as_deref());
        self.send(builder, &url).await
    }

    /// JSON POST, used for `$match`
    pub async fn post_json(&self, path: &str, body: &Value) -> Result<FhirResponse> {
        let bearer = self.ensure_valid_token().await?;
        let url = self.url(path);
        let builder = self.with_headers(
            self.http
                .post(&url)
                .header(ACCEPT, "application/fhir+json")
                .json(body),
            bearer.as_deref(),
        );
        self.send(builder, &url).await
    }

    /// Check credentials and run an authenticated search against `url`
    pub async fn test_connection(
        url: &str,
        disable_cert_validation: bool,
        mutual_tls: bool,
        auth_data: Option<&AuthData>,
        settings: Arc<ClientSettings>,
    ) -> ConnectionTestResult {
        if let Err(e) = validate_fhir_server_url(url, settings.relaxed_url_validation) {
            return ConnectionTestResult::failed(validation_message(e));
        }

        let client = match Self::for_connection_test(
            url,
            disable_cert_validation,
            mutual_tls,
            auth_data,
            settings,
        ) {
            Ok(client) => client,
            Err(e) => return ConnectionTestResult::failed(e.to_string()),
        };

        if let Err(e) = client.ensure_valid_token().await {
            return ConnectionTestResult::failed(e.to_string());
        }

        let response = match client.get(CONNECTION_PROBE_PATH).await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %url, "Error testing FHIR connection: {}", e);
                return ConnectionTestResult::failed(
                    "Connection failed: Unable to reach the FHIR server. Please check if the URL is correct and the server is accessible.",
                );
            }
        };

        if !response.status.is_success() {
            return ConnectionTestResult::failed(connection_error_message(response.status));
        }

        match response.json() {
            Ok(body) if is_searchset(&body) => ConnectionTestResult::ok(),
            Ok(body) => {
                info!(
                    resource_type = ?body.get("resourceType"),
                    bundle_type = ?body.get("type"),
                    "Invalid response structure, expected Bundle/searchset"
                );
                ConnectionTestResult::failed(
                    "Invalid FHIR server response: Server did not return a valid search Bundle",
                )
            }
            Err(_) => ConnectionTestResult::failed("Failed to parse server response as JSON"),
        }
    }

    /// Read `/metadata` and report whether Patient `$match` is advertised
    pub async fn check_supports_match(
        url: &str,
        disable_cert_validation: bool,
        auth_data: Option<&AuthData>,
        settings: Arc<ClientSettings>,
    ) -> Result<MatchSupport> {
        validate_fhir_server_url(url, settings.relaxed_url_validation)?;
        let client =
            Self::for_connection_test(url, disable_cert_validation, false, auth_data, settings)?;

        let response = client.get("/metadata").await?;
        if !response.status.is_success() {
            return Ok(MatchSupport {
                supports_match: false,
                fhir_version: None,
            });
        }
        Ok(capability_match_support(&response.json()?))
    }
}

fn build_http_client(server: &FhirServerConfig, settings: &ClientSettings) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(settings.timeout);

    if server.mutual_tls {
        let credentials = MtlsCredentials::load(&settings.mtls)?;
        builder = builder.identity(credentials.identity()?);
        if let Some(ca) = credentials.ca_certificate()? {
            builder = builder.add_root_certificate(ca);
        }
    }

    if server.disable_cert_validation {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder
        .build()
        .map_err(|e| ConnectorError::Transport(format!("Failed to build HTTP client: {}", e)))
}

fn is_searchset(body: &Value) -> bool {
    body.get("resourceType").and_then(Value::as_str) == Some("Bundle")
        && body.get("type").and_then(Value::as_str) == Some("searchset")
}

fn validation_message(error: ConnectorError) -> String {
    match error {
        ConnectorError::InvalidRequest(message) => message,
        other => other.to_string(),
    }
}

/// Administrator-facing text for a failed connection probe
pub fn connection_error_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Connection failed: Authentication required. Please check your credentials.".to_string(),
        403 => "Connection failed: Access forbidden. You do not have permission to access this FHIR server.".to_string(),
        404 => "Connection failed: The FHIR server endpoint was not found. Please verify the URL.".to_string(),
        408 => "Connection failed: The request timed out. The FHIR server took too long to respond.".to_string(),
        500 => "Connection failed: Internal server error. The FHIR server encountered an unexpected condition.".to_string(),
        502 => "Connection failed: Bad gateway. The FHIR server received an invalid response from upstream.".to_string(),
        503 => "Connection failed: The FHIR server is temporarily unavailable or under maintenance.".to_string(),
        504 => "Connection failed: Gateway timeout. The upstream server did not respond in time.".to_string(),
        _ => format!(
            "Connection failed: The FHIR server returned an error. ({} {})",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        ),
    }
}

/// Reject URLs a configured FHIR server may not use.
///
/// `relaxed` (demo mode, local deployments, auth disabled) allows plain http
/// and localhost; private IPv4 literals are always rejected.
pub fn validate_fhir_server_url(url: &str, relaxed: bool) -> Result<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|_| ConnectorError::InvalidRequest("Invalid URL format".to_string()))?;
    let host = parsed
        .host_str()
        .unwrap_or("")
        .trim_start_matches('[')
        .trim_end_matches(']');

    if !relaxed {
        if parsed.scheme() != "https" {
            return Err(ConnectorError::InvalidRequest(
                "Only HTTPS protocol is allowed for FHIR server URLs.".to_string(),
            ));
        }
        if matches!(host, "localhost" | "127.0.0.1" | "::1") {
            return Err(ConnectorError::InvalidRequest(
                "Localhost addresses not allowed in production settings".to_string(),
            ));
        }
    }

    if let Ok(IpAddr::V4(ip)) = host.parse::<IpAddr>()
        && ip.is_private()
    {
        return Err(ConnectorError::InvalidRequest(
            "Private IP addresses are not allowed.".to_string(),
        ));
    }
    Ok(())
}

/// Inspect a CapabilityStatement for a Patient `match` operation
pub fn capability_match_support(capability: &Value) -> MatchSupport {
    let is_match = |op: &Value| {
        op.get("name").and_then(Value::as_str) == Some("match")
            || op
                .get("definition")
                .and_then(Value::as_str)
                .is_some_and(|d| d.ends_with("Patient-match"))
    };

    let supports_match = capability
        .get("rest")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .any(|rest| {
            let server_level = rest
                .get("operation")
                .and_then(Value::as_array)
                .is_some_and(|ops| ops.iter().any(is_match));
            let patient_level = rest
                .get("resource")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter(|r| r.get("type").and_then(Value::as_str) == Some("Patient"))
                .any(|r| {
                    r.get("operation")
                        .and_then(Value::as_array)
                        .is_some_and(|ops| ops.iter().any(is_match))
                });
            server_level || patient_level
        });

    MatchSupport {
        supports_match,
        fhir_version: capability
            .get("fhirVersion")
            .and_then(Value::as_str)
            .map(String::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_url_validation_strict() {
        assert!(validate_fhir_server_url("https://fhir.example.org/r4", false).is_ok());
        let err = validate_fhir_server_url("http://fhir.example.org", false).unwrap_err();
        assert_eq!(
            validation_message(err),
            "Only HTTPS protocol is allowed for FHIR server URLs."
        );
        let err = validate_fhir_server_url("https://localhost:8080/fhir", false).unwrap_err();
        assert_eq!(
            validation_message(err),
            "Localhost addresses not allowed in production settings"
        );
        let err = validate_fhir_server_url("not a url", false).unwrap_err();
        assert_eq!(validation_message(err), "Invalid URL format");
    }

    #[test]
    fn test_url_validation_relaxed() {
        assert!(validate_fhir_server_url("http://localhost:8080/fhir", true).is_ok());
        assert!(validate_fhir_server_url("http://127.0.0.1:8080/fhir", true).is_ok());
        for url in [
            "http://10.0.0.5/fhir",
            "http://192.168.1.20/fhir",
            "http://172.20.0.1/fhir",
        ] {
            let err = validate_fhir_server_url(url, true).unwrap_err();
            assert_eq!(validation_message(err), "Private IP addresses are not allowed.");
        }
        assert!(validate_fhir_server_url("http://172.32.0.1/fhir", true).is_ok());
    }

    #[test]
    fn test_connection_error_messages() {
        assert!(connection_error_message(StatusCode::UNAUTHORIZED).contains("Authentication required"));
        assert!(connection_error_message(StatusCode::SERVICE_UNAVAILABLE).contains("maintenance"));
        assert_eq!(
            connection_error_message(StatusCode::IM_A_TEAPOT),
            "Connection failed: The FHIR server returned an error. (418 I'm a teapot)"
        );
    }

    #[test]
    fn test_capability_match_support() {
        let capability = json!({
            "resourceType": "CapabilityStatement",
            "fhirVersion": "4.0.1",
            "rest": [{
                "mode": "server",
                "resource": [
                    {"type": "Observation"},
                    {"type": "Patient", "operation": [
                        {"name": "match", "definition": "http://hl7.org/fhir/OperationDefinition/Patient-match"}
                    ]}
                ]
            }]
        });
        assert_eq!(
            capability_match_support(&capability),
            MatchSupport {
                supports_match: true,
                fhir_version: Some("4.0.1".to_string())
            }
        );

        let without = json!({"resourceType": "CapabilityStatement", "rest": [{"resource": [{"type": "Patient"}]}]});
        assert!(!capability_match_support(&without).supports_match);
    }

    #[test]
    fn test_connection_test_client_keeps_secret_for_client_credentials_only() {
        let settings = Arc::new(ClientSettings::default());
        let mut auth = AuthData {
            auth_type: AuthType::Smart,
            client_id: Some("qc".into()),
            client_secret: Some("s3cret".into()),
            ..Default::default()
        };
        let smart = FhirClient::for_connection_test(
            "https://fhir.example.org",
            false,
            false,
            Some(&auth),
            Arc::clone(&settings),
        )
        .unwrap();
        assert_eq!(smart.server().client_secret, None);
        assert_eq!(smart.server().id, "test");

        auth.auth_type = AuthType::ClientCredentials;
        let cc = FhirClient::for_connection_test(
            "https://fhir.example.org",
            false,
            false,
            Some(&auth),
            settings,
        )
        .unwrap();
        assert_eq!(cc.server().client_secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_basic_bearer_becomes_header() {
        let auth = AuthData {
            auth_type: AuthType::Basic,
            bearer_token: Some("tok".into()),
            headers: BTreeMap::from([("X-Tenant".to_string(), "t1".to_string())]),
            ..Default::default()
        };
        let client = FhirClient::for_connection_test(
            "https://fhir.example.org",
            true,
            false,
            Some(&auth),
            Arc::new(ClientSettings::default()),
        )
        .unwrap();
        assert_eq!(
            client.server().headers.get("Authorization").map(String::as_str),
            Some("Bearer tok")
        );
        assert!(client.server().disable_cert_validation);
    }

    #[tokio::test]
    async fn test_no_token_for_unauthenticated_server() {
        let client = FhirClient::new(
            FhirServerConfig::new("open", "https://open.example.org"),
            Arc::new(ClientSettings::default()),
            None,
        )
        .unwrap();
        assert_eq!(client.ensure_valid_token().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cached_token_reused() {
        let mut server = FhirServerConfig::new("cc", "https://cc.example.org");
        server.auth_type = AuthType::ClientCredentials;
        server.access_token = Some("still-good".into());
        server.token_expiry = Some(Utc::now() + chrono::Duration::minutes(10));
        let client = FhirClient::new(server, Arc::new(ClientSettings::default()), None).unwrap();
        assert_eq!(
            client.ensure_valid_token().await.unwrap().as_deref(),
            Some("still-good")
        );
    }

    #[tokio::test]
    async fn test_missing_client_id_fails() {
        let mut server = FhirServerConfig::new("cc", "https://cc.example.org");
        server.auth_type = AuthType::ClientCredentials;
        let client = FhirClient::new(server, Arc::new(ClientSettings::default()), None).unwrap();
        let err = client.ensure_valid_token().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Authentication failed: Client ID is required for authentication"
        );
    }
}
