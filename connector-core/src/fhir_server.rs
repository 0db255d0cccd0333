//! FHIR server connection settings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::patient_match::PatientMatchConfiguration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthType {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "basic")]
    Basic,
    #[serde(rename = "client_credentials")]
    ClientCredentials,
    #[serde(rename = "SMART")]
    Smart,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::None => "none",
            AuthType::Basic => "basic",
            AuthType::ClientCredentials => "client_credentials",
            AuthType::Smart => "SMART",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "basic" => AuthType::Basic,
            "client_credentials" => AuthType::ClientCredentials,
            "SMART" | "smart" => AuthType::Smart,
            _ => AuthType::None,
        }
    }

    /// Whether requests need an OAuth access token
    pub fn uses_token(&self) -> bool {
        matches!(self, AuthType::ClientCredentials | AuthType::Smart)
    }
}

/// A configured upstream FHIR server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FhirServerConfig {
    pub id: String,
    pub name: String,
    pub hostname: String,
    #[serde(default)]
    pub disable_cert_validation: bool,
    #[serde(default)]
    pub mutual_tls: bool,
    #[serde(default)]
    pub default_server: bool,
    #[serde(default)]
    pub last_connection_attempt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_connection_successful: Option<bool>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub scopes: Option<String>,
    #[serde(default, skip_serializing)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub token_expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub patient_match_configuration: Option<PatientMatchConfiguration>,
}

impl FhirServerConfig {
    pub fn new(name: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            hostname: hostname.into(),
            disable_cert_validation: false,
            mutual_tls: false,
            default_server: false,
            last_connection_attempt: None,
            last_connection_successful: None,
            headers: BTreeMap::new(),
            auth_type: AuthType::None,
            client_id: None,
            client_secret: None,
            token_endpoint: None,
            scopes: None,
            access_token: None,
            token_expiry: None,
            patient_match_configuration: None,
        }
    }

    /// `$match` settings when the server has them switched on
    pub fn match_settings(&self) -> Option<&PatientMatchConfiguration> {
        self.patient_match_configuration
            .as_ref()
            .filter(|c| c.enabled)
    }

    /// Cached token still valid at `now`
    pub fn valid_token(&self, now: DateTime<Utc>) -> Option<&str> {
        match (&self.access_token, self.token_expiry) {
            (Some(token), Some(expiry)) if expiry > now => Some(token.as_str()),
            _ => None,
        }
    }
}

/// Credentials and headers supplied when creating or editing a server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthData {
    pub auth_type: AuthType,
    pub bearer_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub token_endpoint: Option<String>,
    pub scopes: Option<String>,
    pub access_token: Option<String>,
    pub token_expiry: Option<DateTime<Utc>>,
    pub headers: BTreeMap<String, String>,
}

impl AuthData {
    /// Headers to persist.
    ///
    /// A caller-supplied `Authorization` header is dropped; the only way to set
    /// one is `basic` auth with a bearer token.
    pub fn effective_headers(&self) -> BTreeMap<String, String> {
        let mut headers: BTreeMap<String, String> = self
            .headers
            .iter()
            .filter(|(k, _)| !k.eq_ignore_ascii_case("authorization"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if self.auth_type == AuthType::Basic {
            if let Some(token) = self.bearer_token.as_deref().filter(|t| !t.is_empty()) {
                headers.insert("Authorization".to_string(), format!("Bearer {}", token));
            }
        }
        headers
    }
}

/// Input for inserting or updating a server configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FhirServerInput {
    pub name: String,
    pub hostname: String,
    pub disable_cert_validation: bool,
    pub mutual_tls: bool,
    pub default_server: bool,
    pub last_connection_successful: Option<bool>,
    pub auth_data: AuthData,
    pub patient_match_configuration: Option<PatientMatchConfiguration>,
}

impl FhirServerInput {
    pub fn new(name: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hostname: hostname.into(),
            ..Default::default()
        }
    }

    /// Build the config row this input describes under `id`
    pub fn into_config(self, id: String, now: DateTime<Utc>) -> FhirServerConfig {
        let headers = self.auth_data.effective_headers();
        FhirServerConfig {
            id,
            name: self.name,
            hostname: self.hostname,
            disable_cert_validation: self.disable_cert_validation,
            mutual_tls: self.mutual_tls,
            default_server: self.default_server,
            last_connection_attempt: Some(now),
            last_connection_successful: self.last_connection_successful,
            headers,
            auth_type: self.auth_data.auth_type,
            client_id: self.auth_data.client_id,
            client_secret: self.auth_data.client_secret,
            token_endpoint: self.auth_data.token_endpoint,
            scopes: self.auth_data.scopes,
            access_token: self.auth_data.access_token,
            token_expiry: self.auth_data.token_expiry,
            patient_match_configuration: self.patient_match_configuration,
        }
    }
}
