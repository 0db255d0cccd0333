use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::auth::Role;

/// Service configuration loaded from YAML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSettings,
    pub auth: AuthSettings,
    pub storage: StorageSettings,
    pub log: LogSettings,
    pub smart: SmartSettings,
    pub mtls: MtlsSettings,
    pub http: HttpSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsSettings>,
    /// Allow plain-http, localhost and private-network FHIR server URLs
    pub demo_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub enabled: bool,
    pub api_keys: Vec<ApiKey>,
    pub basic_auth: Vec<BasicAuthUser>,
    pub jwt: Option<JwtSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtSettings {
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub secret: Option<String>,
    /// JWKS endpoint of the identity provider, e.g.
    /// "https://keycloak.example.com/realms/master/protocol/openid-connect/certs"
    pub jwk_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub name: String,
    pub key: String,
    #[serde(default = "default_api_role")]
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicAuthUser {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub role: Role,
}

fn default_api_role() -> Role {
    Role::Standard
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
    pub connector_db: String,
    pub audit_db: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
}

/// Key material for SMART backend-services client assertions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartSettings {
    pub private_key_file: PathBuf,
    pub jwks_file: PathBuf,
    /// Public base URL of this service; the assertion's `jku` points at
    /// `<app_hostname>/.well-known/jwks.json`
    pub app_hostname: Option<String>,
}

/// Client certificate presented to servers configured for mutual TLS
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MtlsSettings {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub ca_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            tls: None,
            demo_mode: false,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            connector_db: "connector.sqlite".to_string(),
            audit_db: "audit.sqlite".to_string(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Used by local JWKS generation when no app hostname is set
pub const DEFAULT_LOCAL_JWKS_URL: &str = "http://query-connector:3000/.well-known/jwks.json";

impl Default for SmartSettings {
    fn default() -> Self {
        Self {
            private_key_file: PathBuf::from("keys/rsa-private.pem"),
            jwks_file: PathBuf::from("keys/jwks.json"),
            app_hostname: None,
        }
    }
}

impl Default for MtlsSettings {
    fn default() -> Self {
        Self {
            cert_file: PathBuf::from("keys/mtls-cert.pem"),
            key_file: PathBuf::from("keys/mtls-key.pem"),
            ca_file: PathBuf::from("keys/mtls-ca.pem"),
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl SmartSettings {
    /// JWK Set URL advertised in SMART client assertions
    pub fn jku(&self) -> String {
        match &self.app_hostname {
            Some(host) => format!("{}/.well-known/jwks.json", host.trim_end_matches('/')),
            None => DEFAULT_LOCAL_JWKS_URL.to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file
    pub fn load_from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = if let Some(path) = config_path {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };

        // Override with environment variables
        if let Ok(port) = std::env::var("QC_PORT")
            && let Ok(port_num) = port.parse()
        {
            config.server.port = port_num;
        }

        if let Ok(host) = std::env::var("QC_HOST") {
            config.server.host = host;
        }

        if let Ok(data_dir) = std::env::var("QC_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(level) = std::env::var("QC_LOG_LEVEL") {
            config.log.level = level;
        }

        if let Ok(enabled) = std::env::var("QC_AUTH_ENABLED")
            && let Ok(enabled) = enabled.parse()
        {
            config.auth.enabled = enabled;
        }

        if let Ok(demo) = std::env::var("QC_DEMO_MODE")
            && let Ok(demo) = demo.parse()
        {
            config.server.demo_mode = demo;
        }

        if let Ok(hostname) = std::env::var("QC_APP_HOSTNAME") {
            config.smart.app_hostname = Some(hostname);
        }

        if let Ok(timeout) = std::env::var("QC_HTTP_TIMEOUT_SECS")
            && let Ok(timeout) = timeout.parse()
        {
            config.http.timeout_secs = timeout;
        }

        Ok(config)
    }

    /// Get the full path to the connector database
    pub fn connector_db_path(&self) -> PathBuf {
        self.storage.data_dir.join(&self.storage.connector_db)
    }

    /// Get the full path to the audit database
    pub fn audit_db_path(&self) -> PathBuf {
        self.storage.data_dir.join(&self.storage.audit_db)
    }

    /// Whether FHIR server URLs skip the https / public-address checks
    pub fn relaxed_url_validation(&self) -> bool {
        let local_app = self
            .smart
            .app_hostname
            .as_deref()
            .is_some_and(|h| h.contains("localhost"));
        local_app || self.server.demo_mode || !self.auth.enabled
    }
}
