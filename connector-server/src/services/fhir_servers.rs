//! FHIR server configuration management
//!
//! Every mutation invalidates the config cache once the transaction commits.

use chrono::Utc;
use connector_core::{AuthData, ConnectorError, FhirServerConfig, FhirServerInput, Result};
use serde_json::json;
use std::sync::Arc;

use crate::auth::Role;
use crate::fhir_client::{
    ClientSettings, ConnectionTestResult, FhirClient, MatchSupport, validate_fhir_server_url,
};
use crate::pipeline::{Operation, Pipeline};
use crate::server_cache::ServerConfigCache;
use crate::tls::mtls_available;

pub const LIST_CONFIGS: Operation = Operation::new("getFhirServerConfigs", Role::SuperAdmin);
pub const SERVER_NAMES: Operation = Operation::new("getFhirServerNames", Role::Standard);
pub const CONFIG_BY_NAME: Operation = Operation::new("getFhirServerConfig", Role::SuperAdmin);
pub const INSERT_SERVER: Operation =
    Operation::new("insertFhirServer", Role::SuperAdmin).audited();
pub const UPDATE_SERVER: Operation =
    Operation::new("updateFhirServer", Role::SuperAdmin).audited();
pub const DELETE_SERVER: Operation =
    Operation::new("deleteFhirServer", Role::SuperAdmin).audited();
pub const UPDATE_CONNECTION_STATUS: Operation =
    Operation::new("updateFhirServerConnectionStatus", Role::SuperAdmin);
pub const TEST_CONNECTION: Operation =
    Operation::new("testFhirServerConnection", Role::SuperAdmin);
pub const CHECK_MATCH: Operation =
    Operation::new("checkFhirServerSupportsMatch", Role::SuperAdmin);

/// Connection parameters of a server that may not be saved yet
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionTestRequest {
    pub url: String,
    pub disable_cert_validation: bool,
    pub mutual_tls: bool,
    pub auth_data: Option<AuthData>,
}

#[derive(Clone)]
pub struct FhirServerService {
    servers: Arc<ServerConfigCache>,
    client_settings: Arc<ClientSettings>,
}

impl FhirServerService {
    pub fn new(servers: Arc<ServerConfigCache>, client_settings: Arc<ClientSettings>) -> Self {
        Self {
            servers,
            client_settings,
        }
    }

    pub async fn list_configs(&self, pipeline: &Pipeline<'_>) -> Result<Vec<FhirServerConfig>> {
        pipeline
            .run(&LIST_CONFIGS, json!({}), || async move {
                Ok((*self.servers.configs().await?).clone())
            })
            .await
    }

    /// Names of all configured servers, the default server first
    pub async fn server_names(&self, pipeline: &Pipeline<'_>) -> Result<Vec<String>> {
        pipeline
            .run(&SERVER_NAMES, json!({}), || async move {
                let mut configs = (*self.servers.configs().await?).clone();
                configs.sort_by_key(|c| !c.default_server);
                Ok(configs.into_iter().map(|c| c.name).collect())
            })
            .await
    }

    pub async fn config_by_name(
        &self,
        pipeline: &Pipeline<'_>,
        name: &str,
    ) -> Result<Option<FhirServerConfig>> {
        pipeline
            .run(&CONFIG_BY_NAME, json!({"name": name}), || async move {
                self.servers.find(name).await
            })
            .await
    }

    pub async fn insert(
        &self,
        pipeline: &Pipeline<'_>,
        input: FhirServerInput,
    ) -> Result<FhirServerConfig> {
        self.validate(&input)?;
        let audit_input = serde_json::to_value(&input)?;
        let config = pipeline
            .run_in_transaction(&INSERT_SERVER, audit_input, self.servers.store(), |ops| {
                ops.insert_fhir_server(input, Utc::now())
            })
            .await?;
        self.servers.invalidate().await;
        Ok(config)
    }

    /// Replace a server's settings. Credentials left out of `input` keep their
    /// stored values, since they are never sent back to clients.
    pub async fn update(
        &self,
        pipeline: &Pipeline<'_>,
        id: &str,
        mut input: FhirServerInput,
    ) -> Result<FhirServerConfig> {
        self.validate(&input)?;
        let mut audit_input = serde_json::to_value(&input)?;
        audit_input["id"] = json!(id);
        let config = pipeline
            .run_in_transaction(&UPDATE_SERVER, audit_input, self.servers.store(), |ops| {
                if let Some(existing) = ops.fhir_server_by_id(id)? {
                    keep_stored_credentials(&mut input.auth_data, &existing);
                }
                ops.update_fhir_server(id, input, Utc::now())
            })
            .await?;
        self.servers.invalidate().await;
        Ok(config)
    }

    pub async fn delete(&self, pipeline: &Pipeline<'_>, id: &str) -> Result<()> {
        pipeline
            .run_in_transaction(&DELETE_SERVER, json!({"id": id}), self.servers.store(), |ops| {
                ops.delete_fhir_server(id)
            })
            .await?;
        self.servers.invalidate().await;
        Ok(())
    }

    pub async fn update_connection_status(
        &self,
        pipeline: &Pipeline<'_>,
        name: &str,
        successful: bool,
    ) -> Result<FhirServerConfig> {
        let input = json!({"name": name, "wasSuccessful": successful});
        let config = pipeline
            .run_in_transaction(&UPDATE_CONNECTION_STATUS, input, self.servers.store(), |ops| {
                ops.update_connection_status(name, successful, Utc::now())
            })
            .await?;
        self.servers.invalidate().await;
        Ok(config)
    }

    pub async fn test_connection(
        &self,
        pipeline: &Pipeline<'_>,
        request: &ConnectionTestRequest,
    ) -> Result<ConnectionTestResult> {
        let input = serde_json::to_value(request)?;
        pipeline
            .run(&TEST_CONNECTION, input, || async move {
                Ok(FhirClient::test_connection(
                    &request.url,
                    request.disable_cert_validation,
                    request.mutual_tls,
                    request.auth_data.as_ref(),
                    Arc::clone(&self.client_settings),
                )
                .await)
            })
            .await
    }

    pub async fn check_supports_match(
        &self,
        pipeline: &Pipeline<'_>,
        request: &ConnectionTestRequest,
    ) -> Result<MatchSupport> {
        let input = serde_json::to_value(request)?;
        pipeline
            .run(&CHECK_MATCH, input, || async move {
                FhirClient::check_supports_match(
                    &request.url,
                    request.disable_cert_validation,
                    request.auth_data.as_ref(),
                    Arc::clone(&self.client_settings),
                )
                .await
            })
            .await
    }

    fn validate(&self, input: &FhirServerInput) -> Result<()> {
        if input.name.trim().is_empty() {
            return Err(ConnectorError::InvalidRequest(
                "FHIR server name is required".to_string(),
            ));
        }
        if input.mutual_tls && !mtls_available(&self.client_settings.mtls) {
            return Err(ConnectorError::InvalidRequest(
                "Mutual TLS requires a client certificate and key in the keys directory or the MTLS_CERT and MTLS_KEY environment variables".to_string(),
            ));
        }
        validate_fhir_server_url(&input.hostname, self.client_settings.relaxed_url_validation)
    }
}

fn keep_stored_credentials(auth: &mut AuthData, existing: &FhirServerConfig) {
    if auth.auth_type != existing.auth_type {
        return;
    }
    if auth.client_secret.is_none() {
        auth.client_secret = existing.client_secret.clone();
    }
    if auth.access_token.is_none() {
        auth.access_token = existing.access_token.clone();
        auth.token_expiry = existing.token_expiry;
    }
    if auth.bearer_token.is_none()
        && let Some(header) = existing.headers.get("Authorization")
    {
        auth.bearer_token = header.strip_prefix("Bearer ").map(String::from);
    }
}
