//! Patient discovery, patient records and the full patient query, run
//! against one configured FHIR server.

pub mod discovery;
pub mod full;
pub mod records;

use chrono::{DateTime, Utc};
use connector_core::{
    ConnectorError, PatientDemographics, QueryTimebox, Result, SavedQuery, resolve_timebox,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::Role;
use crate::fhir_client::{ClientSettings, FhirClient};
use crate::pipeline::Operation;
use crate::server_cache::ServerConfigCache;

pub use full::select_first_candidate;

pub const PATIENT_DISCOVERY: Operation =
    Operation::new("makePatientDiscoveryRequest", Role::Standard).audited();
pub const PATIENT_RECORDS: Operation =
    Operation::new("makePatientRecordsRequest", Role::Standard).audited();

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientDiscoveryRequest {
    pub fhir_server: String,
    #[serde(flatten)]
    pub demographics: PatientDemographics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientRecordsRequest {
    pub patient_id: String,
    pub fhir_server: String,
    pub query_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullPatientRequest {
    pub fhir_server: String,
    pub query_id: String,
    #[serde(flatten)]
    pub demographics: PatientDemographics,
}

impl FullPatientRequest {
    pub fn discovery(&self) -> PatientDiscoveryRequest {
        PatientDiscoveryRequest {
            fhir_server: self.fhir_server.clone(),
            demographics: self.demographics.clone(),
        }
    }

    pub fn records(&self, patient_id: &str) -> PatientRecordsRequest {
        PatientRecordsRequest {
            patient_id: patient_id.to_string(),
            fhir_server: self.fhir_server.clone(),
            query_id: self.query_id.clone(),
        }
    }
}

/// Shared collaborators of the query engines
#[derive(Clone)]
pub struct QueryEngine {
    servers: Arc<ServerConfigCache>,
    client_settings: Arc<ClientSettings>,
}

impl QueryEngine {
    pub fn new(servers: Arc<ServerConfigCache>, client_settings: Arc<ClientSettings>) -> Self {
        Self {
            servers,
            client_settings,
        }
    }

    /// Client for a configured server; fresh tokens are written back through
    /// the config cache
    pub async fn prepare_client(&self, server_name: &str) -> Result<Arc<FhirClient>> {
        let config = self
            .servers
            .find(server_name)
            .await?
            .ok_or_else(|| ConnectorError::UnknownServer(server_name.to_string()))?;
        let client = FhirClient::new(
            config,
            Arc::clone(&self.client_settings),
            Some(Arc::clone(&self.servers)),
        )?;
        Ok(Arc::new(client))
    }

    pub fn saved_query(&self, query_id: &str) -> Result<SavedQuery> {
        self.servers
            .store()
            .saved_query_by_id(query_id)?
            .ok_or_else(|| ConnectorError::QueryNotFound(query_id.to_string()))
    }

    /// Stored time windows for a query, relative ones re-anchored at `now`
    pub fn timebox(&self, query_id: &str, now: DateTime<Utc>) -> Result<QueryTimebox> {
        let settings = self.servers.store().timebox_settings(query_id)?;
        Ok(resolve_timebox(&settings, now))
    }
}
