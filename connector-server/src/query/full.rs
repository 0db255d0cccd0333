use connector_core::{ConnectorError, DiscoveryResult, QueryResponse, Resource, Result};
use tracing::info;

use super::{FullPatientRequest, QueryEngine};
use crate::pipeline::Pipeline;

/// Candidate whose records are fetched: always the first one the server
/// returned
pub fn select_first_candidate(candidates: &[Resource]) -> Option<&Resource> {
    candidates.first()
}

impl QueryEngine {
    /// Discovery, then records for the selected candidate. The result holds
    /// that candidate alone under `Patient`, ahead of its records.
    pub async fn full_patient_query(
        &self,
        pipeline: &Pipeline<'_>,
        request: &FullPatientRequest,
    ) -> Result<QueryResponse> {
        let candidates = match self
            .patient_discovery_query(pipeline, &request.discovery())
            .await?
        {
            DiscoveryResult::Patients(patients) if !patients.is_empty() => patients,
            DiscoveryResult::Patients(_) => return Err(ConnectorError::PatientNotFound),
            DiscoveryResult::UncertainMatch => {
                info!(server = %request.fhir_server, "Uncertain match; not fetching records");
                return Err(ConnectorError::PatientNotFound);
            }
        };

        let (selected, patient_id) = select_first_candidate(&candidates)
            .and_then(|p| p.id.clone().map(|id| (p.clone(), id)))
            .ok_or(ConnectorError::PatientNotFound)?;
        if candidates.len() > 1 {
            info!(
                server = %request.fhir_server,
                candidates = candidates.len(),
                patient = %patient_id,
                "Several candidates found; using the first"
            );
        }

        let mut response = self
            .patient_records_query(pipeline, &request.records(&patient_id))
            .await?;
        response.set_front("Patient", vec![selected]);
        Ok(response)
    }
}
