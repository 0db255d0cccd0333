use chrono::Utc;
use connector_core::{ConnectorError, CustomQuery, QueryResponse, ResponseMerger, Result};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::{PATIENT_RECORDS, PatientRecordsRequest, QueryEngine};
use crate::fhir_client::{FhirClient, FhirResponse};
use crate::pipeline::Pipeline;

impl QueryEngine {
    /// Run every search the saved query compiles to for one patient and merge
    /// the successful responses
    pub async fn patient_records_query(
        &self,
        pipeline: &Pipeline<'_>,
        request: &PatientRecordsRequest,
    ) -> Result<QueryResponse> {
        let input = serde_json::to_value(request)?;
        pipeline
            .run(&PATIENT_RECORDS, input, || async move {
                let saved_query = self.saved_query(&request.query_id)?;
                let timebox = self.timebox(&request.query_id, Utc::now())?;
                let client = self.prepare_client(&request.fhir_server).await?;

                let query = CustomQuery::new(
                    &saved_query.query_data,
                    &saved_query.medical_record_sections,
                    &timebox,
                    &request.patient_id,
                );
                debug!(
                    query = %saved_query.query_name,
                    patient = %request.patient_id,
                    searches = ?query.names(),
                    "Compiled patient records query"
                );
                fetch_records(&client, &query).await
            })
            .await
    }
}

/// Dispatch every compiled request concurrently and wait for all of them.
///
/// Transport failures and non-200 responses are logged and left out. A token
/// failure aborts the query, but only once every request has settled.
pub async fn fetch_records(client: &Arc<FhirClient>, query: &CustomQuery) -> Result<QueryResponse> {
    client.ensure_valid_token().await?;

    let mut posts = JoinSet::new();
    for request in query.compile_all_post_requests() {
        let client = Arc::clone(client);
        posts.spawn(async move { client.post(&request.base_path, &request.params).await });
    }

    let mut settled: Vec<Result<FhirResponse>> = client
        .get_batch(&query.compile_get_requests())
        .await?;
    while let Some(joined) = posts.join_next().await {
        match joined {
            Ok(result) => settled.push(result),
            Err(e) => error!("POST to FHIR query task failed: {}", e),
        }
    }

    let mut merger = ResponseMerger::new();
    let mut auth_error = None;
    for result in settled {
        match result {
            Ok(response) if response.is_ok() => match response.json() {
                Ok(body) => merger.add_bundle(&body),
                Err(e) => warn!(url = %response.url, "Unparseable FHIR response: {}", e),
            },
            Ok(response) => response.log_unusable("FHIR query failed"),
            Err(e @ ConnectorError::Authentication(_)) => {
                error!("FHIR query authentication failed: {}", e);
                auth_error.get_or_insert(e);
            }
            Err(e) => error!("POST to FHIR query promise rejected: {}", e),
        }
    }

    match auth_error {
        Some(e) => Err(e),
        None => Ok(merger.finish()),
    }
}
