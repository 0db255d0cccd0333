pub mod custom_query;
pub mod demographics;
pub mod error;
pub mod fhir_server;
pub mod merge;
pub mod operation_outcome;
pub mod patient_match;
pub mod resource;
pub mod saved_query;
pub mod valueset;

pub use custom_query::{CustomQuery, FhirRequest, HttpMethod};
pub use demographics::{PatientDemographics, format_phone_as_digits, phone_query_formats};
pub use error::{ConnectorError, Result};
pub use fhir_server::{AuthData, AuthType, FhirServerConfig, FhirServerInput};
pub use merge::{QueryResponse, ResponseMerger, merge_responses};
pub use operation_outcome::{
    CodeableConcept, IssueSeverity, IssueType, OperationOutcome, OperationOutcomeIssue,
};
pub use patient_match::{DiscoveryResult, PatientMatchConfiguration};
pub use resource::{Resource, is_fhir_resource};
pub use saved_query::{
    MedicalRecordSections, QueryData, QueryTimebox, SavedQuery, TimeWindow, TimeboxSetting,
    resolve_timebox,
};
pub use valueset::{Concept, ConceptType, DibbsValueSet};
