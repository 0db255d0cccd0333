pub mod fhir_servers;
pub mod saved_queries;

pub use fhir_servers::{ConnectionTestRequest, FhirServerService};
pub use saved_queries::SavedQueryService;
