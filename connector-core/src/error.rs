use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("FHIR server {0} is not configured")]
    UnknownServer(String),

    #[error("Unable to find saved query {0}")]
    QueryNotFound(String),

    #[error("{0}")]
    MissingIdentifiers(String),

    #[error("Patient not found in full patient discovery")]
    PatientNotFound,

    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConnectorError>;
