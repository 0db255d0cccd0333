use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid timestamp {value}: {source}")]
    Timestamp {
        value: String,
        source: chrono::ParseError,
    },

    #[error("{0}")]
    Other(String),
}

impl From<StoreError> for connector_core::ConnectorError {
    fn from(e: StoreError) -> Self {
        connector_core::ConnectorError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
