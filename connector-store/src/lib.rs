pub mod error;
pub mod fhir_servers;
pub mod saved_queries;
pub mod sqlite_audit;
pub mod sqlite_store;
pub mod timebox;

pub use error::{Result, StoreError};
pub use sqlite_audit::{AuditLog, AuditRecord};
pub use sqlite_store::{SqliteStore, TransactionOps};
