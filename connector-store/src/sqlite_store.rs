//! SQLite-backed configuration store
//!
//! Schema:
//!   - fhir_servers: upstream server configuration, one row per server name
//!   - query: saved queries, with query data kept as JSON
//!   - query_timeboxing: time-window settings per (query, concept type)
//!   - usergroup_to_query: group links, removed with their query

use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction};
use std::ops::Deref;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS fhir_servers (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    hostname TEXT NOT NULL,
    disable_cert_validation INTEGER NOT NULL DEFAULT 0,
    mutual_tls INTEGER NOT NULL DEFAULT 0,
    default_server INTEGER NOT NULL DEFAULT 0,
    last_connection_attempt TEXT,
    last_connection_successful INTEGER,
    headers TEXT NOT NULL DEFAULT '{}',
    auth_type TEXT NOT NULL DEFAULT 'none',
    client_id TEXT,
    client_secret TEXT,
    token_endpoint TEXT,
    scopes TEXT,
    access_token TEXT,
    token_expiry TEXT,
    patient_match_configuration TEXT
);

CREATE TABLE IF NOT EXISTS query (
    id TEXT PRIMARY KEY,
    query_name TEXT NOT NULL UNIQUE,
    query_data TEXT NOT NULL,
    conditions_list TEXT NOT NULL,
    medical_record_sections TEXT NOT NULL,
    author TEXT,
    date_created TEXT NOT NULL,
    date_last_modified TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS query_timeboxing (
    query_id TEXT NOT NULL,
    concept_type TEXT NOT NULL,
    time_window_start TEXT NOT NULL,
    time_window_end TEXT NOT NULL,
    is_relative_range INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (query_id, concept_type)
);

CREATE TABLE IF NOT EXISTS usergroup_to_query (
    usergroup_id TEXT NOT NULL,
    query_id TEXT NOT NULL,
    PRIMARY KEY (usergroup_id, query_id)
);

CREATE INDEX IF NOT EXISTS idx_usergroup_query ON usergroup_to_query(query_id);
"#;

/// SQLite-backed store for server configuration and saved queries
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

#[allow(clippy::result_large_err)]
impl SqliteStore {
    /// Open the store (create if not exists)
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;

        // Enable WAL mode for read-write concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = %path.display(), "Connector store schema ready");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Other("store connection lock poisoned".into()))
    }

    /// Execute multiple operations atomically within an SQLite transaction.
    ///
    /// Commits when `f` returns `Ok`; any error drops the transaction, which
    /// rolls it back.
    pub fn in_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&TransactionOps<'_>) -> Result<T>,
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let ops = TransactionOps { tx: &tx };
        match f(&ops) {
            Ok(result) => {
                tx.commit()?;
                Ok(result)
            }
            Err(e) => {
                tracing::warn!("Rolling back store transaction: {}", e);
                Err(e)
            }
        }
    }
}

/// Operations available within a transaction
pub struct TransactionOps<'a> {
    tx: &'a Transaction<'a>,
}

impl TransactionOps<'_> {
    pub(crate) fn conn(&self) -> &Connection {
        self.tx.deref()
    }
}

pub(crate) fn to_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339()
}

#[allow(clippy::result_large_err)]
pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|source| StoreError::Timestamp {
            value: value.to_string(),
            source,
        })
}

#[allow(clippy::result_large_err)]
pub(crate) fn parse_optional_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_timestamp).transpose()
}
