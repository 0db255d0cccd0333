//! SQLite-based audit log
//!
//! Separate file for easy management and rotation. Rows are append-only.

use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

/// One audited operation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub action_type: String,
    pub actor: String,
    /// Operation arguments, serialized
    pub input: Value,
    pub success: bool,
    pub error_message: Option<String>,
}

impl AuditRecord {
    pub fn success(action_type: &str, actor: &str, input: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            action_type: action_type.to_string(),
            actor: actor.to_string(),
            input,
            success: true,
            error_message: None,
        }
    }

    pub fn failure(action_type: &str, actor: &str, input: Value, error: &str) -> Self {
        Self {
            error_message: Some(error.to_string()),
            success: false,
            ..Self::success(action_type, actor, input)
        }
    }
}

/// Audit log
pub struct AuditLog {
    conn: Connection,
}

#[allow(clippy::result_large_err)]
impl AuditLog {
    /// Open the audit log (create if not exists)
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let audit = Self { conn };
        audit.initialize()?;
        Ok(audit)
    }

    /// Initialize tables
    fn initialize(&self) -> Result<()> {
        self.conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS audit_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                action_type TEXT NOT NULL,
                actor TEXT NOT NULL,
                input TEXT NOT NULL,
                success INTEGER NOT NULL,
                error_message TEXT
            )
            "#,
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_logs(timestamp)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit_logs(actor)",
            [],
        )?;

        Ok(())
    }

    /// Record an audit log entry
    pub fn log(&self, record: &AuditRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO audit_logs
            (timestamp, action_type, actor, input, success, error_message)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.timestamp.to_rfc3339(),
                record.action_type,
                record.actor,
                serde_json::to_string(&record.input)?,
                record.success,
                record.error_message,
            ],
        )?;

        Ok(())
    }

    /// Get recent audit log entries, newest first
    pub fn recent_entries(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp, action_type, actor, input, success, error_message
            FROM audit_logs
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, bool>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (timestamp, action_type, actor, input, success, error_message) = row?;
            let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                .map_err(|source| StoreError::Timestamp {
                    value: timestamp.clone(),
                    source,
                })?
                .with_timezone(&Utc);
            entries.push(AuditRecord {
                timestamp,
                action_type,
                actor,
                input: serde_json::from_str(&input)?,
                success,
                error_message,
            });
        }

        Ok(entries)
    }
}
