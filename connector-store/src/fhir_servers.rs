//! FHIR server configuration rows

use chrono::{DateTime, Utc};
use connector_core::{AuthType, FhirServerConfig, FhirServerInput, PatientMatchConfiguration};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::BTreeMap;

use crate::error::{Result, StoreError};
use crate::sqlite_store::{
    SqliteStore, TransactionOps, parse_optional_timestamp, to_timestamp,
};

const SELECT_COLUMNS: &str = "id, name, hostname, disable_cert_validation, mutual_tls, \
    default_server, last_connection_attempt, last_connection_successful, headers, auth_type, \
    client_id, client_secret, token_endpoint, scopes, access_token, token_expiry, \
    patient_match_configuration";

/// Raw column values, decoded into a config once the row is released
struct ServerRow {
    id: String,
    name: String,
    hostname: String,
    disable_cert_validation: bool,
    mutual_tls: bool,
    default_server: bool,
    last_connection_attempt: Option<String>,
    last_connection_successful: Option<bool>,
    headers: String,
    auth_type: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    token_endpoint: Option<String>,
    scopes: Option<String>,
    access_token: Option<String>,
    token_expiry: Option<String>,
    patient_match_configuration: Option<String>,
}

impl ServerRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            hostname: row.get(2)?,
            disable_cert_validation: row.get(3)?,
            mutual_tls: row.get(4)?,
            default_server: row.get(5)?,
            last_connection_attempt: row.get(6)?,
            last_connection_successful: row.get(7)?,
            headers: row.get(8)?,
            auth_type: row.get(9)?,
            client_id: row.get(10)?,
            client_secret: row.get(11)?,
            token_endpoint: row.get(12)?,
            scopes: row.get(13)?,
            access_token: row.get(14)?,
            token_expiry: row.get(15)?,
            patient_match_configuration: row.get(16)?,
        })
    }

    #[allow(clippy::result_large_err)]
    fn into_config(self) -> Result<FhirServerConfig> {
        let headers: BTreeMap<String, String> = serde_json::from_str(&self.headers)?;
        let patient_match_configuration: Option<PatientMatchConfiguration> = self
            .patient_match_configuration
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(FhirServerConfig {
            id: self.id,
            name: self.name,
            hostname: self.hostname,
            disable_cert_validation: self.disable_cert_validation,
            mutual_tls: self.mutual_tls,
            default_server: self.default_server,
            last_connection_attempt: parse_optional_timestamp(self.last_connection_attempt)?,
            last_connection_successful: self.last_connection_successful,
            headers,
            auth_type: AuthType::parse(&self.auth_type),
            client_id: self.client_id,
            client_secret: self.client_secret,
            token_endpoint: self.token_endpoint,
            scopes: self.scopes,
            access_token: self.access_token,
            token_expiry: parse_optional_timestamp(self.token_expiry)?,
            patient_match_configuration,
        })
    }
}

#[allow(clippy::result_large_err)]
fn list(conn: &Connection) -> Result<Vec<FhirServerConfig>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM fhir_servers ORDER BY name",
        SELECT_COLUMNS
    ))?;
    let rows = stmt.query_map([], ServerRow::from_row)?;

    let mut configs = Vec::new();
    for row in rows {
        configs.push(row?.into_config()?);
    }
    Ok(configs)
}

#[allow(clippy::result_large_err)]
fn by_column(conn: &Connection, column: &str, value: &str) -> Result<Option<FhirServerConfig>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM fhir_servers WHERE {} = ?1", SELECT_COLUMNS, column),
            params![value],
            ServerRow::from_row,
        )
        .optional()?;
    row.map(ServerRow::into_config).transpose()
}

#[allow(clippy::result_large_err)]
fn write(conn: &Connection, config: &FhirServerConfig, insert: bool) -> Result<usize> {
    let headers = serde_json::to_string(&config.headers)?;
    let match_config = config
        .patient_match_configuration
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    if config.default_server {
        conn.execute(
            "UPDATE fhir_servers SET default_server = 0 WHERE id != ?1",
            params![config.id],
        )?;
    }

    let sql = if insert {
        "INSERT INTO fhir_servers (id, name, hostname, disable_cert_validation, mutual_tls,
            default_server, last_connection_attempt, last_connection_successful, headers,
            auth_type, client_id, client_secret, token_endpoint, scopes, access_token,
            token_expiry, patient_match_configuration)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
    } else {
        "UPDATE fhir_servers SET name = ?2, hostname = ?3, disable_cert_validation = ?4,
            mutual_tls = ?5, default_server = ?6, last_connection_attempt = ?7,
            last_connection_successful = ?8, headers = ?9, auth_type = ?10, client_id = ?11,
            client_secret = ?12, token_endpoint = ?13, scopes = ?14, access_token = ?15,
            token_expiry = ?16, patient_match_configuration = ?17
         WHERE id = ?1"
    };

    let rows = conn.execute(
        sql,
        params![
            config.id,
            config.name,
            config.hostname,
            config.disable_cert_validation,
            config.mutual_tls,
            config.default_server,
            config.last_connection_attempt.as_ref().map(to_timestamp),
            config.last_connection_successful,
            headers,
            config.auth_type.as_str(),
            config.client_id,
            config.client_secret,
            config.token_endpoint,
            config.scopes,
            config.access_token,
            config.token_expiry.as_ref().map(to_timestamp),
            match_config,
        ],
    )?;
    Ok(rows)
}

#[allow(clippy::result_large_err)]
impl TransactionOps<'_> {
    /// Insert a new server under a fresh id
    pub fn insert_fhir_server(
        &self,
        input: FhirServerInput,
        now: DateTime<Utc>,
    ) -> Result<FhirServerConfig> {
        let config = input.into_config(uuid::Uuid::new_v4().to_string(), now);
        write(self.conn(), &config, true)?;
        Ok(config)
    }

    /// Replace every field of an existing server
    pub fn update_fhir_server(
        &self,
        id: &str,
        input: FhirServerInput,
        now: DateTime<Utc>,
    ) -> Result<FhirServerConfig> {
        let config = input.into_config(id.to_string(), now);
        if write(self.conn(), &config, false)? == 0 {
            return Err(StoreError::NotFound {
                kind: "FHIR server",
                id: id.to_string(),
            });
        }
        Ok(config)
    }

    pub fn delete_fhir_server(&self, id: &str) -> Result<()> {
        let rows = self
            .conn()
            .execute("DELETE FROM fhir_servers WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(StoreError::NotFound {
                kind: "FHIR server",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Stamp the outcome of a connection attempt
    pub fn update_connection_status(
        &self,
        name: &str,
        successful: bool,
        now: DateTime<Utc>,
    ) -> Result<FhirServerConfig> {
        let rows = self.conn().execute(
            "UPDATE fhir_servers SET last_connection_attempt = ?2, last_connection_successful = ?3
             WHERE name = ?1",
            params![name, to_timestamp(&now), successful],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound {
                kind: "FHIR server",
                id: name.to_string(),
            });
        }
        by_column(self.conn(), "name", name)?.ok_or_else(|| StoreError::NotFound {
            kind: "FHIR server",
            id: name.to_string(),
        })
    }

    /// Persist a freshly acquired access token
    pub fn update_access_token(
        &self,
        name: &str,
        access_token: &str,
        expiry: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE fhir_servers SET access_token = ?2, token_expiry = ?3 WHERE name = ?1",
            params![name, access_token, to_timestamp(&expiry)],
        )?;
        Ok(())
    }

    pub fn fhir_server_by_id(&self, id: &str) -> Result<Option<FhirServerConfig>> {
        by_column(self.conn(), "id", id)
    }
}

#[allow(clippy::result_large_err)]
impl SqliteStore {
    pub fn list_fhir_servers(&self) -> Result<Vec<FhirServerConfig>> {
        let conn = self.conn()?;
        list(&conn)
    }

    pub fn fhir_server_by_name(&self, name: &str) -> Result<Option<FhirServerConfig>> {
        let conn = self.conn()?;
        by_column(&conn, "name", name)
    }

    /// Server names with the default server first
    pub fn fhir_server_names(&self) -> Result<Vec<String>> {
        let mut configs = self.list_fhir_servers()?;
        configs.sort_by_key(|c| !c.default_server);
        Ok(configs.into_iter().map(|c| c.name).collect())
    }
}
