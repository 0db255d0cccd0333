//! Saved query rows and their group links

use chrono::{DateTime, Utc};
use connector_core::SavedQuery;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::error::{Result, StoreError};
use crate::sqlite_store::{SqliteStore, TransactionOps, parse_timestamp, to_timestamp};

const SELECT_COLUMNS: &str = "id, query_name, query_data, conditions_list, \
    medical_record_sections, author, date_created, date_last_modified";

struct QueryRow {
    id: String,
    query_name: String,
    query_data: String,
    conditions_list: String,
    medical_record_sections: String,
    author: Option<String>,
    date_created: String,
    date_last_modified: String,
}

impl QueryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            query_name: row.get(1)?,
            query_data: row.get(2)?,
            conditions_list: row.get(3)?,
            medical_record_sections: row.get(4)?,
            author: row.get(5)?,
            date_created: row.get(6)?,
            date_last_modified: row.get(7)?,
        })
    }

    #[allow(clippy::result_large_err)]
    fn into_saved_query(self) -> Result<SavedQuery> {
        Ok(SavedQuery {
            query_id: self.id,
            query_name: self.query_name,
            query_data: serde_json::from_str(&self.query_data)?,
            conditions_list: serde_json::from_str(&self.conditions_list)?,
            medical_record_sections: serde_json::from_str(&self.medical_record_sections)?,
            author: self.author,
            date_created: Some(parse_timestamp(&self.date_created)?),
            date_last_modified: Some(parse_timestamp(&self.date_last_modified)?),
        })
    }
}

#[allow(clippy::result_large_err)]
fn by_column(conn: &Connection, column: &str, value: &str) -> Result<Option<SavedQuery>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM query WHERE {} = ?1", SELECT_COLUMNS, column),
            params![value],
            QueryRow::from_row,
        )
        .optional()?;
    row.map(QueryRow::into_saved_query).transpose()
}

#[allow(clippy::result_large_err)]
impl TransactionOps<'_> {
    /// Insert or update by query id. An empty id gets a fresh one.
    pub fn save_query(&self, mut query: SavedQuery, now: DateTime<Utc>) -> Result<SavedQuery> {
        if query.query_id.is_empty() {
            query.query_id = uuid::Uuid::new_v4().to_string();
        }
        let existing = by_column(self.conn(), "id", &query.query_id)?;
        let created = existing
            .and_then(|q| q.date_created)
            .unwrap_or(now);

        self.conn().execute(
            "INSERT INTO query (id, query_name, query_data, conditions_list,
                medical_record_sections, author, date_created, date_last_modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                query_name = excluded.query_name,
                query_data = excluded.query_data,
                conditions_list = excluded.conditions_list,
                medical_record_sections = excluded.medical_record_sections,
                author = excluded.author,
                date_last_modified = excluded.date_last_modified",
            params![
                query.query_id,
                query.query_name,
                serde_json::to_string(&query.query_data)?,
                serde_json::to_string(&query.conditions_list)?,
                serde_json::to_string(&query.medical_record_sections)?,
                query.author,
                to_timestamp(&created),
                to_timestamp(&now),
            ],
        )?;

        query.date_created = Some(created);
        query.date_last_modified = Some(now);
        Ok(query)
    }

    /// Delete a query together with its group links and time windows
    pub fn delete_query(&self, query_id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM usergroup_to_query WHERE query_id = ?1",
            params![query_id],
        )?;
        conn.execute(
            "DELETE FROM query_timeboxing WHERE query_id = ?1",
            params![query_id],
        )?;
        let rows = conn.execute("DELETE FROM query WHERE id = ?1", params![query_id])?;
        if rows == 0 {
            return Err(StoreError::NotFound {
                kind: "Saved query",
                id: query_id.to_string(),
            });
        }
        Ok(())
    }

    /// Link a saved query to a user group
    pub fn link_query_to_group(&self, group_id: &str, query_id: &str) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO usergroup_to_query (usergroup_id, query_id) VALUES (?1, ?2)",
            params![group_id, query_id],
        )?;
        Ok(())
    }
}

#[allow(clippy::result_large_err)]
impl SqliteStore {
    pub fn saved_query_by_id(&self, query_id: &str) -> Result<Option<SavedQuery>> {
        let conn = self.conn()?;
        by_column(&conn, "id", query_id)
    }

    pub fn saved_query_by_name(&self, query_name: &str) -> Result<Option<SavedQuery>> {
        let conn = self.conn()?;
        by_column(&conn, "query_name", query_name)
    }

    pub fn saved_queries(&self) -> Result<Vec<SavedQuery>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM query ORDER BY query_name",
            SELECT_COLUMNS
        ))?;
        let rows = stmt.query_map([], QueryRow::from_row)?;

        let mut queries = Vec::new();
        for row in rows {
            queries.push(row?.into_saved_query()?);
        }
        Ok(queries)
    }

    /// Group ids linked to a saved query
    pub fn query_groups(&self, query_id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT usergroup_id FROM usergroup_to_query WHERE query_id = ?1 ORDER BY usergroup_id",
        )?;
        let rows = stmt.query_map(params![query_id], |row| row.get::<_, String>(0))?;

        let mut groups = Vec::new();
        for group in rows {
            groups.push(group?);
        }
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connector_core::{Concept, ConceptType, DibbsValueSet, MedicalRecordSections};

    fn chlamydia() -> SavedQuery {
        SavedQuery::new("", "Chlamydia case investigation")
            .with_value_set(
                "cond-1",
                DibbsValueSet::new(
                    "vs-1",
                    "Chlamydia labs",
                    ConceptType::Labs,
                    vec![Concept::new("14463-4", "Chlamydia trachomatis")],
                ),
            )
            .with_sections(MedicalRecordSections {
                immunizations: true,
                social_determinants: false,
            })
    }

    #[test]
    fn test_save_assigns_id_and_reads_back() {
        let store = SqliteStore::open(":memory:").unwrap();
        let saved = store
            .in_transaction(|ops| ops.save_query(chlamydia(), Utc::now()))
            .unwrap();
        assert!(!saved.query_id.is_empty());

        let by_id = store.saved_query_by_id(&saved.query_id).unwrap().unwrap();
        let by_name = store
            .saved_query_by_name("Chlamydia case investigation")
            .unwrap()
            .unwrap();
        assert_eq!(by_id, by_name);
        assert_eq!(by_id.query_data, saved.query_data);
        assert!(by_id.medical_record_sections.immunizations);
    }

    #[test]
    fn test_save_upserts_by_id() {
        let store = SqliteStore::open(":memory:").unwrap();
        let first = store
            .in_transaction(|ops| ops.save_query(chlamydia(), Utc::now()))
            .unwrap();

        let mut edited = first.clone();
        edited.query_name = "Chlamydia v2".into();
        let later = Utc::now() + chrono::Duration::seconds(5);
        let second = store
            .in_transaction(|ops| ops.save_query(edited, later))
            .unwrap();

        assert_eq!(second.query_id, first.query_id);
        assert_eq!(second.date_created, first.date_created);
        let all = store.saved_queries().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].query_name, "Chlamydia v2");
    }

    #[test]
    fn test_delete_cascades_group_links() {
        let store = SqliteStore::open(":memory:").unwrap();
        let saved = store
            .in_transaction(|ops| {
                let q = ops.save_query(chlamydia(), Utc::now())?;
                ops.link_query_to_group("group-a", &q.query_id)?;
                ops.link_query_to_group("group-b", &q.query_id)?;
                Ok(q)
            })
            .unwrap();
        assert_eq!(store.query_groups(&saved.query_id).unwrap().len(), 2);

        store
            .in_transaction(|ops| ops.delete_query(&saved.query_id))
            .unwrap();
        assert!(store.saved_query_by_id(&saved.query_id).unwrap().is_none());
        assert!(store.query_groups(&saved.query_id).unwrap().is_empty());
    }

    #[test]
    fn test_missing_query() {
        let store = SqliteStore::open(":memory:").unwrap();
        assert!(store.saved_query_by_id("nope").unwrap().is_none());
        assert!(store.in_transaction(|ops| ops.delete_query("nope")).is_err());
    }
}
