//! Time-window settings per saved query

use connector_core::{ConceptType, TimeboxSetting};
use rusqlite::params;

use crate::error::Result;
use crate::sqlite_store::{SqliteStore, TransactionOps, parse_timestamp, to_timestamp};

#[allow(clippy::result_large_err)]
impl TransactionOps<'_> {
    /// Insert or replace the window for one (query, concept type)
    pub fn upsert_timebox(&self, query_id: &str, setting: &TimeboxSetting) -> Result<()> {
        self.conn().execute(
            "INSERT INTO query_timeboxing
                (query_id, concept_type, time_window_start, time_window_end, is_relative_range)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(query_id, concept_type) DO UPDATE SET
                time_window_start = excluded.time_window_start,
                time_window_end = excluded.time_window_end,
                is_relative_range = excluded.is_relative_range",
            params![
                query_id,
                setting.concept_type.as_str(),
                to_timestamp(&setting.time_window_start),
                to_timestamp(&setting.time_window_end),
                setting.is_relative_range,
            ],
        )?;
        Ok(())
    }

    /// Remove the window for one concept type; returns whether a row existed
    pub fn delete_timebox(&self, query_id: &str, concept_type: ConceptType) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM query_timeboxing WHERE query_id = ?1 AND concept_type = ?2",
            params![query_id, concept_type.as_str()],
        )?;
        Ok(rows > 0)
    }
}

#[allow(clippy::result_large_err)]
impl SqliteStore {
    /// Stored windows for a query, ordered by concept type
    pub fn timebox_settings(&self, query_id: &str) -> Result<Vec<TimeboxSetting>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT concept_type, time_window_start, time_window_end, is_relative_range
             FROM query_timeboxing WHERE query_id = ?1 ORDER BY concept_type",
        )?;
        let rows = stmt.query_map(params![query_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?,
            ))
        })?;

        let mut settings = Vec::new();
        for row in rows {
            let (concept_type, start, end, is_relative_range) = row?;
            settings.push(TimeboxSetting {
                concept_type: ConceptType::parse(&concept_type),
                time_window_start: parse_timestamp(&start)?,
                time_window_end: parse_timestamp(&end)?,
                is_relative_range,
            });
        }
        Ok(settings)
    }
}
