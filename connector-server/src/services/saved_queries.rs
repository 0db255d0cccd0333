//! Saved queries, their group links and their time windows

use chrono::Utc;
use connector_core::{
    ConceptType, QueryTimebox, Result, SavedQuery, TimeWindow, TimeboxSetting, resolve_timebox,
};
use connector_store::SqliteStore;
use serde_json::json;
use std::sync::Arc;

use crate::auth::Role;
use crate::pipeline::{Operation, Pipeline};

pub const SAVE_QUERY: Operation = Operation::new("saveCustomQuery", Role::Admin).audited();
pub const GET_QUERY_BY_ID: Operation = Operation::new("getSavedQueryById", Role::Standard);
pub const GET_QUERY_BY_NAME: Operation = Operation::new("getSavedQueryByName", Role::Standard);
pub const GET_QUERIES: Operation = Operation::new("getSavedQueries", Role::Standard);
pub const DELETE_QUERY: Operation = Operation::new("deleteQueryById", Role::Admin).audited();
pub const LINK_QUERY_TO_GROUP: Operation =
    Operation::new("addQueryToGroup", Role::Admin).audited();
pub const UPDATE_TIMEBOX: Operation =
    Operation::new("updateTimeboxSettings", Role::Admin).audited();
pub const DELETE_TIMEBOX: Operation =
    Operation::new("deleteTimeboxSettings", Role::Admin).audited();
pub const GET_TIMEBOX: Operation = Operation::new("getTimeboxRanges", Role::Standard);
pub const LINK_TIMEBOX: Operation = Operation::new("linkTimeboxRangesToQuery", Role::Standard);

#[derive(Clone)]
pub struct SavedQueryService {
    store: Arc<SqliteStore>,
}

impl SavedQueryService {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    /// Insert or update by query id; the caller becomes the author
    pub async fn save_query(
        &self,
        pipeline: &Pipeline<'_>,
        mut query: SavedQuery,
    ) -> Result<SavedQuery> {
        if query.author.is_none() {
            query.author = Some(pipeline.user().username.clone());
        }
        let input = json!({
            "queryId": query.query_id,
            "queryName": query.query_name,
            "conditionsList": query.conditions_list,
        });
        pipeline
            .run_in_transaction(&SAVE_QUERY, input, &self.store, |ops| {
                ops.save_query(query, Utc::now())
            })
            .await
    }

    pub async fn get_saved_query_by_id(
        &self,
        pipeline: &Pipeline<'_>,
        query_id: &str,
    ) -> Result<Option<SavedQuery>> {
        pipeline
            .run(&GET_QUERY_BY_ID, json!({"queryId": query_id}), || async move {
                Ok(self.store.saved_query_by_id(query_id)?)
            })
            .await
    }

    pub async fn get_saved_query_by_name(
        &self,
        pipeline: &Pipeline<'_>,
        query_name: &str,
    ) -> Result<Option<SavedQuery>> {
        pipeline
            .run(&GET_QUERY_BY_NAME, json!({"queryName": query_name}), || async move {
                Ok(self.store.saved_query_by_name(query_name)?)
            })
            .await
    }

    pub async fn get_saved_queries(&self, pipeline: &Pipeline<'_>) -> Result<Vec<SavedQuery>> {
        pipeline
            .run(&GET_QUERIES, json!({}), || async move {
                Ok(self.store.saved_queries()?)
            })
            .await
    }

    /// Delete a query; group links and time windows go with it
    pub async fn delete_query(&self, pipeline: &Pipeline<'_>, query_id: &str) -> Result<()> {
        pipeline
            .run_in_transaction(&DELETE_QUERY, json!({"queryId": query_id}), &self.store, |ops| {
                ops.delete_query(query_id)
            })
            .await
    }

    pub async fn link_query_to_group(
        &self,
        pipeline: &Pipeline<'_>,
        group_id: &str,
        query_id: &str,
    ) -> Result<()> {
        let input = json!({"groupId": group_id, "queryId": query_id});
        pipeline
            .run_in_transaction(&LINK_QUERY_TO_GROUP, input, &self.store, |ops| {
                ops.link_query_to_group(group_id, query_id)
            })
            .await
    }

    pub async fn update_timebox_settings(
        &self,
        pipeline: &Pipeline<'_>,
        query_id: &str,
        setting: &TimeboxSetting,
    ) -> Result<()> {
        let mut input = serde_json::to_value(setting)?;
        input["queryId"] = json!(query_id);
        pipeline
            .run_in_transaction(&UPDATE_TIMEBOX, input, &self.store, |ops| {
                ops.upsert_timebox(query_id, setting)
            })
            .await
    }

    /// Returns whether a window was stored for the concept type
    pub async fn delete_timebox_settings(
        &self,
        pipeline: &Pipeline<'_>,
        query_id: &str,
        concept_type: ConceptType,
    ) -> Result<bool> {
        let input = json!({"queryId": query_id, "conceptType": concept_type});
        pipeline
            .run_in_transaction(&DELETE_TIMEBOX, input, &self.store, |ops| {
                ops.delete_timebox(query_id, concept_type)
            })
            .await
    }

    /// Stored window for one concept type, exactly as saved
    pub async fn get_timebox_ranges(
        &self,
        pipeline: &Pipeline<'_>,
        query_id: &str,
        concept_type: ConceptType,
    ) -> Result<Option<TimeWindow>> {
        let input = json!({"queryId": query_id, "conceptType": concept_type});
        pipeline
            .run(&GET_TIMEBOX, input, || async move {
                let settings = self.store.timebox_settings(query_id)?;
                Ok(settings
                    .into_iter()
                    .find(|s| s.concept_type == concept_type)
                    .map(|s| TimeWindow {
                        time_window_start: s.time_window_start,
                        time_window_end: s.time_window_end,
                    }))
            })
            .await
    }

    /// Every window of a query resolved against the current time
    pub async fn link_timebox_ranges_to_query(
        &self,
        pipeline: &Pipeline<'_>,
        query_id: &str,
    ) -> Result<QueryTimebox> {
        pipeline
            .run(&LINK_TIMEBOX, json!({"queryId": query_id}), || async move {
                let settings = self.store.timebox_settings(query_id)?;
                Ok(resolve_timebox(&settings, Utc::now()))
            })
            .await
    }
}
