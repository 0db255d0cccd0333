//! Saved queries and their time-window settings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::valueset::{ConceptType, DibbsValueSet};

/// concept type -> value set id -> value set, for one condition
pub type ConditionValueSets = BTreeMap<String, BTreeMap<String, DibbsValueSet>>;

/// condition id -> concept type -> value set id -> value set
pub type QueryData = BTreeMap<String, ConditionValueSets>;

/// Optional record sections that are not driven by value sets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MedicalRecordSections {
    pub immunizations: bool,
    pub social_determinants: bool,
}

/// A persisted, user-curated query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedQuery {
    /// Empty until the query is first saved
    #[serde(default)]
    pub query_id: String,
    pub query_name: String,
    #[serde(default)]
    pub query_data: QueryData,
    #[serde(default)]
    pub conditions_list: Vec<String>,
    #[serde(default)]
    pub medical_record_sections: MedicalRecordSections,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_last_modified: Option<DateTime<Utc>>,
}

impl SavedQuery {
    pub fn new(query_id: impl Into<String>, query_name: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            query_name: query_name.into(),
            query_data: QueryData::new(),
            conditions_list: Vec::new(),
            medical_record_sections: MedicalRecordSections::default(),
            author: None,
            date_created: None,
            date_last_modified: None,
        }
    }

    /// Add a value set under a condition, keyed by its own concept type and id
    pub fn with_value_set(mut self, condition_id: &str, value_set: DibbsValueSet) -> Self {
        if !self.conditions_list.iter().any(|c| c == condition_id) {
            self.conditions_list.push(condition_id.to_string());
        }
        self.query_data
            .entry(condition_id.to_string())
            .or_default()
            .entry(value_set.dibbs_concept_type.as_str().to_string())
            .or_default()
            .insert(value_set.value_set_id.clone(), value_set);
        self
    }

    pub fn with_sections(mut self, sections: MedicalRecordSections) -> Self {
        self.medical_record_sections = sections;
        self
    }

    /// Every value set across all conditions and concept types
    pub fn value_sets(&self) -> impl Iterator<Item = &DibbsValueSet> {
        self.query_data
            .values()
            .flat_map(|by_type| by_type.values())
            .flat_map(|by_id| by_id.values())
    }
}

/// Stored time-window row for one (query, concept type) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeboxSetting {
    pub concept_type: ConceptType,
    pub time_window_start: DateTime<Utc>,
    pub time_window_end: DateTime<Utc>,
    #[serde(default = "default_relative")]
    pub is_relative_range: bool,
}

fn default_relative() -> bool {
    true
}

/// Absolute bounds used when compiling a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    pub time_window_start: DateTime<Utc>,
    pub time_window_end: DateTime<Utc>,
}

impl TimeboxSetting {
    /// Resolve against `now`.
    ///
    /// A relative window keeps only the stored delta: the resolved end is
    /// `now` and the start is `now - (end - start)`.
    pub fn resolve(&self, now: DateTime<Utc>) -> TimeWindow {
        if self.is_relative_range {
            let delta = self.time_window_end - self.time_window_start;
            TimeWindow {
                time_window_start: now - delta,
                time_window_end: now,
            }
        } else {
            TimeWindow {
                time_window_start: self.time_window_start,
                time_window_end: self.time_window_end,
            }
        }
    }
}

impl TimeWindow {
    /// `ge<YYYY-MM-DD>` / `le<YYYY-MM-DD>` prefixes on UTC calendar dates
    pub fn search_bounds(&self) -> (String, String) {
        (
            format!("ge{}", self.time_window_start.format("%Y-%m-%d")),
            format!("le{}", self.time_window_end.format("%Y-%m-%d")),
        )
    }
}

/// Resolved time windows keyed by concept type
pub type QueryTimebox = BTreeMap<ConceptType, TimeWindow>;

/// Resolve all stored settings for a query at `now`
pub fn resolve_timebox(settings: &[TimeboxSetting], now: DateTime<Utc>) -> QueryTimebox {
    settings
        .iter()
        .map(|s| (s.concept_type, s.resolve(now)))
        .collect()
}
