//! Merging search responses into one de-duplicated result set.

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Value, json};
use std::collections::HashSet;
use tracing::warn;

use crate::resource::{Resource, is_fhir_resource};

/// Resources grouped by type, each bucket in first-seen order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResponse {
    buckets: Vec<(String, Vec<Resource>)>,
}

impl Serialize for QueryResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.buckets.len()))?;
        for (rt, resources) in &self.buckets {
            map.serialize_entry(rt, resources)?;
        }
        map.end()
    }
}

impl QueryResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, resource_type: &str) -> Option<&[Resource]> {
        self.buckets
            .iter()
            .find(|(rt, _)| rt == resource_type)
            .map(|(_, r)| r.as_slice())
    }

    pub fn resource_types(&self) -> impl Iterator<Item = &str> {
        self.buckets.iter().map(|(rt, _)| rt.as_str())
    }

    /// Total number of resources across all buckets
    pub fn total(&self) -> usize {
        self.buckets.iter().map(|(_, r)| r.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    fn bucket_mut(&mut self, resource_type: &str) -> &mut Vec<Resource> {
        let pos = match self.buckets.iter().position(|(rt, _)| rt == resource_type) {
            Some(pos) => pos,
            None => {
                self.buckets.push((resource_type.to_string(), Vec::new()));
                self.buckets.len() - 1
            }
        };
        &mut self.buckets[pos].1
    }

    /// Replace a bucket wholesale, placing it first
    pub fn set_front(&mut self, resource_type: &str, resources: Vec<Resource>) {
        self.buckets.retain(|(rt, _)| rt != resource_type);
        self.buckets.insert(0, (resource_type.to_string(), resources));
    }

    /// Append the other response's buckets, keeping ours where types overlap
    pub fn extend(&mut self, other: QueryResponse) {
        for (rt, resources) in other.buckets {
            if self.get(&rt).is_none() {
                self.buckets.push((rt, resources));
            }
        }
    }

    /// Render as a `searchset` Bundle
    pub fn to_bundle(&self) -> Value {
        let entry: Vec<Value> = self
            .buckets
            .iter()
            .flat_map(|(_, resources)| resources.iter())
            .map(|r| json!({"resource": r.to_value()}))
            .collect();
        json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "total": entry.len(),
            "entry": entry,
        })
    }
}

/// Accumulates resources across responses, skipping ones already seen
#[derive(Debug, Default)]
pub struct ResponseMerger {
    seen: HashSet<(String, String)>,
    response: QueryResponse,
}

impl ResponseMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every entry of one successful search Bundle.
    ///
    /// An entry without a `resource`, or whose resource has no string
    /// `resourceType`, is logged and skipped; the remaining entries are still
    /// merged.
    pub fn add_bundle(&mut self, body: &Value) {
        let Some(entries) = body.get("entry").and_then(Value::as_array) else {
            return;
        };
        for entry in entries {
            let Some(raw) = entry.get("resource") else {
                continue;
            };
            if !is_fhir_resource(raw) {
                warn!("Entry in FHIR resource response parsing was of unexpected shape");
                continue;
            }
            if let Some(resource) = Resource::from_value(raw.clone()) {
                self.add(resource);
            }
        }
    }

    /// Add one resource; returns false if it was skipped
    pub fn add(&mut self, resource: Resource) -> bool {
        let Some(id) = resource.id.clone() else {
            return false;
        };
        if !self.seen.insert((resource.resource_type.clone(), id)) {
            return false;
        }
        let rt = resource.resource_type.clone();
        self.response.bucket_mut(&rt).push(resource);
        true
    }

    pub fn finish(self) -> QueryResponse {
        self.response
    }
}

/// Merge a sequence of successful response bodies
pub fn merge_responses<'a>(bodies: impl IntoIterator<Item = &'a Value>) -> QueryResponse {
    let mut merger = ResponseMerger::new();
    for body in bodies {
        merger.add_bundle(body);
    }
    merger.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(resources: Vec<Value>) -> Value {
        json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "entry": resources.into_iter().map(|r| json!({"resource": r})).collect::<Vec<_>>()
        })
    }

    #[test]
    fn test_dedup_across_responses() {
        let a = bundle(vec![json!({"resourceType": "Observation", "id": "obs-1"})]);
        let b = bundle(vec![
            json!({"resourceType": "Observation", "id": "obs-1"}),
            json!({"resourceType": "Observation", "id": "obs-2"}),
        ]);
        let merged = merge_responses([&a, &b]);
        let ids: Vec<_> = merged
            .get("Observation")
            .unwrap()
            .iter()
            .map(|r| r.id.as_deref().unwrap())
            .collect();
        assert_eq!(ids, vec!["obs-1", "obs-2"]);
        assert_eq!(merged.total(), 2);
    }

    #[test]
    fn test_same_id_different_types_kept() {
        let body = bundle(vec![
            json!({"resourceType": "Observation", "id": "x"}),
            json!({"resourceType": "Condition", "id": "x"}),
        ]);
        let merged = merge_responses([&body]);
        assert_eq!(merged.get("Observation").unwrap().len(), 1);
        assert_eq!(merged.get("Condition").unwrap().len(), 1);
        assert_eq!(
            merged.resource_types().collect::<Vec<_>>(),
            vec!["Observation", "Condition"]
        );
    }

    #[test]
    fn test_skips_bad_and_idless_entries() {
        let body = bundle(vec![
            json!({"id": "no-type"}),
            json!({"resourceType": "Encounter"}),
            json!({"resourceType": "Encounter", "id": "e1"}),
        ]);
        let merged = merge_responses([&body]);
        assert_eq!(merged.total(), 1);
        assert_eq!(merged.get("Encounter").unwrap()[0].id.as_deref(), Some("e1"));
    }

    #[test]
    fn test_misshapen_entries_do_not_stop_the_bundle() {
        let body = json!({
            "resourceType": "Bundle",
            "entry": [
                {"fullUrl": "urn:uuid:1"},
                {"resource": {"resourceType": 7, "id": "bad"}},
                {"resource": {"resourceType": "Observation", "id": "o1"}},
                {"resource": "Observation/o2"},
                {"resource": {"resourceType": "Observation", "id": "o3"}}
            ]
        });
        let merged = merge_responses([&body]);
        let ids: Vec<_> = merged
            .get("Observation")
            .unwrap()
            .iter()
            .map(|r| r.id.as_deref().unwrap())
            .collect();
        assert_eq!(ids, vec!["o1", "o3"]);
    }

    #[test]
    fn test_body_without_entry() {
        let merged = merge_responses([&json!({"resourceType": "Bundle", "total": 0})]);
        assert!(merged.is_empty());
    }

    #[test]
    fn test_serializes_as_type_map() {
        let merged = merge_responses([&bundle(vec![json!({"resourceType": "Observation", "id": "o1"})])]);
        let json = serde_json::to_value(&merged).unwrap();
        assert_eq!(json["Observation"][0]["id"], "o1");
    }

    #[test]
    fn test_to_bundle_counts_all_entries() {
        let mut response = merge_responses([&bundle(vec![
            json!({"resourceType": "Observation", "id": "o1"}),
            json!({"resourceType": "Condition", "id": "c1"}),
        ])]);
        response.set_front("Patient", vec![Resource::new("Patient", "p1")]);

        let bundle = response.to_bundle();
        assert_eq!(bundle["resourceType"], "Bundle");
        assert_eq!(bundle["type"], "searchset");
        assert_eq!(bundle["total"], 3);
        assert_eq!(bundle["entry"][0]["resource"]["resourceType"], "Patient");
    }
}
