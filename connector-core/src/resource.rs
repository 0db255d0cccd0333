use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A FHIR resource as returned by an upstream server.
///
/// Only the two fields the engine relies on are typed; everything else is
/// carried through untouched so the unified response round-trips the
/// server's JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "resourceType")]
    pub resource_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl Resource {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: Some(id.into()),
            rest: Map::new(),
        }
    }

    /// Convert a JSON value, returning `None` when it lacks a string `resourceType`
    pub fn from_value(value: Value) -> Option<Self> {
        if !is_fhir_resource(&value) {
            return None;
        }
        serde_json::from_value(value).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Look up a top-level element by name
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.rest.get(key)
    }
}

/// Shape check applied to every bundle entry before it is merged
pub fn is_fhir_resource(value: &Value) -> bool {
    value
        .get("resourceType")
        .and_then(|v| v.as_str())
        .is_some_and(|rt| !rt.is_empty())
}
