//! Value sets and the concepts they group.

use serde::{Deserialize, Serialize};

/// DIBBs classification used to route codes into FHIR resource searches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConceptType {
    Labs,
    Conditions,
    Medications,
    #[serde(other)]
    Unknown,
}

impl ConceptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConceptType::Labs => "labs",
            ConceptType::Conditions => "conditions",
            ConceptType::Medications => "medications",
            ConceptType::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "labs" => ConceptType::Labs,
            "conditions" => ConceptType::Conditions,
            "medications" => ConceptType::Medications,
            _ => ConceptType::Unknown,
        }
    }
}

/// One code within a value set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Concept {
    pub code: String,
    #[serde(default)]
    pub display: String,
    #[serde(default = "default_include")]
    pub include: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_id: Option<String>,
}

fn default_include() -> bool {
    true
}

impl Concept {
    pub fn new(code: impl Into<String>, display: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            display: display.into(),
            include: true,
            internal_id: None,
        }
    }

    pub fn excluded(mut self) -> Self {
        self.include = false;
        self
    }
}

/// A named, versioned collection of codes under one coding system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DibbsValueSet {
    pub value_set_id: String,
    #[serde(default)]
    pub value_set_version: String,
    pub value_set_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_set_external_id: Option<String>,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub system: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ersd_concept_type: Option<String>,
    pub dibbs_concept_type: ConceptType,
    #[serde(default = "default_include")]
    pub include_value_set: bool,
    #[serde(default)]
    pub concepts: Vec<Concept>,
    #[serde(default)]
    pub user_created: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_id: Option<String>,
}

impl DibbsValueSet {
    pub fn new(
        value_set_id: impl Into<String>,
        value_set_name: impl Into<String>,
        dibbs_concept_type: ConceptType,
        concepts: Vec<Concept>,
    ) -> Self {
        Self {
            value_set_id: value_set_id.into(),
            value_set_version: String::new(),
            value_set_name: value_set_name.into(),
            value_set_external_id: None,
            author: String::new(),
            system: String::new(),
            ersd_concept_type: None,
            dibbs_concept_type,
            include_value_set: true,
            concepts,
            user_created: false,
            condition_id: None,
        }
    }

    /// True when every concept has been explicitly excluded
    pub fn all_concepts_excluded(&self) -> bool {
        !self.concepts.is_empty() && self.concepts.iter().all(|c| !c.include)
    }

    /// Codes that should reach the query compiler.
    ///
    /// Empty when the value set is switched off or when all of its concepts are
    /// excluded, regardless of `include_value_set`.
    pub fn included_codes(&self) -> Vec<&str> {
        if !self.include_value_set || self.all_concepts_excluded() {
            return Vec::new();
        }
        self.concepts
            .iter()
            .filter(|c| c.include)
            .map(|c| c.code.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labs(concepts: Vec<Concept>) -> DibbsValueSet {
        DibbsValueSet::new("vs-1", "Chlamydia labs", ConceptType::Labs, concepts)
    }

    #[test]
    fn test_included_codes_skips_excluded_concepts() {
        let vs = labs(vec![
            Concept::new("123-4", "a"),
            Concept::new("567-8", "b").excluded(),
        ]);
        assert_eq!(vs.included_codes(), vec!["123-4"]);
    }

    #[test]
    fn test_all_excluded_value_set_contributes_nothing() {
        let mut vs = labs(vec![
            Concept::new("123-4", "a").excluded(),
            Concept::new("567-8", "b").excluded(),
        ]);
        vs.include_value_set = true;
        assert!(vs.all_concepts_excluded());
        assert!(vs.included_codes().is_empty());
    }

    #[test]
    fn test_switched_off_value_set() {
        let mut vs = labs(vec![Concept::new("123-4", "a")]);
        vs.include_value_set = false;
        assert!(vs.included_codes().is_empty());
    }

    #[test]
    fn test_deserialize_defaults() {
        let vs: DibbsValueSet = serde_json::from_str(
            r#"{
                "valueSetId": "2.16.840.1",
                "valueSetName": "Gonorrhea",
                "dibbsConceptType": "conditions",
                "concepts": [{"code": "15628003", "display": "Gonorrhea"}]
            }"#,
        )
        .unwrap();
        assert!(vs.include_value_set);
        assert!(vs.concepts[0].include);
        assert_eq!(vs.dibbs_concept_type, ConceptType::Conditions);
    }

    #[test]
    fn test_unknown_concept_type() {
        let ct: ConceptType = serde_json::from_str("\"procedures\"").unwrap();
        assert_eq!(ct, ConceptType::Unknown);
        assert_eq!(ConceptType::parse("labs"), ConceptType::Labs);
    }
}
