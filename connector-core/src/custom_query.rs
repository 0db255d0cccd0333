//! Compiles a saved query into FHIR search requests for one patient.
//!
//! Codes are flattened per concept type and then routed into the searches
//! that concept type drives:
//!
//! | concept type | searches |
//! |--------------|----------|
//! | labs         | `observation`, `diagnosticReport` |
//! | conditions   | `encounter`, `condition` |
//! | medications  | `medicationRequest` |
//!
//! Medical record sections add `immunization` (GET) and `socialHistory`.

use serde::Serialize;

use crate::saved_query::{MedicalRecordSections, QueryData, QueryTimebox, TimeWindow};
use crate::valueset::ConceptType;

pub const OBSERVATION: &str = "observation";
pub const DIAGNOSTIC_REPORT: &str = "diagnosticReport";
pub const ENCOUNTER: &str = "encounter";
pub const CONDITION: &str = "condition";
pub const MEDICATION_REQUEST: &str = "medicationRequest";
pub const IMMUNIZATION: &str = "immunization";
pub const SOCIAL_HISTORY: &str = "socialHistory";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
}

/// One compiled request: a path plus ordered parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FhirRequest {
    pub base_path: String,
    pub params: Vec<(String, String)>,
    pub method: HttpMethod,
}

impl FhirRequest {
    fn post(base_path: &str) -> Self {
        Self {
            base_path: base_path.to_string(),
            params: Vec::new(),
            method: HttpMethod::Post,
        }
    }

    fn get(base_path: &str) -> Self {
        Self {
            base_path: base_path.to_string(),
            params: Vec::new(),
            method: HttpMethod::Get,
        }
    }

    /// Descriptor returned for names that were not compiled
    pub fn empty() -> Self {
        Self::get("")
    }

    pub fn is_empty(&self) -> bool {
        self.base_path.is_empty()
    }

    fn param(mut self, name: &str, value: impl Into<String>) -> Self {
        self.params.push((name.to_string(), value.into()));
        self
    }

    fn date_range(mut self, name: &str, window: Option<&TimeWindow>) -> Self {
        if let Some(window) = window {
            let (ge, le) = window.search_bounds();
            self.params.push((name.to_string(), ge));
            self.params.push((name.to_string(), le));
        }
        self
    }

    /// URL-encoded `k=v&k=v` rendering of the parameters
    pub fn query_string(&self) -> String {
        self.params
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Path with the query string appended, as used for GET dispatch
    pub fn path_with_query(&self) -> String {
        if self.params.is_empty() {
            self.base_path.clone()
        } else {
            format!("{}?{}", self.base_path, self.query_string())
        }
    }
}

/// Included codes grouped by the concept type that routes them
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CodeLists {
    pub labs: Vec<String>,
    pub conditions: Vec<String>,
    pub medications: Vec<String>,
}

impl CodeLists {
    pub fn from_query_data(query_data: &QueryData) -> Self {
        let mut lists = CodeLists::default();
        let value_sets = query_data
            .values()
            .flat_map(|by_type| by_type.values())
            .flat_map(|by_id| by_id.values());

        for vs in value_sets {
            let target = match vs.dibbs_concept_type {
                ConceptType::Labs => &mut lists.labs,
                ConceptType::Conditions => &mut lists.conditions,
                ConceptType::Medications => &mut lists.medications,
                ConceptType::Unknown => continue,
            };
            target.extend(vs.included_codes().into_iter().map(str::to_string));
        }
        lists
    }
}

/// The set of requests compiled for one (saved query, patient) pair
#[derive(Debug, Clone)]
pub struct CustomQuery {
    patient_id: String,
    requests: Vec<(&'static str, FhirRequest)>,
}

impl CustomQuery {
    pub fn new(
        query_data: &QueryData,
        sections: &MedicalRecordSections,
        timebox: &QueryTimebox,
        patient_id: &str,
    ) -> Self {
        let codes = CodeLists::from_query_data(query_data);
        let subject = format!("Patient/{}", patient_id);
        let mut requests = Vec::new();

        if !codes.labs.is_empty() {
            let joined = codes.labs.join(",");
            let window = timebox.get(&ConceptType::Labs);
            requests.push((
                OBSERVATION,
                FhirRequest::post("/Observation/_search")
                    .param("subject", &subject)
                    .param("code", &joined)
                    .date_range("date", window),
            ));
            requests.push((
                DIAGNOSTIC_REPORT,
                FhirRequest::post("/DiagnosticReport/_search")
                    .param("subject", &subject)
                    .param("code", &joined)
                    .date_range("date", window),
            ));
        }

        if !codes.conditions.is_empty() {
            let joined = codes.conditions.join(",");
            let window = timebox.get(&ConceptType::Conditions);
            requests.push((
                ENCOUNTER,
                FhirRequest::post("/Encounter/_search")
                    .param("subject", &subject)
                    .param("reason-code", &joined)
                    .date_range("date", window),
            ));
            requests.push((
                CONDITION,
                FhirRequest::post("/Condition/_search")
                    .param("subject", &subject)
                    .param("code", &joined)
                    .date_range("onset-date", window),
            ));
        }

        if !codes.medications.is_empty() {
            let joined = codes.medications.join(",");
            requests.push((
                MEDICATION_REQUEST,
                FhirRequest::post("/MedicationRequest/_search")
                    .param("subject", &subject)
                    .param("code", &joined)
                    .param("_include", "MedicationRequest:medication")
                    .param("_revinclude", "MedicationAdministration:request")
                    .date_range("authoredon", timebox.get(&ConceptType::Medications)),
            ));
        }

        if sections.immunizations {
            requests.push((
                IMMUNIZATION,
                FhirRequest::get("/Immunization").param("subject", &subject),
            ));
        }

        if sections.social_determinants {
            requests.push((
                SOCIAL_HISTORY,
                FhirRequest::post("/Observation/_search")
                    .param("subject", &subject)
                    .param("category", "social-history"),
            ));
        }

        Self {
            patient_id: patient_id.to_string(),
            requests,
        }
    }

    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    /// Compiled descriptor by name, or an empty descriptor when absent
    pub fn get_query(&self, name: &str) -> FhirRequest {
        self.requests
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, r)| r.clone())
            .unwrap_or_else(FhirRequest::empty)
    }

    /// Names of the compiled descriptors, in compile order
    pub fn names(&self) -> Vec<&'static str> {
        self.requests.iter().map(|(n, _)| *n).collect()
    }

    /// Every non-empty POST descriptor
    pub fn compile_all_post_requests(&self) -> Vec<FhirRequest> {
        self.requests
            .iter()
            .filter(|(_, r)| r.method == HttpMethod::Post && !r.is_empty())
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// GET descriptors rendered as `path?query`
    pub fn compile_get_requests(&self) -> Vec<String> {
        self.requests
            .iter()
            .filter(|(_, r)| r.method == HttpMethod::Get && !r.is_empty())
            .map(|(_, r)| r.path_with_query())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saved_query::SavedQuery;
    use crate::valueset::{Concept, DibbsValueSet};
    use chrono::{TimeZone, Utc};

    fn value_set(id: &str, ct: ConceptType, codes: &[&str]) -> DibbsValueSet {
        DibbsValueSet::new(
            id,
            id,
            ct,
            codes.iter().map(|c| Concept::new(*c, *c)).collect(),
        )
    }

    fn params_of<'a>(req: &'a FhirRequest, name: &str) -> Vec<&'a str> {
        req.params
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    #[test]
    fn test_labs_and_immunizations() {
        let query = SavedQuery::new("q", "labs")
            .with_value_set("c1", value_set("vs-labs", ConceptType::Labs, &["123-4"]))
            .with_sections(MedicalRecordSections {
                immunizations: true,
                social_determinants: false,
            });
        let compiled = CustomQuery::new(
            &query.query_data,
            &query.medical_record_sections,
            &QueryTimebox::new(),
            "p1",
        );

        assert_eq!(
            compiled.names(),
            vec![OBSERVATION, DIAGNOSTIC_REPORT, IMMUNIZATION]
        );

        let obs = compiled.get_query(OBSERVATION);
        assert_eq!(obs.base_path, "/Observation/_search");
        assert_eq!(obs.method, HttpMethod::Post);
        assert_eq!(params_of(&obs, "subject"), vec!["Patient/p1"]);
        assert_eq!(params_of(&obs, "code"), vec!["123-4"]);
        assert!(params_of(&obs, "date").is_empty());

        let imm = compiled.get_query(IMMUNIZATION);
        assert_eq!(imm.method, HttpMethod::Get);
        assert!(params_of(&imm, "code").is_empty());

        assert_eq!(compiled.compile_all_post_requests().len(), 2);
        assert_eq!(
            compiled.compile_get_requests(),
            vec!["/Immunization?subject=Patient%2Fp1".to_string()]
        );
    }

    #[test]
    fn test_missing_name_returns_empty_descriptor() {
        let compiled = CustomQuery::new(
            &QueryData::new(),
            &MedicalRecordSections::default(),
            &QueryTimebox::new(),
            "p1",
        );
        assert!(compiled.get_query(CONDITION).is_empty());
        assert!(compiled.compile_all_post_requests().is_empty());
        assert!(compiled.compile_get_requests().is_empty());
    }

    #[test]
    fn test_excluded_value_set_contributes_no_request() {
        let mut vs = value_set("vs-cond", ConceptType::Conditions, &["A1", "B2"]);
        for concept in vs.concepts.iter_mut() {
            concept.include = false;
        }
        let query = SavedQuery::new("q", "cond").with_value_set("c1", vs);
        let compiled = CustomQuery::new(
            &query.query_data,
            &query.medical_record_sections,
            &QueryTimebox::new(),
            "p1",
        );
        assert!(compiled.get_query(ENCOUNTER).is_empty());
        assert!(compiled.get_query(CONDITION).is_empty());
    }

    #[test]
    fn test_codes_joined_and_time_windows_applied() {
        let query = SavedQuery::new("q", "mixed")
            .with_value_set(
                "c1",
                value_set("vs-a", ConceptType::Conditions, &["A1", "B2"]),
            )
            .with_value_set("c1", value_set("vs-m", ConceptType::Medications, &["M1"]));

        let window = TimeWindow {
            time_window_start: Utc.with_ymd_and_hms(2024, 1, 1, 5, 0, 0).unwrap(),
            time_window_end: Utc.with_ymd_and_hms(2024, 6, 30, 22, 0, 0).unwrap(),
        };
        let mut timebox = QueryTimebox::new();
        timebox.insert(ConceptType::Conditions, window);
        timebox.insert(ConceptType::Medications, window);

        let compiled = CustomQuery::new(
            &query.query_data,
            &query.medical_record_sections,
            &timebox,
            "p9",
        );

        let enc = compiled.get_query(ENCOUNTER);
        assert_eq!(params_of(&enc, "reason-code"), vec!["A1,B2"]);
        assert_eq!(params_of(&enc, "date"), vec!["ge2024-01-01", "le2024-06-30"]);

        let cond = compiled.get_query(CONDITION);
        assert_eq!(
            params_of(&cond, "onset-date"),
            vec!["ge2024-01-01", "le2024-06-30"]
        );

        let med = compiled.get_query(MEDICATION_REQUEST);
        assert_eq!(params_of(&med, "_include"), vec!["MedicationRequest:medication"]);
        assert_eq!(
            params_of(&med, "_revinclude"),
            vec!["MedicationAdministration:request"]
        );
        assert_eq!(
            params_of(&med, "authoredon"),
            vec!["ge2024-01-01", "le2024-06-30"]
        );
    }

    #[test]
    fn test_social_history_section() {
        let compiled = CustomQuery::new(
            &QueryData::new(),
            &MedicalRecordSections {
                immunizations: false,
                social_determinants: true,
            },
            &QueryTimebox::new(),
            "p2",
        );
        let social = compiled.get_query(SOCIAL_HISTORY);
        assert_eq!(social.base_path, "/Observation/_search");
        assert_eq!(params_of(&social, "category"), vec!["social-history"]);
        assert_eq!(compiled.patient_id(), "p2");
    }
}
