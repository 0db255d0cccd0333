//! Patient demographics: parsing from FHIR Patients and HL7 v2 messages, and
//! rendering into `/Patient` search parameters.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

const MRN_CODE_SYSTEM: &str = "http://terminology.hl7.org/CodeSystem/v2-0203";

/// Punctuation variants searched for every 10-digit phone number, with
/// `$1`, `$2`, `$3` standing for area code, exchange and line number.
const PHONE_FORMATS: &[&str] = &[
    "$1$2$3",
    "$1-$2-$3",
    "$1+$2+$3",
    "($1)+$2+$3",
    "($1)-$2-$3",
    "($1)$2-$3",
    "1($1)$2-$3",
];

/// Identifying fields for a patient search
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatientDemographics {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub dob: Option<String>,
    pub mrn: Option<String>,
    /// One or more numbers separated by `;`
    pub phone: Option<String>,
    pub street1: Option<String>,
    pub street2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub email: Option<String>,
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn owned(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

impl PatientDemographics {
    /// True when at least one identifying field carries a value
    pub fn has_identifiers(&self) -> bool {
        [
            &self.first_name,
            &self.last_name,
            &self.dob,
            &self.mrn,
            &self.phone,
            &self.street1,
            &self.street2,
            &self.city,
            &self.state,
            &self.zip,
            &self.email,
        ]
        .into_iter()
        .any(|f| non_empty(f).is_some())
    }

    /// Search parameters in a fixed order, so the same demographics always
    /// produce the same query string.
    pub fn search_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        let mut push = |name: &str, value: &str| params.push((name.to_string(), value.to_string()));

        if let Some(v) = non_empty(&self.first_name) {
            push("given", v);
        }
        if let Some(v) = non_empty(&self.last_name) {
            push("family", v);
        }
        if let Some(v) = non_empty(&self.dob) {
            push("birthdate", v);
        }
        if let Some(v) = non_empty(&self.mrn) {
            push("identifier", v);
        }
        if let Some(v) = non_empty(&self.phone) {
            let variants: Vec<String> = v
                .split(';')
                .flat_map(phone_query_formats)
                .filter(|p| !p.is_empty())
                .collect();
            if !variants.is_empty() {
                push("phone", &variants.join(","));
            }
        }
        for street in [&self.street1, &self.street2] {
            if let Some(v) = non_empty(street) {
                for line in v.split(';').map(str::trim).filter(|l| !l.is_empty()) {
                    push("address", line);
                }
            }
        }
        if let Some(v) = non_empty(&self.city) {
            push("address-city", v);
        }
        if let Some(v) = non_empty(&self.state) {
            push("address-state", v);
        }
        if let Some(v) = non_empty(&self.zip) {
            push("address-postalcode", v);
        }
        if let Some(v) = non_empty(&self.email) {
            push("email", v);
        }
        params
    }

    /// `/Patient?...` with every value percent-encoded once
    pub fn patient_search_path(&self) -> String {
        let query = self
            .search_params()
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        format!("/Patient?{}", query)
    }

    /// Extract demographics from a FHIR Patient resource.
    ///
    /// Only the first name entry is read. MRN is the first identifier typed
    /// with v2-0203 `MR`. Phones are normalized to digits and joined by `;`.
    pub fn from_patient(patient: &Value) -> Self {
        let mut demo = PatientDemographics::default();

        if let Some(name) = patient.get("name").and_then(|n| n.get(0)) {
            demo.first_name = name
                .get("given")
                .and_then(|g| g.get(0))
                .and_then(Value::as_str)
                .and_then(owned);
            demo.last_name = name.get("family").and_then(Value::as_str).and_then(owned);
        }

        demo.dob = patient
            .get("birthDate")
            .and_then(Value::as_str)
            .and_then(owned);

        demo.mrn = patient
            .get("identifier")
            .and_then(Value::as_array)
            .and_then(|ids| ids.iter().find(|id| is_mrn_identifier(id)))
            .and_then(|id| id.get("value"))
            .and_then(Value::as_str)
            .and_then(owned);

        if let Some(telecom) = patient.get("telecom").and_then(Value::as_array) {
            let phones: Vec<String> = telecom
                .iter()
                .filter(|cp| is_phone_contact(cp))
                .filter_map(|cp| cp.get("value").and_then(Value::as_str))
                .map(format_phone_as_digits)
                .filter(|p| !p.is_empty())
                .collect();
            if !phones.is_empty() {
                demo.phone = Some(phones.join(";"));
            }

            demo.email = telecom
                .iter()
                .find(|cp| cp.get("system").and_then(Value::as_str) == Some("email"))
                .and_then(|cp| cp.get("value"))
                .and_then(Value::as_str)
                .and_then(owned);
        }

        if let Some(addresses) = patient.get("address").and_then(Value::as_array) {
            apply_addresses(&mut demo, addresses);
        }

        demo
    }

    /// Extract demographics from an HL7 v2 message.
    ///
    /// Reads PID-5.2 given, PID-5.1 family, PID-7.1 birth date, PID-3.1 MRN,
    /// PID-11.1..5 address and NK1-5.1 phone. A message wrapped in `{ }` is
    /// unwrapped first.
    pub fn from_hl7(message: &str) -> Self {
        let message = strip_hl7_braces(message);
        let hl7 = Hl7Message::parse(message);

        PatientDemographics {
            first_name: hl7.component("PID", 5, 2).and_then(owned),
            last_name: hl7.component("PID", 5, 1).and_then(owned),
            dob: hl7.component("PID", 7, 1).and_then(owned),
            mrn: hl7.component("PID", 3, 1).and_then(owned),
            phone: hl7.component("NK1", 5, 1).and_then(owned),
            street1: hl7.component("PID", 11, 1).and_then(owned),
            street2: hl7.component("PID", 11, 2).and_then(owned),
            city: hl7.component("PID", 11, 3).and_then(owned),
            state: hl7.component("PID", 11, 4).and_then(owned),
            zip: hl7.component("PID", 11, 5).and_then(owned),
            email: None,
        }
    }

    /// Synthesize a FHIR Patient resource carrying these demographics
    pub fn to_patient_resource(&self) -> Value {
        let mut patient = serde_json::Map::new();
        patient.insert("resourceType".into(), json!("Patient"));

        let given = non_empty(&self.first_name);
        let family = non_empty(&self.last_name);
        if given.is_some() || family.is_some() {
            let mut name = serde_json::Map::new();
            if let Some(g) = given {
                name.insert("given".into(), json!([g]));
            }
            if let Some(f) = family {
                name.insert("family".into(), json!(f));
            }
            patient.insert("name".into(), json!([name]));
        }

        if let Some(dob) = non_empty(&self.dob) {
            patient.insert("birthDate".into(), json!(dob));
        }

        if let Some(mrn) = non_empty(&self.mrn) {
            patient.insert(
                "identifier".into(),
                json!([{
                    "type": {"coding": [{"system": MRN_CODE_SYSTEM, "code": "MR"}]},
                    "value": mrn
                }]),
            );
        }

        let mut telecom: Vec<Value> = non_empty(&self.phone)
            .map(|p| {
                p.split(';')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| json!({"system": "phone", "value": s}))
                    .collect()
            })
            .unwrap_or_default();
        if let Some(email) = non_empty(&self.email) {
            telecom.push(json!({"system": "email", "value": email}));
        }
        if !telecom.is_empty() {
            patient.insert("telecom".into(), Value::Array(telecom));
        }

        let lines: Vec<&str> = [&self.street1, &self.street2]
            .into_iter()
            .filter_map(non_empty)
            .collect();
        let city = non_empty(&self.city);
        let state = non_empty(&self.state);
        let zip = non_empty(&self.zip);
        if !lines.is_empty() || city.is_some() || state.is_some() || zip.is_some() {
            let mut address = serde_json::Map::new();
            if !lines.is_empty() {
                address.insert("line".into(), json!(lines));
            }
            if let Some(c) = city {
                address.insert("city".into(), json!(c));
            }
            if let Some(s) = state {
                address.insert("state".into(), json!(s));
            }
            if let Some(z) = zip {
                address.insert("postalCode".into(), json!(z));
            }
            patient.insert("address".into(), json!([address]));
        }

        Value::Object(patient)
    }
}

fn is_mrn_identifier(identifier: &Value) -> bool {
    identifier
        .pointer("/type/coding")
        .and_then(Value::as_array)
        .is_some_and(|codings| {
            codings.iter().any(|c| {
                c.get("system").and_then(Value::as_str) == Some(MRN_CODE_SYSTEM)
                    && c.get("code").and_then(Value::as_str) == Some("MR")
            })
        })
}

fn is_phone_contact(contact_point: &Value) -> bool {
    let system = contact_point.get("system").and_then(Value::as_str);
    let use_ = contact_point.get("use").and_then(Value::as_str);
    system == Some("phone") || matches!(use_, Some("home" | "work" | "mobile"))
}

fn push_unique(dest: &mut Vec<String>, value: Option<&str>) {
    if let Some(v) = value.filter(|v| !v.is_empty()) {
        if !dest.iter().any(|d| d == v) {
            dest.push(v.to_string());
        }
    }
}

/// Collect address parts across every address. City, state and zip are
/// de-duplicated; any of them repeated inside a line item is cut from it.
fn apply_addresses(demo: &mut PatientDemographics, addresses: &[Value]) {
    let (mut street1, mut street2) = (Vec::new(), Vec::new());
    let (mut city, mut state, mut zip) = (Vec::new(), Vec::new(), Vec::new());

    for address in addresses {
        let a_zip = address.get("postalCode").and_then(Value::as_str);
        let a_state = address.get("state").and_then(Value::as_str);
        let a_city = address.get("city").and_then(Value::as_str);
        push_unique(&mut zip, a_zip);
        push_unique(&mut state, a_state);
        push_unique(&mut city, a_city);

        let lines: Vec<String> = address
            .get("line")
            .and_then(Value::as_array)
            .map(|lines| {
                lines
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|line| {
                        let mut line = line.to_string();
                        for part in [a_zip, a_state, a_city].into_iter().flatten() {
                            if !part.is_empty() && line.contains(part) {
                                line = line.replacen(part, "", 1);
                            }
                        }
                        line.trim().to_string()
                    })
                    .collect()
            })
            .unwrap_or_default();

        if let Some(first) = lines.first().filter(|l| !l.is_empty()) {
            street1.push(first.clone());
        }
        if let Some(second) = lines.get(1).filter(|l| !l.is_empty()) {
            street2.push(second.clone());
        }
    }

    let join = |parts: Vec<String>| (!parts.is_empty()).then(|| parts.join(";"));
    demo.street1 = join(street1);
    demo.street2 = join(street2);
    demo.city = join(city);
    demo.state = join(state);
    demo.zip = join(zip);
}

/// Strip every non-digit; if the result is not exactly 10 digits the input
/// is returned unchanged.
pub fn format_phone_as_digits(phone: &str) -> String {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    if digits.len() == 10 {
        digits
    } else {
        phone.to_string()
    }
}

/// Every punctuation variant to search for one phone number.
///
/// Numbers that do not normalize to 10 digits are searched as given, with
/// the first space turned into a hyphen.
pub fn phone_query_formats(phone: &str) -> Vec<String> {
    let phone = phone.trim();
    let digits = format_phone_as_digits(phone);
    if digits.len() != 10 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return vec![phone.replacen(' ', "-", 1)];
    }
    let (area, rest) = digits.split_at(3);
    let (exchange, line) = rest.split_at(3);
    PHONE_FORMATS
        .iter()
        .map(|fmt| {
            fmt.replace("$1", area)
                .replace("$2", exchange)
                .replace("$3", line)
        })
        .collect()
}

/// Remove a `{ ... }` wrapper around an HL7 message body, if present
pub fn strip_hl7_braces(text: &str) -> &str {
    let trimmed = text.trim();
    if trimmed.starts_with('{') || trimmed.ends_with('}') {
        if let (Some(open), Some(close)) = (trimmed.find('{'), trimmed.rfind('}')) {
            if open < close {
                return trimmed[open + 1..close].trim();
            }
        }
    }
    trimmed
}

/// Minimal HL7 v2 reader: segments, fields and components, with separators
/// taken from the MSH header when one is present.
struct Hl7Message<'a> {
    segments: Vec<Vec<&'a str>>,
    component_sep: char,
}

impl<'a> Hl7Message<'a> {
    fn parse(text: &'a str) -> Self {
        let mut field_sep = '|';
        let mut component_sep = '^';
        if let Some(rest) = text.trim_start().strip_prefix("MSH") {
            let mut chars = rest.chars();
            if let Some(f) = chars.next() {
                field_sep = f;
            }
            if let Some(c) = chars.next() {
                component_sep = c;
            }
        }

        let segments = text
            .split(['\r', '\n'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.split(field_sep).collect())
            .collect();

        Self {
            segments,
            component_sep,
        }
    }

    /// 1-based field and component of the first segment with this name
    fn component(&self, segment: &str, field: usize, component: usize) -> Option<&'a str> {
        let seg = self.segments.iter().find(|s| s.first() == Some(&segment))?;
        // MSH-1 is the field separator itself, so its fields are shifted by one
        let index = if segment == "MSH" { field - 1 } else { field };
        let value = seg.get(index)?;
        // the first repetition only
        let value = value.split('~').next().unwrap_or_default();
        value.split(self.component_sep).nth(component - 1)
    }
}
