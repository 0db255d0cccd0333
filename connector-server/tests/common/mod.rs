//! Shared harness: an in-process mock FHIR server and a connector instance
//! backed by temporary databases.

#![allow(dead_code)]

use axum::{
    Form, Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{Duration, Utc};
use connector_core::{
    AuthData, AuthType, Concept, ConceptType, DibbsValueSet, FhirServerInput,
    MedicalRecordSections, PatientMatchConfiguration, SavedQuery,
};
use connector_server::{AppState, auth::SessionUser, build_router, config::ServerConfig};
use connector_store::{AuditLog, SqliteStore};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;

pub const SERVER_NAME: &str = "Mock FHIR";
pub const MATCH_SERVER_NAME: &str = "Mock FHIR $match";
pub const TOKEN_SERVER_NAME: &str = "Mock FHIR client credentials";
pub const SMART_SERVER_NAME: &str = "Mock FHIR SMART";

/// Access token handed out by the mock token endpoint
pub const ISSUED_TOKEN: &str = "issued-token";
pub const ISSUED_TOKEN_EXPIRES_IN: i64 = 600;

/// Requests the mock received, as "METHOD path"
pub type RequestLog = Arc<Mutex<Vec<String>>>;

/// Form bodies, one per request
pub type FormLog = Arc<Mutex<Vec<Vec<(String, String)>>>>;

/// `_search` POSTs as (path, form params), duplicates kept
pub type SearchLog = Arc<Mutex<Vec<(String, Vec<(String, String)>)>>>;

#[derive(Clone, Default)]
struct MockState {
    base_url: String,
    requests: RequestLog,
    authorizations: RequestLog,
    token_requests: FormLog,
    searches: SearchLog,
}

impl MockState {
    async fn record_authorization(&self, headers: &HeaderMap) {
        if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            self.authorizations.lock().await.push(value.to_string());
        }
    }
}

pub struct MockFhir {
    pub base_url: String,
    pub requests: RequestLog,
    pub authorizations: RequestLog,
    pub token_requests: FormLog,
    pub searches: SearchLog,
}

impl MockFhir {
    pub async fn received(&self) -> Vec<String> {
        self.requests.lock().await.clone()
    }

    pub async fn received_authorizations(&self) -> Vec<String> {
        self.authorizations.lock().await.clone()
    }

    pub async fn received_token_requests(&self) -> Vec<Vec<(String, String)>> {
        self.token_requests.lock().await.clone()
    }

    /// Form params of every `_search` POST to `path`
    pub async fn searches_to(&self, path: &str) -> Vec<Vec<(String, String)>> {
        self.searches
            .lock()
            .await
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, params)| params.clone())
            .collect()
    }

    pub fn token_endpoint(&self) -> String {
        format!("{}/token", self.base_url)
    }
}

/// Values of `name` in a form body, in the order they were sent
pub fn form_values<'a>(params: &'a [(String, String)], name: &str) -> Vec<&'a str> {
    params
        .iter()
        .filter(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
        .collect()
}

pub fn bundle(resources: Vec<Value>) -> Value {
    let entry: Vec<Value> = resources.into_iter().map(|r| json!({"resource": r})).collect();
    json!({
        "resourceType": "Bundle",
        "type": "searchset",
        "total": entry.len(),
        "entry": entry,
    })
}

fn resource(resource_type: &str, id: &str) -> Value {
    json!({"resourceType": resource_type, "id": id})
}

fn patient(id: &str) -> Value {
    json!({
        "resourceType": "Patient",
        "id": id,
        "name": [{"family": "Unlucky", "given": ["Hyper"]}],
        "birthDate": "1975-12-06"
    })
}

fn uncertain_match() -> Value {
    json!({
        "resourceType": "OperationOutcome",
        "issue": [{
            "severity": "information",
            "code": "informational",
            "details": {"text": "Patient $match did not find a certain match"}
        }]
    })
}

async fn patient_search(
    State(mock): State<MockState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    mock.record_authorization(&headers).await;
    let family = params.get("family").cloned().unwrap_or_default();
    mock.requests
        .lock()
        .await
        .push(format!("GET /Patient family={}", family));
    match family.as_str() {
        "Nobody" => Json(bundle(vec![])),
        _ => Json(bundle(vec![patient("p1"), patient("p2")])),
    }
}

async fn patient_match(State(mock): State<MockState>, body: Bytes) -> Response {
    let parameters: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let family = parameters
        .pointer("/parameter/0/resource/name/0/family")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    mock.requests
        .lock()
        .await
        .push(format!("POST /Patient/$match family={}", family));
    match family.as_str() {
        "Maybe" => (StatusCode::UNPROCESSABLE_ENTITY, Json(uncertain_match())).into_response(),
        _ => Json(bundle(vec![patient("m1")])).into_response(),
    }
}

async fn search_log(
    mock: &MockState,
    headers: &HeaderMap,
    path: &str,
    params: &[(String, String)],
) {
    mock.record_authorization(headers).await;
    let subject = form_values(params, "subject").concat();
    mock.requests
        .lock()
        .await
        .push(format!("POST {} subject={}", path, subject));
    mock.searches
        .lock()
        .await
        .push((path.to_string(), params.to_vec()));
}

async fn observation_search(
    State(mock): State<MockState>,
    headers: HeaderMap,
    Form(params): Form<Vec<(String, String)>>,
) -> Json<Value> {
    search_log(&mock, &headers, "/Observation/_search", &params).await;
    if form_values(&params, "category") == ["social-history"] {
        return Json(bundle(vec![resource("Observation", "sdoh-1")]));
    }
    Json(bundle(vec![
        resource("Observation", "obs-1"),
        resource("Observation", "obs-2"),
    ]))
}

async fn diagnostic_report_search(
    State(mock): State<MockState>,
    headers: HeaderMap,
    Form(params): Form<Vec<(String, String)>>,
) -> Json<Value> {
    search_log(&mock, &headers, "/DiagnosticReport/_search", &params).await;
    // The report's result is included and repeats an Observation
    Json(bundle(vec![
        resource("DiagnosticReport", "dr-1"),
        resource("Observation", "obs-1"),
    ]))
}

async fn condition_search(
    State(mock): State<MockState>,
    headers: HeaderMap,
    Form(params): Form<Vec<(String, String)>>,
) -> Response {
    search_log(&mock, &headers, "/Condition/_search", &params).await;
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"resourceType": "OperationOutcome", "issue": []})),
    )
        .into_response()
}

async fn encounter_search(
    State(mock): State<MockState>,
    headers: HeaderMap,
    Form(params): Form<Vec<(String, String)>>,
) -> Json<Value> {
    search_log(&mock, &headers, "/Encounter/_search", &params).await;
    Json(bundle(vec![resource("Encounter", "enc-1")]))
}

async fn immunization_search(
    State(mock): State<MockState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    mock.record_authorization(&headers).await;
    let subject = params.get("subject").cloned().unwrap_or_default();
    mock.requests
        .lock()
        .await
        .push(format!("GET /Immunization subject={}", subject));
    Json(bundle(vec![resource("Immunization", "imm-1")]))
}

async fn metadata() -> Json<Value> {
    Json(json!({
        "resourceType": "CapabilityStatement",
        "fhirVersion": "4.0.1",
        "rest": [{
            "mode": "server",
            "resource": [{
                "type": "Patient",
                "operation": [{
                    "name": "match",
                    "definition": "http://hl7.org/fhir/OperationDefinition/Patient-match"
                }]
            }]
        }]
    }))
}

async fn smart_configuration(State(mock): State<MockState>) -> Json<Value> {
    mock.requests
        .lock()
        .await
        .push("GET /.well-known/smart-configuration".to_string());
    Json(json!({
        "token_endpoint": format!("{}/token", mock.base_url),
        "grant_types_supported": ["client_credentials"],
    }))
}

async fn token(
    State(mock): State<MockState>,
    Form(params): Form<Vec<(String, String)>>,
) -> Json<Value> {
    mock.requests.lock().await.push("POST /token".to_string());
    mock.token_requests.lock().await.push(params);
    Json(json!({
        "access_token": ISSUED_TOKEN,
        "token_type": "bearer",
        "expires_in": ISSUED_TOKEN_EXPIRES_IN,
    }))
}

/// Start the mock FHIR server on a random local port
pub async fn start_mock_fhir() -> MockFhir {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mock = MockState {
        base_url: format!("http://{}", addr),
        ..Default::default()
    };

    let app = Router::new()
        .route("/Patient", get(patient_search))
        .route("/Patient/$match", post(patient_match))
        .route("/Observation/_search", post(observation_search))
        .route("/DiagnosticReport/_search", post(diagnostic_report_search))
        .route("/Condition/_search", post(condition_search))
        .route("/Encounter/_search", post(encounter_search))
        .route("/Immunization", get(immunization_search))
        .route("/metadata", get(metadata))
        .route("/.well-known/smart-configuration", get(smart_configuration))
        .route("/token", post(token))
        .with_state(mock.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockFhir {
        base_url: mock.base_url,
        requests: mock.requests,
        authorizations: mock.authorizations,
        token_requests: mock.token_requests,
        searches: mock.searches,
    }
}

/// Connector state on temporary databases; auth is disabled, so plain-http
/// loopback FHIR servers are accepted
pub fn connector_state(dir: &TempDir, config: ServerConfig) -> Arc<AppState> {
    let store = SqliteStore::open(dir.path().join("connector.sqlite")).unwrap();
    let audit = AuditLog::open(dir.path().join("audit.sqlite")).unwrap();
    AppState::new(config, store, audit)
}

/// Serve the connector on a random local port, returns its base URL
pub async fn serve_connector(state: Arc<AppState>) -> String {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    format!("http://{}", addr)
}

/// Register the mock twice: once searched by demographics, once by `$match`
pub async fn register_mock_servers(state: &AppState, mock: &MockFhir) {
    let admin = SessionUser::local_super_admin();
    let pipeline = state.pipeline(&admin);

    let mut plain = FhirServerInput::new(SERVER_NAME, mock.base_url.as_str());
    plain.default_server = true;
    state.fhir_servers.insert(&pipeline, plain).await.unwrap();

    let mut matching = FhirServerInput::new(MATCH_SERVER_NAME, mock.base_url.as_str());
    matching.patient_match_configuration = Some(PatientMatchConfiguration {
        enabled: true,
        only_single_match: false,
        only_certain_matches: true,
        match_count: 0,
        supports_match: true,
    });
    state.fhir_servers.insert(&pipeline, matching).await.unwrap();
}

/// Syphilis labs plus the immunization section; returns the query id
pub async fn save_labs_query(state: &AppState) -> String {
    let admin = SessionUser::local_super_admin();
    let query = SavedQuery::new("", "Syphilis case investigation")
        .with_value_set(
            "76272004",
            DibbsValueSet::new(
                "2.16.840.1.113762.1.4.1146.1",
                "Syphilis labs",
                ConceptType::Labs,
                vec![
                    Concept::new("20507-0", "Reagin Ab [Presence] in Serum"),
                    Concept::new("5292-8", "Reagin Ab [Presence] in Serum by VDRL").excluded(),
                ],
            ),
        )
        .with_sections(MedicalRecordSections {
            immunizations: true,
            social_determinants: false,
        });
    state
        .saved_queries
        .save_query(&state.pipeline(&admin), query)
        .await
        .unwrap()
        .query_id
}

/// Client-credentials server whose stored token has already expired
pub async fn register_token_server(state: &AppState, mock: &MockFhir) {
    let admin = SessionUser::local_super_admin();
    let mut input = FhirServerInput::new(TOKEN_SERVER_NAME, mock.base_url.as_str());
    input.auth_data = AuthData {
        auth_type: AuthType::ClientCredentials,
        client_id: Some("qc-client".into()),
        client_secret: Some("qc-secret".into()),
        token_endpoint: Some(mock.token_endpoint()),
        scopes: Some("system/*.read".into()),
        access_token: Some("expired-token".into()),
        token_expiry: Some(Utc::now() - Duration::minutes(5)),
        ..Default::default()
    };
    state
        .fhir_servers
        .insert(&state.pipeline(&admin), input)
        .await
        .unwrap();
}

/// SMART backend-services server with no token endpoint configured
pub async fn register_smart_server(state: &AppState, mock: &MockFhir) {
    let admin = SessionUser::local_super_admin();
    let mut input = FhirServerInput::new(SMART_SERVER_NAME, mock.base_url.as_str());
    input.auth_data = AuthData {
        auth_type: AuthType::Smart,
        client_id: Some("qc-smart-client".into()),
        ..Default::default()
    };
    state
        .fhir_servers
        .insert(&state.pipeline(&admin), input)
        .await
        .unwrap();
}

/// Config whose SMART signing key and JWKS are the test fixtures
pub fn smart_config() -> ServerConfig {
    let fixtures = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");
    let mut config = ServerConfig::default();
    config.smart.private_key_file = fixtures.join("smart-private.pem");
    config.smart.jwks_file = fixtures.join("jwks.json");
    config.smart.app_hostname = Some("https://qc.example.org".into());
    config
}
