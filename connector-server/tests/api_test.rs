//! HTTP API integration tests
//!
//! The connector is served on a random port in front of a mock FHIR server
//! and driven with reqwest.

mod common;

use common::{
    MockFhir, SERVER_NAME, connector_state, register_mock_servers, save_labs_query,
    serve_connector, start_mock_fhir,
};
use connector_server::AppState;
use connector_server::auth::Role;
use connector_server::config::{ApiKey, BasicAuthUser, ServerConfig};
use serde_json::{Value, json};
use std::sync::Arc;
use tempfile::TempDir;

const HL7_MESSAGE: &str = "{MSH|^~\\&|SENDING|FACILITY|QC|DIBBS|20240101120000||ORU^R01|MSG0001|P|2.5.1
PID|1||8692756^^^Facility^MR||Unlucky^Hyper||19751206|M|||123 Main St^Apt 4^Boston^MA^02101
NK1|1|Unlucky^Lucky|MTH|^^^^^^|555-123-4567
}";

struct TestApp {
    base_url: String,
    state: Arc<AppState>,
    query_id: String,
    mock: MockFhir,
    _dir: TempDir,
}

async fn start(config: ServerConfig) -> TestApp {
    let mock = start_mock_fhir().await;
    let dir = TempDir::new().unwrap();
    let state = connector_state(&dir, config);
    register_mock_servers(&state, &mock).await;
    let query_id = save_labs_query(&state).await;
    let base_url = serve_connector(Arc::clone(&state)).await;
    TestApp {
        base_url,
        state,
        query_id,
        mock,
        _dir: dir,
    }
}

fn diagnostics(body: &Value) -> &str {
    body["issue"][0]["diagnostics"].as_str().unwrap_or_default()
}

fn secured_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.auth.enabled = true;
    // Loopback mock servers still need to be accepted
    config.server.demo_mode = true;
    config.auth.api_keys = vec![ApiKey {
        name: "reporter".to_string(),
        key: "reporter-key".to_string(),
        role: Role::Standard,
    }];
    config.auth.basic_auth = vec![BasicAuthUser {
        username: "admin".to_string(),
        password: "admin123".to_string(),
        role: Role::Admin,
    }];
    config
}

#[tokio::test]
async fn test_health_check() {
    let app = start(ServerConfig::default()).await;
    let resp = reqwest::get(format!("{}/health", app.base_url)).await.unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_get_query() {
    let app = start(ServerConfig::default()).await;
    let resp = reqwest::get(format!(
        "{}/api/query?id={}&fhir_server={}&given=Hyper&family=Unlucky&dob=1975-12-06",
        app.base_url,
        app.query_id,
        urlencoding::encode(SERVER_NAME)
    ))
    .await
    .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["resourceType"], "Bundle");
    assert_eq!(body["type"], "searchset");
    assert_eq!(body["total"], 5);
    assert_eq!(body["entry"][0]["resource"]["resourceType"], "Patient");
    assert_eq!(body["entry"][0]["resource"]["id"], "p1");
}

#[tokio::test]
async fn test_get_query_validation_order() {
    let app = start(ServerConfig::default()).await;
    let server = urlencoding::encode(SERVER_NAME).into_owned();
    let cases = [
        (
            format!("fhir_server={}&family=Unlucky", server),
            500,
            "Missing id or fhir_server.",
        ),
        (
            format!("id={}&fhir_server=Elsewhere&family=Unlucky", app.query_id),
            500,
            "Invalid fhir_server. Please provide a valid fhir_server.",
        ),
        (
            format!("id=missing&fhir_server={}&family=Unlucky", server),
            500,
            "Query identified in the id param not found in the set of saved queries. Please provide an ID that exists in the saved set of queries.",
        ),
        (
            format!("id={}&fhir_server={}&city=&family=", app.query_id, server),
            400,
            "No patient identifiers to parse from requestBody.",
        ),
    ];

    for (query, status, message) in cases {
        let resp = reqwest::get(format!("{}/api/query?{}", app.base_url, query))
            .await
            .unwrap();
        assert_eq!(resp.status(), status, "{}", query);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["resourceType"], "OperationOutcome");
        assert_eq!(diagnostics(&body), message);
    }
    assert!(app.mock.received().await.is_empty());
}

#[tokio::test]
async fn test_get_query_by_address_or_email() {
    let app = start(ServerConfig::default()).await;
    let server = urlencoding::encode(SERVER_NAME).into_owned();
    let queries = [
        format!("id={}&fhir_server={}&email=hyper%40example.org", app.query_id, server),
        format!(
            "id={}&fhir_server={}&street1=123%20Main%20St&city=Boston&zip=02101",
            app.query_id, server
        ),
    ];

    for query in queries {
        let resp = reqwest::get(format!("{}/api/query?{}", app.base_url, query))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200, "{}", query);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["entry"][0]["resource"]["id"], "p1");
    }

    let patient_searches = app
        .mock
        .received()
        .await
        .into_iter()
        .filter(|r| r.starts_with("GET /Patient"))
        .count();
    assert_eq!(patient_searches, 2);
}

#[tokio::test]
async fn test_get_query_no_candidates() {
    let app = start(ServerConfig::default()).await;
    let resp = reqwest::get(format!(
        "{}/api/query?id={}&fhir_server={}&family=Nobody",
        app.base_url,
        app.query_id,
        urlencoding::encode(SERVER_NAME)
    ))
    .await
    .unwrap();
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(diagnostics(&body), "Patient not found in full patient discovery");
}

#[tokio::test]
async fn test_post_query_fhir_patient() {
    let app = start(ServerConfig::default()).await;
    let client = reqwest::Client::new();
    let url = format!(
        "{}/api/query?id={}&fhir_server={}",
        app.base_url,
        app.query_id,
        urlencoding::encode(SERVER_NAME)
    );

    let patient = json!({
        "resourceType": "Patient",
        "name": [{"family": "Unlucky", "given": ["Hyper"]}],
        "birthDate": "1975-12-06"
    });
    let resp = client.post(&url).json(&patient).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["total"], 5);

    let resp = client
        .post(&url)
        .json(&json!({"resourceType": "Observation", "id": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(diagnostics(&body), "Request body is not a Patient resource.");

    let resp = client
        .post(&url)
        .json(&json!({"resourceType": "Patient"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client.post(&url).body("not json").send().await.unwrap();
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert!(diagnostics(&body).starts_with("An error has occurred: "));
}

#[tokio::test]
async fn test_post_query_hl7() {
    let app = start(ServerConfig::default()).await;
    let client = reqwest::Client::new();
    let url = format!(
        "{}/api/query?use_case=syphilis&id={}&fhir_server={}&message_format=HL7",
        app.base_url,
        app.query_id,
        urlencoding::encode(SERVER_NAME)
    );

    let resp = client.post(&url).body(HL7_MESSAGE).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(
        app.mock
            .received()
            .await
            .contains(&"GET /Patient family=Unlucky".to_string())
    );

    let resp = client
        .post(url.replace("message_format=HL7", "message_format=XML"))
        .body(HL7_MESSAGE)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        diagnostics(&body),
        "Invalid message format. Format parameter needs to be either 'HL7' or 'FHIR'"
    );
}

#[tokio::test]
async fn test_fhir_server_names() {
    let app = start(ServerConfig::default()).await;
    let resp = reqwest::get(format!("{}/api/fhir-servers", app.base_url))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let names: Vec<String> = resp.json().await.unwrap();
    assert_eq!(names.len(), 2);
    assert_eq!(names[0], SERVER_NAME);
}

#[tokio::test]
async fn test_check_match_support() {
    let app = start(ServerConfig::default()).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/api/admin/fhir-servers/check-match", app.base_url))
        .json(&json!({"url": app.mock.base_url}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["supportsMatch"], true);
    assert_eq!(body["fhirVersion"], "4.0.1");
}

#[tokio::test]
async fn test_timebox_routes() {
    let app = start(ServerConfig::default()).await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/queries/{}/timebox", app.base_url, app.query_id);

    let resp = client
        .put(&url)
        .json(&json!({
            "conceptType": "labs",
            "timeWindowStart": "2024-01-01T00:00:00Z",
            "timeWindowEnd": "2024-03-31T00:00:00Z",
            "isRelativeRange": false
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = client.get(format!("{}/labs", url)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let window: Value = resp.json().await.unwrap();
    assert_eq!(window["timeWindowStart"], "2024-01-01T00:00:00Z");

    let resp = client.get(&url).send().await.unwrap();
    let resolved: Value = resp.json().await.unwrap();
    assert_eq!(resolved["labs"]["timeWindowEnd"], "2024-03-31T00:00:00Z");

    let resp = client.delete(format!("{}/labs", url)).send().await.unwrap();
    assert_eq!(resp.status(), 204);
    let resp = client.get(format!("{}/labs", url)).send().await.unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client.get(format!("{}/vitals", url)).send().await.unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_missing_credentials() {
    let app = start(secured_config()).await;
    let resp = reqwest::get(format!("{}/api/fhir-servers", app.base_url))
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = reqwest::get(format!("{}/health", app.base_url)).await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_role_checks() {
    let app = start(secured_config()).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/api/fhir-servers", app.base_url))
        .bearer_auth("reporter-key")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .get(format!("{}/api/admin/fhir-servers", app.base_url))
        .bearer_auth("reporter-key")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["issue"][0]["code"], "forbidden");
    assert_eq!(
        diagnostics(&body),
        "Not authorized: Super admin permission check for getFhirServerConfigs failed"
    );

    let query = json!({"queryName": "Cancer follow-up"});
    let resp = client
        .post(format!("{}/api/queries", app.base_url))
        .bearer_auth("reporter-key")
        .json(&query)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let entries = app.state.audit.lock().await.recent_entries(1).unwrap();
    assert_eq!(entries[0].action_type, "saveCustomQuery");
    assert!(!entries[0].success);

    let resp = client
        .post(format!("{}/api/queries", app.base_url))
        .basic_auth("admin", Some("admin123"))
        .json(&query)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let saved: Value = resp.json().await.unwrap();
    assert_eq!(saved["author"], "admin");

    let resp = client
        .get(format!(
            "{}/api/queries/by-name/{}",
            app.base_url,
            urlencoding::encode("Cancer follow-up")
        ))
        .bearer_auth("reporter-key")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let found: Value = resp.json().await.unwrap();
    assert_eq!(found["queryId"], saved["queryId"]);
}
