//! query-connector - FHIR query construction and execution service
//!
//! Finds a patient on a configured FHIR server and gathers the records a
//! saved query asks for, merged into one searchset Bundle.

pub mod audit;
pub mod auth;
pub mod config;
pub mod fhir_client;
pub mod handlers;
pub mod pipeline;
pub mod query;
pub mod server_cache;
pub mod services;
pub mod tls;
pub mod token;

use axum::{
    Router,
    http::Method,
    routing::{get, post, put},
};
use connector_store::{AuditLog, SqliteStore};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

use crate::auth::SessionUser;
use crate::fhir_client::ClientSettings;
use crate::pipeline::Pipeline;
use crate::query::QueryEngine;
use crate::server_cache::ServerConfigCache;
use crate::services::{FhirServerService, SavedQueryService};

/// Application state
pub struct AppState {
    pub store: Arc<SqliteStore>,
    pub audit: Arc<Mutex<AuditLog>>,
    pub config: config::ServerConfig,
    pub servers: Arc<ServerConfigCache>,
    pub engine: QueryEngine,
    pub fhir_servers: FhirServerService,
    pub saved_queries: SavedQueryService,
    pub jwk_cache: tokio::sync::RwLock<auth::JwkCache>,
}

impl AppState {
    /// Wire the services around one store and one audit log
    pub fn new(config: config::ServerConfig, store: SqliteStore, audit: AuditLog) -> Arc<Self> {
        let store = Arc::new(store);
        let servers = Arc::new(ServerConfigCache::new(Arc::clone(&store)));
        let client_settings = Arc::new(ClientSettings::from_config(&config));

        Arc::new(Self {
            engine: QueryEngine::new(Arc::clone(&servers), Arc::clone(&client_settings)),
            fhir_servers: FhirServerService::new(Arc::clone(&servers), client_settings),
            saved_queries: SavedQueryService::new(Arc::clone(&store)),
            store,
            audit: Arc::new(Mutex::new(audit)),
            config,
            servers,
            jwk_cache: tokio::sync::RwLock::new(auth::JwkCache::new()),
        })
    }

    /// Operation pipeline acting for `user`
    pub fn pipeline<'a>(&'a self, user: &'a SessionUser) -> Pipeline<'a> {
        Pipeline::new(user, &self.audit)
    }
}

/// Build the application router with all routes and middleware
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        // Health check and published keys (auth-free)
        .route("/health", get(handlers::metadata::health_check))
        .route("/.well-known/jwks.json", get(handlers::metadata::jwks))
        // Query API
        .route(
            "/api/query",
            get(handlers::query::get_query).post(handlers::query::post_query),
        )
        .route("/api/patient-discovery", post(handlers::query::patient_discovery))
        .route("/api/patient-records", post(handlers::query::patient_records))
        // FHIR servers
        .route("/api/fhir-servers", get(handlers::fhir_servers::server_names))
        .route(
            "/api/admin/fhir-servers",
            get(handlers::fhir_servers::list_configs).post(handlers::fhir_servers::insert),
        )
        .route(
            "/api/admin/fhir-servers/test-connection",
            post(handlers::fhir_servers::test_connection),
        )
        .route(
            "/api/admin/fhir-servers/check-match",
            post(handlers::fhir_servers::check_supports_match),
        )
        .route(
            "/api/admin/fhir-servers/by-name/{name}",
            get(handlers::fhir_servers::config_by_name),
        )
        .route(
            "/api/admin/fhir-servers/by-name/{name}/connection-status",
            put(handlers::fhir_servers::update_connection_status),
        )
        .route(
            "/api/admin/fhir-servers/{id}",
            put(handlers::fhir_servers::update).delete(handlers::fhir_servers::delete),
        )
        // Saved queries and time windows
        .route(
            "/api/queries",
            get(handlers::saved_queries::list).post(handlers::saved_queries::save),
        )
        .route(
            "/api/queries/by-name/{name}",
            get(handlers::saved_queries::by_name),
        )
        .route(
            "/api/queries/{id}",
            get(handlers::saved_queries::by_id).delete(handlers::saved_queries::delete),
        )
        .route(
            "/api/queries/{id}/groups/{group_id}",
            put(handlers::saved_queries::link_to_group),
        )
        .route(
            "/api/queries/{id}/timebox",
            get(handlers::saved_queries::resolved_timebox)
                .put(handlers::saved_queries::update_timebox),
        )
        .route(
            "/api/queries/{id}/timebox/{concept_type}",
            get(handlers::saved_queries::timebox_range)
                .delete(handlers::saved_queries::delete_timebox),
        )
        // Middleware
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .layer(RequestBodyLimitLayer::new(16 * 1024 * 1024)) // 16MB
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
