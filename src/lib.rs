//! Driftwood - A lightweight multi-actor ActivityPub federation server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub endpoints (actor, inbox, collections)        │
//! │  - Well-known discovery                                     │
//! │  - Local publish API                                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Federation Engine                           │
//! │  - Signature verification / signing                         │
//! │  - Actor resolution (WebFinger + actor fetch)               │
//! │  - Inbox state machine                                      │
//! │  - Delivery dispatcher (fan-out, retry)                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers for ActivityPub and the publish API
//! - `service`: Business logic layer
//! - `federation`: ActivityPub federation engine
//! - `data`: Database layer
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains
/// shared resources like the database pool and HTTP client.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// HTTP client for federation
    pub http_client: Arc<reqwest::Client>,

    /// Remote actor resolver (WebFinger + actor documents)
    pub resolver: Arc<federation::ActorResolver>,

    /// Outbound delivery dispatcher
    pub dispatcher: Arc<federation::DeliveryDispatcher>,

    /// Local content publisher
    pub publisher: Arc<service::OutboxPublisher>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Build the federation HTTP client
    /// 3. Wire up resolver, dispatcher, and publisher
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        // 2. HTTP client with a bounded timeout for all federation calls
        let http_client = Arc::new(
            reqwest::Client::builder()
                .user_agent(concat!("Driftwood/", env!("CARGO_PKG_VERSION")))
                .timeout(config.federation.http_timeout())
                .build()
                .map_err(|e| error::AppError::Internal(e.into()))?,
        );

        // 3. Federation engine components
        let base_url = config.server.base_url();
        let resolver = Arc::new(federation::ActorResolver::new(
            db.clone(),
            http_client.clone(),
            config.federation.actor_cache_ttl(),
            config.federation.allow_private_addresses,
        ));
        let dispatcher = Arc::new(federation::DeliveryDispatcher::new(
            db.clone(),
            http_client.clone(),
            base_url.clone(),
            config.federation.delivery_max_attempts,
            config.federation.delivery_base_backoff_seconds,
            config.federation.delivery_concurrency,
        ));
        let publisher = Arc::new(service::OutboxPublisher::new(
            db.clone(),
            dispatcher.clone(),
            base_url,
        ));

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            http_client,
            resolver,
            dispatcher,
            publisher,
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{compression::CompressionLayer, trace::TraceLayer};

    let cors_layer = build_cors_layer(&state.config.server);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .merge(api::publish_router())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
        .merge(api::metrics_router())
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
