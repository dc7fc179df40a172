//! ModPatrol - moderation automation against a remote content platform
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Target dispatch / batch endpoints                        │
//! │  - Auto-reply toggle and rule admin                         │
//! │  - SSE log stream, metrics                                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Service Layer                            │
//! │  - Account pool, report executor, auto-reply engine         │
//! │  - Scheduler coordinator, log sink                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Platform + Data Layer                           │
//! │  - Signed HTTP client (request signer, key cache)           │
//! │  - SQLite (sqlx)                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: thin HTTP handlers for dispatch, admin and log streaming
//! - `service`: business logic layer
//! - `platform`: request signing and the signed platform client
//! - `data`: database layer and runtime settings
//! - `config`: configuration management
//! - `error`: error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod platform;
pub mod service;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains
/// shared resources like the database pool, the signed platform
/// client, and the service objects built on top of them.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// HTTP client shared by signer and platform client
    pub http_client: Arc<reqwest::Client>,

    /// Request signer with its process-wide key cache
    pub signer: Arc<platform::RequestSigner>,

    /// Signed platform client
    pub client: Arc<platform::PlatformClient>,

    /// Account pool with the process-wide failure tally
    pub pool: Arc<service::AccountPool>,

    /// Execution log sink and live stream
    pub sink: Arc<service::LogSink>,

    /// Report executor over the target queue
    pub executor: Arc<service::ReportExecutor>,

    /// Shared auto-reply poll cycle
    pub engine: Arc<service::AutoReplyEngine>,

    /// Standalone auto-reply toggle
    pub autoreply: Arc<service::AutoReplyService>,

    /// Scheduler coordinator
    pub scheduler: Arc<service::SchedulerCoordinator>,

    /// Root cancellation token; cancelled on shutdown so running
    /// cycles and batches stop between units of work
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Build the shared HTTP client
    /// 3. Wire signer, platform client and services
    /// 4. Seed default scheduled tasks
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        // 2. Shared HTTP client
        let http_client = Arc::new(
            reqwest::Client::builder()
                .timeout(Duration::from_secs(config.platform.request_timeout_seconds))
                .build()
                .map_err(|e| error::AppError::Internal(e.into()))?,
        );

        // 3. Platform integration
        let signer = Arc::new(platform::RequestSigner::new(
            http_client.clone(),
            &config.platform.base_url,
            Duration::from_secs(config.platform.signing_key_ttl_seconds),
        ));
        let client = Arc::new(platform::PlatformClient::new(
            http_client.clone(),
            &config.platform.base_url,
            signer.clone(),
            config.platform.default_user_agent.clone(),
        ));

        // 4. Services
        let pool = Arc::new(service::AccountPool::new(
            db.clone(),
            client.clone(),
            config.executor.account_failure_threshold,
        ));
        let sink = Arc::new(service::LogSink::new(db.clone()));
        let retry_policy = service::RetryPolicy {
            max_retries: config.executor.max_attempt_retries,
            base_delay: Duration::from_millis(config.executor.backoff_base_ms),
            cap: Duration::from_millis(config.executor.backoff_cap_ms),
        };
        let executor = Arc::new(service::ReportExecutor::new(
            db.clone(),
            client.clone(),
            pool.clone(),
            sink.clone(),
            retry_policy,
            config.executor.max_target_retries,
            config.executor.max_concurrency,
        ));
        let engine = Arc::new(service::AutoReplyEngine::new(
            db.clone(),
            client.clone(),
            pool.clone(),
            sink.clone(),
        ));
        let autoreply = Arc::new(service::AutoReplyService::new(db.clone(), engine.clone()));
        let scheduler = Arc::new(service::SchedulerCoordinator::new(
            db.clone(),
            engine.clone(),
            pool.clone(),
            sink.clone(),
        ));

        // 5. Seed default scheduled tasks (disabled until toggled)
        scheduler.ensure_default_tasks().await?;

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            http_client,
            signer,
            client,
            pool,
            sink,
            executor,
            engine,
            autoreply,
            scheduler,
            shutdown: CancellationToken::new(),
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{cors::CorsLayer, trace::TraceLayer};

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .nest("/api", api::api_router())
        .merge(api::metrics_router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
