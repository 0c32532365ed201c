//! chanfed - ActivityPub federation engine for imageboards
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub endpoints (actors, inbox, outbox)            │
//! │  - WebFinger, admin, metrics                                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Federation Layer                         │
//! │  - Signatures, actor resolution, delivery                   │
//! │  - Inbox state machine, remote cache, archival              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - FederationStore trait                                    │
//! │  - SQLite (sqlx)                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `federation`: ActivityPub federation engine
//! - `data`: Store trait, SQLite implementation and models
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::sync::Arc;

use data::FederationStore;
use federation::{Federation, RetryPolicy};

/// Request bodies larger than this are refused before decoding.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// SQLite store
    pub db: Arc<data::Database>,

    /// Federation engine
    pub federation: Arc<Federation>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Build the outbound HTTP client
    /// 3. Wire the federation engine
    /// 4. Provision the main actor on first start
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        let policy = RetryPolicy::from_config(&config.federation);
        Self::with_retry_policy(config, policy).await
    }

    /// Same as [`AppState::new`] with an explicit delivery schedule.
    pub async fn with_retry_policy(
        config: config::AppConfig,
        policy: RetryPolicy,
    ) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        let http_client = reqwest::Client::builder()
            .user_agent(config.federation.user_agent.clone())
            .timeout(std::time::Duration::from_secs(
                config.federation.request_timeout_secs,
            ))
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;

        let federation =
            Federation::new(&config, db.clone(), http_client)?.with_retry_policy(policy);

        Self::ensure_main_actor(&db, &federation).await?;

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            federation: Arc::new(federation),
        })
    }

    /// The instance actor lives at the base URL and owns a key pair like
    /// any board.
    async fn ensure_main_actor(
        db: &data::Database,
        federation: &Federation,
    ) -> Result<(), error::AppError> {
        if let Some(main) = db.get_actor_by_id_or_name("main").await? {
            tracing::info!(actor = %main.id, "Main actor exists");
            return Ok(());
        }

        let main = federation
            .provision_board("main", "Main", "Instance actor")
            .await?;
        tracing::info!(actor = %main.id, "Main actor created");
        Ok(())
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{
        compression::CompressionLayer, limit::RequestBodyLimitLayer, trace::TraceLayer,
    };

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .nest("/admin", api::admin_router())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}
