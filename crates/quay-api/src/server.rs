//! API server implementation.
//!
//! Wires the stores into shared state, mounts the routes and applies the
//! middleware stack (request ids, metrics, tracing, CORS, auth, rate limits,
//! timeouts).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::error_handling::HandleErrorLayer;
use axum::extract::State;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{BoxError, Json, Router};
use serde::{Deserialize, Serialize};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower::timeout::TimeoutLayer;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use quay_core::{MemoryBackend, Result};
use quay_store::{
    DocumentStore, ObjectDocumentStore, Reconciler, RelationalStore, Repository,
    SqliteDocumentStore, SqliteStore, SyncEngine,
};

use crate::config::{Config, CorsConfig, StorageConfig, SyncConfig};
use crate::error::ApiError;
use crate::rate_limit::{RateLimitConfig, RateLimitState, PRUNE_INTERVAL};

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
}

/// Readiness check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadyResponse {
    /// Service readiness status.
    pub ready: bool,
    /// Optional message about readiness state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The two stores every request handler writes through.
#[derive(Clone)]
pub struct Stores {
    /// Source of truth.
    pub relational: Arc<dyn RelationalStore>,
    /// Mirror for edge readers.
    pub documents: Arc<dyn DocumentStore>,
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores")
            .field("relational", &"<RelationalStore>")
            .field("documents", &"<DocumentStore>")
            .finish()
    }
}

impl Stores {
    /// Opens the stores named by the configuration.
    ///
    /// A missing path falls back to an in-memory store; callers decide
    /// whether that is acceptable.
    ///
    /// # Errors
    ///
    /// Returns an error if a database file cannot be opened or migrated.
    pub fn open(storage: &StorageConfig, sync: &SyncConfig) -> quay_store::Result<Self> {
        let relational: Arc<dyn RelationalStore> = match storage.database_path.as_deref() {
            Some(path) => {
                tracing::info!(path = %path.display(), "opening relational store");
                Arc::new(SqliteStore::open(path)?)
            }
            None => Arc::new(SqliteStore::open_in_memory()?),
        };
        let documents: Arc<dyn DocumentStore> = match storage.document_db_path.as_deref() {
            Some(path) => {
                tracing::info!(path = %path.display(), "opening document store");
                Arc::new(SqliteDocumentStore::open(path)?)
            }
            None => Arc::new(
                ObjectDocumentStore::new(Arc::new(MemoryBackend::new()))
                    .with_max_cas_retries(sync.mirror_cas_retries),
            ),
        };
        Ok(Self {
            relational,
            documents,
        })
    }

    /// Creates in-memory stores.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn in_memory() -> quay_store::Result<Self> {
        Self::open(&StorageConfig::default(), &SyncConfig::default())
    }
}

/// Shared application state for all request handlers.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    repository: Repository,
    sync: SyncEngine,
    reconciler: Reconciler,
    rate_limit: Arc<RateLimitState>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("sync", &self.sync)
            .field("rate_limit", &self.rate_limit)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Creates application state over the given stores.
    #[must_use]
    pub fn new(config: Config, stores: Stores) -> Self {
        let rate_limit = Arc::new(RateLimitState::new(config.rate_limit.clone()));
        let sync = SyncEngine::new(Arc::clone(&stores.relational), Arc::clone(&stores.documents))
            .with_limits(config.sync.limits());
        Self {
            repository: Repository::new(
                Arc::clone(&stores.relational),
                Arc::clone(&stores.documents),
            ),
            reconciler: Reconciler::new(stores.relational, stores.documents),
            sync,
            rate_limit,
            config,
        }
    }

    /// Returns the CRUD repository.
    #[must_use]
    pub const fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Returns the sync engine.
    #[must_use]
    pub const fn sync(&self) -> &SyncEngine {
        &self.sync
    }

    /// Returns the reconciler.
    #[must_use]
    pub const fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }
}

/// Health check endpoint handler.
///
/// Returns 200 OK if the process is alive; dependencies are not checked.
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Readiness check endpoint handler.
///
/// Pings both stores; 503 if either is unreachable.
async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let relational = state.repository.relational().ping().await;
    let documents = state.repository.documents().ping().await;

    match (relational, documents) {
        (Ok(()), Ok(())) => (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                message: None,
            }),
        ),
        (Err(e), _) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                message: Some(format!("relational store check failed: {e}")),
            }),
        ),
        (_, Err(e)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                message: Some(format!("document store check failed: {e}")),
            }),
        ),
    }
}

async fn openapi_json() -> impl IntoResponse {
    Json(crate::openapi::openapi())
}

async fn handle_timeout_error(err: BoxError) -> ApiError {
    if err.is::<tower::timeout::error::Elapsed>() {
        ApiError::service_unavailable("request timed out")
    } else {
        ApiError::internal(format!("unhandled middleware error: {err}"))
    }
}

/// The Quay API server.
pub struct Server {
    config: Config,
    stores: Stores,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("stores", &self.stores)
            .finish()
    }
}

impl Server {
    /// Creates a server over explicit stores.
    #[must_use]
    pub fn with_stores(config: Config, stores: Stores) -> Self {
        Self { config, stores }
    }

    /// Creates a new `ServerBuilder`.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Returns the server configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Creates the router with all routes and middleware.
    fn create_router(&self) -> Router {
        self.router_for(Arc::new(AppState::new(self.config.clone(), self.stores.clone())))
    }

    fn router_for(&self, state: Arc<AppState>) -> Router {

        let cors = Self::build_cors_layer(&self.config.cors);
        let auth_layer =
            middleware::from_fn_with_state(Arc::clone(&state), crate::context::auth_middleware);
        let rate_limit_layer = middleware::from_fn_with_state(
            Arc::clone(&state.rate_limit),
            crate::rate_limit::rate_limit_middleware,
        );
        let metrics_layer = middleware::from_fn(crate::metrics::metrics_middleware);

        let router = Router::new()
            // Health, ready, metrics and docs (no auth required)
            .route("/health", get(health))
            .route("/ready", get(ready))
            .route("/metrics", get(crate::metrics::serve_metrics))
            .route("/openapi.json", get(openapi_json))
            .nest(
                "/api/v1",
                crate::routes::api_v1_routes()
                    .route_layer(rate_limit_layer)
                    .layer(auth_layer),
            )
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(metrics_layer);

        // One semaphore shared by every route.
        let router = match self.config.concurrency_limit {
            Some(limit) => router.layer(GlobalConcurrencyLimitLayer::new(limit)),
            None => router,
        };

        let router = match self.config.request_timeout_secs {
            Some(secs) => router.layer(
                ServiceBuilder::new()
                    .layer(HandleErrorLayer::new(handle_timeout_error))
                    .layer(TimeoutLayer::new(Duration::from_secs(secs))),
            ),
            None => router,
        };

        // Outermost so timeouts and auth failures carry the id too.
        router
            .layer(middleware::from_fn(crate::context::request_id_middleware))
            .with_state(state)
    }

    fn build_cors_layer(cors_config: &CorsConfig) -> CorsLayer {
        let cors = CorsLayer::new()
            .allow_methods([
                Method::GET,
                Method::HEAD,
                Method::POST,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([
                header::AUTHORIZATION,
                header::CONTENT_TYPE,
                header::ACCEPT,
                header::HeaderName::from_static("x-request-id"),
                header::HeaderName::from_static("x-user-id"),
                header::HeaderName::from_static("x-roles"),
            ])
            .expose_headers([
                header::CONTENT_TYPE,
                header::CONTENT_LENGTH,
                header::RETRY_AFTER,
                header::HeaderName::from_static("x-request-id"),
            ])
            .max_age(Duration::from_secs(cors_config.max_age_seconds));

        if cors_config.allowed_origins.is_empty() {
            return cors;
        }
        if cors_config.allowed_origins.len() == 1 && cors_config.allowed_origins[0] == "*" {
            return cors.allow_origin(Any);
        }
        if cors_config.allowed_origins.iter().any(|origin| origin == "*") {
            tracing::error!(
                origins = ?cors_config.allowed_origins,
                "invalid CORS config: '*' must be the only allowed origin"
            );
            return cors;
        }

        let allowed: Vec<HeaderValue> = cors_config
            .allowed_origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::error!(origin = %origin, "invalid CORS origin");
                    None
                }
            })
            .collect();

        if allowed.is_empty() {
            tracing::warn!("all configured CORS origins were invalid; disabling CORS");
            cors
        } else {
            tracing::info!(origins = ?cors_config.allowed_origins, "CORS configured");
            cors.allow_origin(AllowOrigin::list(allowed))
        }
    }

    /// Starts the server and blocks until shutdown (Ctrl-C).
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is unsafe or the port cannot be bound.
    pub async fn serve(&self) -> Result<()> {
        self.validate_config()?;
        crate::metrics::init_metrics();

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let state = Arc::new(AppState::new(self.config.clone(), self.stores.clone()));
        let pruner = self
            .config
            .rate_limit
            .enabled
            .then(|| RateLimitState::spawn_pruner(&state.rate_limit, PRUNE_INTERVAL));
        let router = self.router_for(state);

        tracing::info!(
            http_port = self.config.http_port,
            debug = self.config.debug,
            batch_size = self.config.sync.batch_size,
            event_sync_max_records = self.config.sync.event_sync_max_records,
            "starting Quay API server"
        );

        let listener =
            tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| quay_core::Error::Internal {
                    message: format!("failed to bind to {addr}: {e}"),
                })?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| quay_core::Error::Internal {
                message: format!("server error: {e}"),
            })?;

        if let Some(pruner) = pruner {
            pruner.abort();
        }
        Ok(())
    }

    /// Creates a test router for the server without binding a port.
    #[doc(hidden)]
    pub fn test_router(&self) -> Router {
        self.create_router()
    }

    /// Rejects configurations that are only acceptable in debug mode.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` describing the first problem found.
    pub fn validate_config(&self) -> Result<()> {
        if self.config.debug {
            return Ok(());
        }

        if self.config.cors.allowed_origins.iter().any(|o| o == "*") {
            return Err(quay_core::Error::InvalidInput(
                "cors.allowed_origins cannot include '*' when debug=false".to_string(),
            ));
        }

        if self.config.uses_memory_stores() {
            return Err(quay_core::Error::InvalidInput(
                "QUAY_DATABASE_PATH and QUAY_DOCUMENT_DB_PATH are required when debug=false"
                    .to_string(),
            ));
        }

        let has_hs256_secret = self.config.jwt.hs256_secret.is_some();
        let has_rs256_public_key = self.config.jwt.rs256_public_key_pem.is_some();
        if !has_hs256_secret && !has_rs256_public_key {
            return Err(quay_core::Error::InvalidInput(
                "jwt.hs256_secret or jwt.rs256_public_key_pem is required when debug=false"
                    .to_string(),
            ));
        }
        if has_hs256_secret && has_rs256_public_key {
            return Err(quay_core::Error::InvalidInput(
                "jwt.hs256_secret and jwt.rs256_public_key_pem are mutually exclusive".to_string(),
            ));
        }

        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

/// Builder for constructing a server.
#[derive(Debug, Default)]
pub struct ServerBuilder {
    config: Config,
    stores: Option<Stores>,
}

impl ServerBuilder {
    /// Creates a new server builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the HTTP port.
    #[must_use]
    pub fn http_port(mut self, port: u16) -> Self {
        self.config.http_port = port;
        self
    }

    /// Enables debug mode (header-based identity instead of JWT).
    #[must_use]
    pub fn debug(mut self, enabled: bool) -> Self {
        self.config.debug = enabled;
        self
    }

    /// Sets the JWT HS256 secret used for bearer token verification.
    #[must_use]
    pub fn jwt_hs256_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.jwt.hs256_secret = Some(secret.into());
        self
    }

    /// Sets the rate limiting configuration.
    #[must_use]
    pub fn rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.config.rate_limit = rate_limit;
        self
    }

    /// Sets sync batching and caps.
    #[must_use]
    pub fn sync(mut self, sync: SyncConfig) -> Self {
        self.config.sync = sync;
        self
    }

    /// Sets the stores used by request handlers.
    ///
    /// By default the server uses in-memory stores intended only for tests/dev.
    #[must_use]
    pub fn stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    /// Builds the server.
    ///
    /// # Errors
    ///
    /// Returns an error if default in-memory stores cannot be created.
    pub fn build(self) -> quay_store::Result<Server> {
        let stores = match self.stores {
            Some(stores) => stores,
            None => Stores::open(&StorageConfig::default(), &self.config.sync)?,
        };
        Ok(Server {
            config: self.config,
            stores,
        })
    }
}
