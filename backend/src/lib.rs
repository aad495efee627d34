pub mod auth;
pub mod config;
pub mod directory;
pub mod error;
pub mod identity_provider;
pub mod logging;
pub mod routes;
pub mod sweep;
pub mod sync;
pub mod test_util;
pub mod webhooks;

pub use auth::{AuthError, CurrentIdentity, JwksVerifier, SessionResolver, TokenVerifier};
pub use config::Config;
pub use directory::{SqliteDirectory, User, UserDirectory};
pub use error::ApiError;
pub use identity_provider::{IdentityProvider, ProviderClient};
pub use sweep::{PartialSyncFailure, ReconciliationSweep, SyncReport};
pub use webhooks::WebhookIngestor;

use std::sync::Arc;
use std::time::Duration;

use axum::{http::HeaderValue, middleware, Router};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub directory: Arc<dyn UserDirectory>,
    /// Resolves bearer credentials for protected routes.
    pub sessions: Arc<SessionResolver>,
    pub webhooks: WebhookIngestor,
    pub sweep: Arc<ReconciliationSweep>,
}

impl AppState {
    /// Wire the components around the given collaborators.
    pub fn new(
        config: Config,
        directory: Arc<dyn UserDirectory>,
        verifier: Arc<dyn TokenVerifier>,
        provider: Arc<dyn IdentityProvider>,
    ) -> Self {
        let sessions = Arc::new(SessionResolver::new(
            verifier,
            Arc::clone(&directory),
            Arc::clone(&provider),
        ));
        let webhooks = WebhookIngestor::new(
            config.webhook.secret.clone(),
            config.webhook.tolerance_secs,
            Arc::clone(&directory),
            Arc::clone(&provider),
        );
        let sweep = Arc::new(ReconciliationSweep::new(
            provider,
            Arc::clone(&directory),
            config.sync.batch_size,
        ));

        Self {
            config,
            directory,
            sessions,
            webhooks,
            sweep,
        }
    }

    /// Build production collaborators from configuration.
    pub fn from_config(config: Config) -> Result<Self, BoxError> {
        let directory = Arc::new(SqliteDirectory::open(&config.database.url)?);
        let verifier = Arc::new(JwksVerifier::new(&config.identity_provider)?);
        let provider = Arc::new(ProviderClient::from_config(&config.identity_provider)?);

        Ok(Self::new(config, directory, verifier, provider))
    }
}

fn cors_layer(origins: &str) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any).max_age(Duration::from_secs(3600));

    if origins.trim() == "*" {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = origins
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .filter_map(|o| match o.parse() {
            Ok(origin) => Some(origin),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin: {}", o);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.cors.origins);

    Router::new()
        .merge(routes::health::router())
        .merge(routes::webhooks::router(state.clone()))
        .merge(routes::me::router(state.clone()))
        .nest("/admin", routes::admin::router(state))
        .layer(middleware::from_fn(logging::request_logger))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
