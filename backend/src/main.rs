use std::sync::Arc;

use tokio::net::TcpListener;

use thinkforward_backend::{build_router, logging, AppState, BoxError, Config};

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Load configuration
    let config = Config::load()?;

    logging::init(&config.logging.level);

    tracing::info!("Starting ThinkForward identity service");

    let state = Arc::new(AppState::from_config(config.clone())?);

    if !config.sync.enabled {
        tracing::info!("Reconciliation sweep disabled");
    } else if config.identity_provider.secret_key.is_empty() {
        tracing::warn!("Reconciliation sweep enabled but identity_provider.secret_key is empty, not scheduling");
    } else {
        Arc::clone(&state.sweep).spawn_daily(config.sync.run_at_hour);
    }

    let app = build_router(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
