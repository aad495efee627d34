//! Operator endpoints.

use std::sync::Arc;

use axum::{
    extract::State,
    middleware,
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use thinkforward_common::Capability;

use crate::auth::{require_capability, require_identity, CurrentIdentity};
use crate::error::ApiError;
use crate::AppState;

/// Run a reconciliation sweep now and return its report.
async fn trigger_sync(
    State(state): State<Arc<AppState>>,
    CurrentIdentity(identity): CurrentIdentity,
) -> Result<Json<Value>, ApiError> {
    require_capability(&identity, Capability::ManageUsers)?;

    tracing::info!(user_id = %identity.user_id, "Manual reconciliation sweep requested");
    let report = state.sweep.run().await;

    Ok(Json(json!({ "success": true, "data": report })))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/sync", post(trigger_sync))
        .route_layer(middleware::from_fn_with_state(state.sessions.clone(), require_identity))
        .with_state(state)
}
