use std::sync::Arc;

use axum::{middleware, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::auth::{require_identity, CurrentIdentity};
use crate::AppState;

/// The caller's identity and resolved capabilities.
async fn me(CurrentIdentity(identity): CurrentIdentity) -> Json<Value> {
    Json(json!({ "success": true, "data": identity }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/me", get(me))
        .route_layer(middleware::from_fn_with_state(state.sessions.clone(), require_identity))
}
