//! Identity-provider webhook endpoint.
//!
//! The raw body is passed through untouched; signatures are computed over
//! the exact bytes the sender delivered.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::webhooks::{Ack, WebhookError};
use crate::AppState;

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::InvalidSignature(_) => ApiError::InvalidSignature,
            WebhookError::Malformed(_) => ApiError::BadRequest("Malformed payload".to_string()),
            WebhookError::Directory(e) => ApiError::Internal(e.to_string()),
            WebhookError::Provider(e) => ApiError::Internal(e.to_string()),
        }
    }
}

async fn ingest(state: &AppState, event: Option<&str>, headers: &HeaderMap, body: &[u8]) -> Result<Json<Value>, ApiError> {
    let ack = state.webhooks.handle(event, headers, body).await?;

    Ok(Json(match ack {
        Ack::Processed => json!({ "success": true }),
        Ack::Skipped(reason) => json!({ "success": true, "skipped": reason }),
    }))
}

async fn receive(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    ingest(&state, None, &headers, &body).await
}

async fn receive_event(
    State(state): State<Arc<AppState>>,
    Path(event): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    ingest(&state, Some(&event), &headers, &body).await
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhooks/identity", post(receive))
        .route("/webhooks/identity/:event", post(receive_event))
        .with_state(state)
}
