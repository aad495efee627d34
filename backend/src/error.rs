//! HTTP-facing error type.
//!
//! Every failure that reaches a client is rendered as
//! `{"success": false, "error": "<message>"}`. Authentication failures all
//! share one message so responses do not reveal whether an account exists.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thinkforward_common::Capability;

const UNAUTHORIZED: &str = "Unauthorized";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Missing credential")]
    MissingCredential,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Missing capability: {0}")]
    Forbidden(Capability),

    #[error("Directory unavailable")]
    DirectoryUnavailable,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingCredential
            | ApiError::InvalidToken
            | ApiError::InvalidSignature
            | ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::DirectoryUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to the client. Internal details stay in the logs.
    fn public_message(&self) -> String {
        match self {
            ApiError::MissingCredential | ApiError::InvalidToken | ApiError::Unauthorized => {
                UNAUTHORIZED.to_string()
            }
            ApiError::InvalidSignature => "Invalid signature".to_string(),
            ApiError::Forbidden(_) => "Forbidden".to_string(),
            ApiError::DirectoryUnavailable => "Service temporarily unavailable".to_string(),
            ApiError::BadRequest(msg) => msg.clone(),
            ApiError::Internal(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "error": self.public_message(),
        }));

        (self.status(), body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(error: ApiError) -> (StatusCode, serde_json::Value) {
        let response = error.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_auth_failures_share_one_message() {
        for error in [ApiError::MissingCredential, ApiError::InvalidToken, ApiError::Unauthorized] {
            let (status, body) = body_json(error).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body["success"], false);
            assert_eq!(body["error"], "Unauthorized");
        }
    }

    #[tokio::test]
    async fn test_internal_details_are_hidden() {
        let (status, body) = body_json(ApiError::Internal("disk I/O error at /var/db".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Internal server error");
    }

    #[tokio::test]
    async fn test_directory_unavailable_is_503() {
        let (status, body) = body_json(ApiError::DirectoryUnavailable).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "Service temporarily unavailable");
    }

    #[test]
    fn test_forbidden_status() {
        assert_eq!(ApiError::Forbidden(Capability::ManageUsers).status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::InvalidSignature.status(), StatusCode::UNAUTHORIZED);
    }
}
