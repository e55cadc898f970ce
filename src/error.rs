use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Structured JSON error returned by every gateway handler:
/// `{"error": "..."}` with an explicit status code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        tracing::error!(error = %err, "store operation failed");
        ApiError::internal("storage error")
    }
}

/// Errors from the KV store and job queue backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the client runtime at its `ready()`/`refresh()`
/// boundary. Evaluation itself never returns these; evaluation errors are
/// recovered into the result's reason/error detail.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("API key was rejected: {0}")]
    InvalidApiKey(String),
    #[error("snapshot for environment '{0}' is not published")]
    SnapshotUnavailable(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response from gateway: {0}")]
    Protocol(String),
    #[error("client failed during initialization and must be rebuilt")]
    InitFailed,
    #[error("client is not ready")]
    NotReady,
}

/// Errors from the two queue consumers; any of these leaves the delivery
/// unacked for redelivery.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("upstream call failed: {0}")]
    Upstream(String),
}
