use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use strata_net::NetError;
use strata_shared::protocol::Rejection;
use strata_shared::SharedError;
use strata_store::StoreError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Replication factor must be at least 1, got {0}")]
    InvalidReplicationFactor(usize),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error(transparent)]
    Shared(#[from] SharedError),

    #[error("No data directory available: {0}")]
    DataDir(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Rejected by policy")]
    PolicyBlocked,

    #[error("Peer rejected request: {0}")]
    Rejected(Rejection),
}

/// HTTP-facing error; maps node failures onto status codes with a JSON body.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Insufficient storage: {0}")]
    InsufficientStorage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<NodeError> for ApiError {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::Store(e) => e.into(),
            NodeError::PolicyBlocked => ApiError::Forbidden(err.to_string()),
            NodeError::Rejected(r) => ApiError::Conflict(r.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => ApiError::NotFound(err.to_string()),
            StoreError::EmptyBlob => ApiError::BadRequest(err.to_string()),
            StoreError::SizeExceeded { .. } => ApiError::PayloadTooLarge(err.to_string()),
            StoreError::CapacityExceeded { .. } => ApiError::InsufficientStorage(err.to_string()),
            StoreError::NotResponsible { .. } | StoreError::Protected { .. } => {
                ApiError::Conflict(err.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            ApiError::PayloadTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),
            ApiError::InsufficientStorage(_) => {
                (StatusCode::INSUFFICIENT_STORAGE, self.to_string())
            }
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "Internal error while serving request");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
