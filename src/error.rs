//! Error types for the blob store

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Service-wide result type
pub type Result<T> = std::result::Result<T, BlobError>;

/// Errors surfaced by upload, lookup and removal
#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Size exceeded: declared {declared} bytes, received at least {received}")]
    SizeExceeded { declared: u64, received: u64 },

    #[error("Size mismatch: declared {declared} bytes, stream ended after {received}")]
    SizeMismatch { declared: u64, received: u64 },

    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("Upload idle for more than {0:?}")]
    IdleTimeout(Duration),

    #[error("Client disconnected: {0}")]
    Disconnected(String),

    #[error("Blob too large: {size} bytes (max: {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("Too many concurrent uploads (max: {max})")]
    TooManyUploads { max: usize },
}

impl BlobError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ProtocolViolation(_) => StatusCode::BAD_REQUEST,
            Self::SizeExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::SizeMismatch { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::IdleTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            Self::Disconnected(_) => StatusCode::BAD_REQUEST,
            Self::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::TooManyUploads { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
            Self::SizeExceeded { .. } => "SIZE_EXCEEDED",
            Self::SizeMismatch { .. } => "SIZE_MISMATCH",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Storage(_) => "STORAGE_FAILURE",
            Self::IdleTimeout(_) => "IDLE_TIMEOUT",
            Self::Disconnected(_) => "DISCONNECTED",
            Self::TooLarge { .. } => "TOO_LARGE",
            Self::TooManyUploads { .. } => "TOO_MANY_UPLOADS",
        }
    }
}

/// Failures of the byte medium or the metadata catalog
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("S3 SDK error: {0}")]
    SdkError(String),

    #[error("Content missing from storage: {0}")]
    ContentMissing(String),

    #[error("Corrupt catalog row: {0}")]
    CorruptCatalog(String),

    #[error("Length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },

    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for BlobError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error = match &self {
            BlobError::Storage(e) => {
                tracing::error!("Storage error: {}", e);
                "Storage failure".to_string()
            }
            _ => self.to_string(),
        };

        let body = Json(ErrorResponse {
            error,
            code: self.code(),
        });

        (status, body).into_response()
    }
}
