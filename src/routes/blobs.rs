//! Blob Routes
//!
//! Endpoints:
//! - POST /api/v1/blobs - Streamed upload; `x-declared-size` header declares the size
//! - GET /api/v1/blobs/:id - Download blob bytes
//! - GET /api/v1/blobs/:id/meta - Blob metadata
//! - DELETE /api/v1/blobs/:id - Remove blob

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use serde::Serialize;

use crate::digest::ContentDigest;
use crate::error::BlobError;
use crate::state::AppState;
use crate::upload::{UploadMessage, UploadReceipt};

/// Header carrying the size declaration of an upload
pub const DECLARED_SIZE_HEADER: &str = "x-declared-size";

/// Header carrying the SHA-256 of downloaded content
pub const CONTENT_SHA256_HEADER: &str = "x-content-sha256";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobMeta {
    pub id: String,
    pub sha256: ContentDigest,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Router
// ============================================================================

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(upload_blob))
        .route("/:id", get(download_blob).delete(remove_blob))
        .route("/:id/meta", get(blob_meta))
        .layer(DefaultBodyLimit::disable())
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/blobs
async fn upload_blob(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<UploadReceipt>), BlobError> {
    let declaration = declared_size(&headers)?;

    let chunks = body
        .into_data_stream()
        .map(|frame| frame.map(UploadMessage::Chunk));
    let messages = stream::iter(declaration.map(|size| Ok(UploadMessage::declare(size)))).chain(chunks);

    let receipt = state.service().upload(messages).await?;

    Ok((StatusCode::CREATED, Json(receipt)))
}

/// GET /api/v1/blobs/:id
async fn download_blob(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, BlobError> {
    let (entry, data) = state.service().fetch(&id).await?;

    let headers = [
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (HeaderName::from_static(CONTENT_SHA256_HEADER), entry.digest.to_hex()),
    ];

    Ok((headers, data))
}

/// GET /api/v1/blobs/:id/meta
async fn blob_meta(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BlobMeta>, BlobError> {
    let entry = state.service().lookup(&id)?;

    Ok(Json(BlobMeta {
        id: entry.id.to_string(),
        sha256: entry.digest,
        size: state.service().size_of(&entry),
        created_at: entry.created_at,
    }))
}

/// DELETE /api/v1/blobs/:id
async fn remove_blob(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, BlobError> {
    state.service().remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Parse the size declaration; an absent header yields no declaration message
fn declared_size(headers: &HeaderMap) -> Result<Option<u64>, BlobError> {
    let Some(value) = headers.get(DECLARED_SIZE_HEADER) else {
        return Ok(None);
    };

    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| {
            BlobError::ProtocolViolation(format!("invalid {} header", DECLARED_SIZE_HEADER))
        })
}

// ============================================================================
// Tests
// ============================================================================
