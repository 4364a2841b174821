//! Upload protocol types

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::digest::ContentDigest;

// ============================================================================
// Protocol Messages
// ============================================================================

/// One inbound message of a streamed upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadMessage {
    /// Must come first: total bytes the client is about to send
    Declare { declared_size: u64 },

    /// Next slice of content; empty chunks are keep-alives
    Chunk(Bytes),
}

impl UploadMessage {
    pub fn declare(declared_size: u64) -> Self {
        Self::Declare { declared_size }
    }

    pub fn chunk(data: impl Into<Bytes>) -> Self {
        Self::Chunk(data.into())
    }
}

/// Single response to a completed upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub id: String,
    pub size: u64,
    pub sha256: ContentDigest,
}

// ============================================================================
// Session State
// ============================================================================

/// Upload session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    /// Waiting for the size declaration
    AwaitingDeclaration,
    /// Streaming content chunks
    Receiving,
    /// Stream ended with the declared byte count; storing
    Finalizing,
    /// Stored and registered
    Completed,
    /// Failed or cancelled; nothing was kept
    Aborted,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

/// Content fully received and hashed, not yet durable
#[derive(Debug, Clone)]
pub struct StagedBlob {
    pub digest: ContentDigest,
    pub size: u64,
    pub data: Bytes,
}

/// Point-in-time view of a live session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub declared_size: Option<u64>,
    pub bytes_received: u64,
    pub started_at: DateTime<Utc>,
}
