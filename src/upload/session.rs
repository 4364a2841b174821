//! Upload Session State Machine
//!
//! `AwaitingDeclaration -> Receiving -> Finalizing -> {Completed | Aborted}`
//!
//! A session owns the running digest and the staged bytes of one upload.
//! Staged bytes live only in session memory; nothing reaches the content
//! store until the stream has ended with exactly the declared byte count.

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::types::{SessionSnapshot, SessionStatus, StagedBlob, UploadMessage};
use crate::digest::Accumulator;
use crate::error::{BlobError, Result};

/// Upper bound on the up-front staging reservation
const INITIAL_RESERVE: u64 = 64 * 1024;

pub struct UploadSession {
    id: Uuid,
    status: SessionStatus,
    declared_size: Option<u64>,
    bytes_received: u64,
    accumulator: Accumulator,
    staged: BytesMut,
    max_size: u64,
    started_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn new(id: Uuid, max_size: u64) -> Self {
        Self {
            id,
            status: SessionStatus::AwaitingDeclaration,
            declared_size: None,
            bytes_received: 0,
            accumulator: Accumulator::new(),
            staged: BytesMut::new(),
            max_size,
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            status: self.status,
            declared_size: self.declared_size,
            bytes_received: self.bytes_received,
            started_at: self.started_at,
        }
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Apply the next inbound message; any error aborts the session
    pub fn apply(&mut self, message: UploadMessage) -> Result<()> {
        let result = match (self.status, message) {
            (SessionStatus::AwaitingDeclaration, UploadMessage::Declare { declared_size }) => {
                self.declare(declared_size)
            }
            (SessionStatus::AwaitingDeclaration, UploadMessage::Chunk(_)) => Err(
                BlobError::ProtocolViolation("first message must declare the blob size".into()),
            ),
            (SessionStatus::Receiving, UploadMessage::Chunk(data)) => self.receive(&data),
            (SessionStatus::Receiving, UploadMessage::Declare { .. }) => Err(
                BlobError::ProtocolViolation("blob size was already declared".into()),
            ),
            (status, _) => Err(BlobError::ProtocolViolation(format!(
                "session no longer accepts messages ({:?})",
                status
            ))),
        };

        if result.is_err() {
            self.abort();
        }

        result
    }

    fn declare(&mut self, declared_size: u64) -> Result<()> {
        if declared_size > self.max_size {
            return Err(BlobError::TooLarge {
                size: declared_size,
                max: self.max_size,
            });
        }

        self.staged.reserve(declared_size.min(INITIAL_RESERVE) as usize);
        self.declared_size = Some(declared_size);
        self.status = SessionStatus::Receiving;
        Ok(())
    }

    fn receive(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let declared = self.declared_size.unwrap_or(0);
        let received = self.bytes_received + data.len() as u64;
        if received > declared {
            return Err(BlobError::SizeExceeded { declared, received });
        }

        self.accumulator.update(data);
        self.staged.extend_from_slice(data);
        self.bytes_received = received;
        Ok(())
    }

    /// Close the inbound stream; yields the staged blob on an exact byte count
    pub fn end_of_stream(&mut self) -> Result<StagedBlob> {
        let result = match self.status {
            SessionStatus::AwaitingDeclaration => Err(BlobError::ProtocolViolation(
                "stream ended before the blob size was declared".into(),
            )),
            SessionStatus::Receiving => {
                let declared = self.declared_size.unwrap_or(0);
                if self.bytes_received == declared {
                    self.status = SessionStatus::Finalizing;
                    let digest = std::mem::take(&mut self.accumulator).finalize();
                    let data = std::mem::take(&mut self.staged).freeze();
                    Ok(StagedBlob {
                        digest,
                        size: declared,
                        data,
                    })
                } else {
                    Err(BlobError::SizeMismatch {
                        declared,
                        received: self.bytes_received,
                    })
                }
            }
            status => Err(BlobError::ProtocolViolation(format!(
                "stream already closed ({:?})",
                status
            ))),
        };

        if result.is_err() {
            self.abort();
        }

        result
    }

    pub fn complete(&mut self) {
        debug_assert_eq!(self.status, SessionStatus::Finalizing);
        self.status = SessionStatus::Completed;
    }

    /// Drop staged bytes and mark the session aborted
    pub fn abort(&mut self) {
        if self.status.is_terminal() {
            return;
        }

        self.status = SessionStatus::Aborted;
        self.staged = BytesMut::new();
        self.accumulator = Accumulator::new();
    }
}

// ============================================================================
// Tests
// ============================================================================
