//! Session Tracker
//!
//! Keeps a snapshot of every in-flight upload for the status endpoint and
//! enforces the concurrent-upload cap. Sessions deregister when their
//! ticket drops, whichever way the upload ends.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use super::session::UploadSession;
use super::types::SessionSnapshot;
use crate::error::{BlobError, Result};

#[derive(Clone)]
pub struct SessionTracker {
    inner: Arc<SessionTrackerInner>,
}

struct SessionTrackerInner {
    /// Live sessions indexed by ID
    sessions: RwLock<HashMap<Uuid, SessionSnapshot>>,

    /// Maximum concurrent uploads (0 = unlimited)
    max_concurrent: usize,
}

impl SessionTracker {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(SessionTrackerInner {
                sessions: RwLock::new(HashMap::new()),
                max_concurrent,
            }),
        }
    }

    /// Register a session, refusing once the cap is reached
    pub fn begin(&self, session: &UploadSession) -> Result<SessionTicket> {
        let mut sessions = self.inner.sessions.write();

        if self.inner.max_concurrent > 0 && sessions.len() >= self.inner.max_concurrent {
            return Err(BlobError::TooManyUploads {
                max: self.inner.max_concurrent,
            });
        }

        sessions.insert(session.id(), session.snapshot());

        Ok(SessionTicket {
            tracker: self.clone(),
            session_id: session.id(),
        })
    }

    pub fn active_sessions(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<_> = self.inner.sessions.read().values().cloned().collect();
        snapshots.sort_by_key(|s| s.started_at);
        snapshots
    }

    pub fn active_count(&self) -> usize {
        self.inner.sessions.read().len()
    }
}

/// Registration of one live session; deregisters on drop
pub struct SessionTicket {
    tracker: SessionTracker,
    session_id: Uuid,
}

impl SessionTicket {
    /// Refresh the tracked snapshot
    pub fn update(&self, session: &UploadSession) {
        if let Some(entry) = self.tracker.inner.sessions.write().get_mut(&self.session_id) {
            *entry = session.snapshot();
        }
    }
}

impl Drop for SessionTicket {
    fn drop(&mut self) {
        self.tracker.inner.sessions.write().remove(&self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::{SessionStatus, UploadMessage};

    #[test]
    fn test_ticket_tracks_and_deregisters() {
        let tracker = SessionTracker::new(0);
        let mut session = UploadSession::new(Uuid::new_v4(), 1024);

        let ticket = tracker.begin(&session).unwrap();
        assert_eq!(tracker.active_count(), 1);

        session.apply(UploadMessage::declare(8)).unwrap();
        ticket.update(&session);

        let snapshots = tracker.active_sessions();
        assert_eq!(snapshots[0].session_id, session.id());
        assert_eq!(snapshots[0].status, SessionStatus::Receiving);
        assert_eq!(snapshots[0].declared_size, Some(8));

        drop(ticket);
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn test_concurrent_cap() {
        let tracker = SessionTracker::new(1);
        let first = UploadSession::new(Uuid::new_v4(), 1024);
        let second = UploadSession::new(Uuid::new_v4(), 1024);

        let ticket = tracker.begin(&first).unwrap();
        assert!(matches!(
            tracker.begin(&second),
            Err(BlobError::TooManyUploads { max: 1 })
        ));

        drop(ticket);
        assert!(tracker.begin(&second).is_ok());
    }
}
