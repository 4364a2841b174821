//! Content Store
//!
//! Reference-counted, content-addressed storage. Bytes are written once per
//! distinct digest; every further `put` of the same digest only bumps the
//! refcount, and the bytes are deleted when `release` drops it to zero.
//!
//! Mutations of one digest are serialized by a per-digest async lock held
//! across the storage I/O. Unrelated digests never contend.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;

use crate::db::Catalog;
use crate::digest::ContentDigest;
use crate::error::StorageError;
use crate::storage::ByteStorage;

// ============================================================================
// Types
// ============================================================================

/// Bookkeeping for one distinct piece of content
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentRecord {
    pub digest: ContentDigest,
    pub size: u64,
    pub refcount: u64,
    pub stored_at: DateTime<Utc>,
}

/// What a `put` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// New content; bytes were written
    Stored,
    /// Content already present; only the refcount moved
    Deduplicated { refcount: u64 },
}

/// What a `release` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Decremented { refcount: u64 },
    /// Last reference dropped; bytes deleted
    Purged,
    /// Digest was not in the store
    Unknown,
}

/// Aggregate figures for the stats endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentStats {
    pub records: usize,
    pub stored_bytes: u64,
}

// ============================================================================
// Content Store
// ============================================================================

#[derive(Clone)]
pub struct ContentStore {
    inner: Arc<ContentStoreInner>,
}

struct ContentStoreInner {
    /// Byte medium
    backend: Arc<dyn ByteStorage>,

    /// Optional write-through persistence
    catalog: Option<Catalog>,

    /// Live records by digest
    records: RwLock<HashMap<ContentDigest, ContentRecord>>,

    /// Per-digest mutation locks, pruned when unused
    locks: Mutex<HashMap<ContentDigest, Arc<tokio::sync::Mutex<()>>>>,
}

/// Holds a digest's lock; prunes the lock table entry on drop
struct DigestLock<'a> {
    inner: &'a ContentStoreInner,
    digest: ContentDigest,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DigestLock<'_> {
    fn drop(&mut self) {
        self.guard.take();

        let mut locks = self.inner.locks.lock();
        let unused = locks
            .get(&self.digest)
            .map(|lock| Arc::strong_count(lock) == 1)
            .unwrap_or(false);
        if unused {
            locks.remove(&self.digest);
        }
    }
}

impl ContentStore {
    pub fn new(backend: Arc<dyn ByteStorage>) -> Self {
        Self::build(backend, None)
    }

    pub fn with_catalog(backend: Arc<dyn ByteStorage>, catalog: Catalog) -> Self {
        Self::build(backend, Some(catalog))
    }

    fn build(backend: Arc<dyn ByteStorage>, catalog: Option<Catalog>) -> Self {
        Self {
            inner: Arc::new(ContentStoreInner {
                backend,
                catalog,
                records: RwLock::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    async fn lock(&self, digest: &ContentDigest) -> DigestLock<'_> {
        let lock = {
            let mut locks = self.inner.locks.lock();
            locks.entry(*digest).or_default().clone()
        };

        DigestLock {
            inner: &self.inner,
            digest: *digest,
            guard: Some(lock.lock_owned().await),
        }
    }

    async fn persist(&self, record: &ContentRecord) -> Result<(), StorageError> {
        match &self.inner.catalog {
            Some(catalog) => catalog.save_content(record).await,
            None => Ok(()),
        }
    }

    // ========================================================================
    // Put / Release
    // ========================================================================

    /// Store content, or add a reference if the digest is already present
    pub async fn put(
        &self,
        digest: &ContentDigest,
        data: Bytes,
        size: u64,
    ) -> Result<PutOutcome, StorageError> {
        if data.len() as u64 != size {
            return Err(StorageError::LengthMismatch {
                expected: size,
                actual: data.len() as u64,
            });
        }

        let _lock = self.lock(digest).await;

        let existing = self.inner.records.read().get(digest).cloned();
        if let Some(mut record) = existing {
            record.refcount += 1;
            self.persist(&record).await?;

            let refcount = record.refcount;
            self.inner.records.write().insert(*digest, record);

            tracing::debug!(
                digest = %digest,
                refcount = refcount,
                "Content already stored, added reference"
            );

            return Ok(PutOutcome::Deduplicated { refcount });
        }

        self.inner.backend.put(digest, data).await?;

        let record = ContentRecord {
            digest: *digest,
            size,
            refcount: 1,
            stored_at: Utc::now(),
        };

        if let Err(e) = self.persist(&record).await {
            if let Err(cleanup) = self.inner.backend.delete(digest).await {
                tracing::warn!(digest = %digest, error = %cleanup, "Failed to remove unrecorded content");
            }
            return Err(e);
        }

        self.inner.records.write().insert(*digest, record);

        tracing::debug!(
            digest = %digest,
            size = size,
            backend = self.inner.backend.name(),
            "Stored new content"
        );

        Ok(PutOutcome::Stored)
    }

    /// Drop one reference; deletes the bytes when none remain
    ///
    /// Unknown digests are a logged no-op. If the physical delete fails the
    /// reference is kept and the error returned.
    pub async fn release(&self, digest: &ContentDigest) -> Result<ReleaseOutcome, StorageError> {
        let _lock = self.lock(digest).await;

        let existing = self.inner.records.read().get(digest).cloned();
        let Some(mut record) = existing else {
            tracing::warn!(digest = %digest, "Release of unknown content ignored");
            return Ok(ReleaseOutcome::Unknown);
        };

        if record.refcount > 1 {
            record.refcount -= 1;
            self.persist(&record).await?;

            let refcount = record.refcount;
            self.inner.records.write().insert(*digest, record);

            tracing::debug!(digest = %digest, refcount = refcount, "Released content reference");
            return Ok(ReleaseOutcome::Decremented { refcount });
        }

        self.inner.backend.delete(digest).await?;
        self.inner.records.write().remove(digest);

        if let Some(catalog) = &self.inner.catalog {
            // A lingering row is reconciled to zero references at next start-up
            if let Err(e) = catalog.delete_content(digest).await {
                tracing::warn!(digest = %digest, error = %e, "Failed to drop catalog row for purged content");
            }
        }

        tracing::info!(digest = %digest, size = record.size, "Purged unreferenced content");
        Ok(ReleaseOutcome::Purged)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Read content bytes, `None` if no live record exists
    pub async fn get(&self, digest: &ContentDigest) -> Result<Option<Bytes>, StorageError> {
        if !self.contains(digest) {
            return Ok(None);
        }

        if let Some(data) = self.inner.backend.get(digest).await? {
            return Ok(Some(data));
        }

        // A release may have purged the bytes mid-read; wait for it to settle
        let _lock = self.lock(digest).await;
        if !self.contains(digest) {
            return Ok(None);
        }

        self.inner
            .backend
            .get(digest)
            .await?
            .map(Some)
            .ok_or_else(|| StorageError::ContentMissing(digest.to_hex()))
    }

    pub fn contains(&self, digest: &ContentDigest) -> bool {
        self.inner.records.read().contains_key(digest)
    }

    pub fn record(&self, digest: &ContentDigest) -> Option<ContentRecord> {
        self.inner.records.read().get(digest).cloned()
    }

    pub fn refcount(&self, digest: &ContentDigest) -> u64 {
        self.record(digest).map(|r| r.refcount).unwrap_or(0)
    }

    pub fn stats(&self) -> ContentStats {
        let records = self.inner.records.read();
        ContentStats {
            records: records.len(),
            stored_bytes: records.values().map(|r| r.size).sum(),
        }
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Reconcile persisted records against the true reference counts
    ///
    /// Records whose count is zero are purged from the medium and catalog;
    /// the rest are installed with the given count.
    pub async fn restore(
        &self,
        records: Vec<ContentRecord>,
        references: &HashMap<ContentDigest, u64>,
    ) -> Result<(), StorageError> {
        let mut restored = HashMap::new();

        for mut record in records {
            let actual = references.get(&record.digest).copied().unwrap_or(0);

            if actual == 0 {
                self.inner.backend.delete(&record.digest).await?;
                if let Some(catalog) = &self.inner.catalog {
                    catalog.delete_content(&record.digest).await?;
                }
                tracing::info!(digest = %record.digest, "Purged unreferenced content during recovery");
                continue;
            }

            if actual != record.refcount {
                tracing::warn!(
                    digest = %record.digest,
                    recorded = record.refcount,
                    actual = actual,
                    "Corrected content refcount"
                );
                record.refcount = actual;
                self.persist(&record).await?;
            }

            restored.insert(record.digest, record);
        }

        *self.inner.records.write() = restored;
        Ok(())
    }

    /// Delete objects on the medium that have no content record
    ///
    /// These are left by a crash between the byte write and the catalog row.
    /// Only safe before uploads are accepted. Returns the number deleted.
    pub async fn sweep_unrecorded(&self) -> Result<usize, StorageError> {
        let mut swept = 0;

        for digest in self.inner.backend.list().await? {
            if self.contains(&digest) {
                continue;
            }

            self.inner.backend.delete(&digest).await?;
            tracing::info!(digest = %digest, "Removed object without content record");
            swept += 1;
        }

        Ok(swept)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryByteStorage;

    fn memory_store() -> (ContentStore, Arc<MemoryByteStorage>) {
        let backend = Arc::new(MemoryByteStorage::new());
        (ContentStore::new(backend.clone()), backend)
    }

    #[tokio::test]
    async fn test_put_then_dedup() {
        let (store, backend) = memory_store();
        let data = Bytes::from_static(b"same bytes");
        let digest = ContentDigest::of(&data);

        let first = store.put(&digest, data.clone(), 10).await.unwrap();
        let second = store.put(&digest, data.clone(), 10).await.unwrap();

        assert_eq!(first, PutOutcome::Stored);
        assert_eq!(second, PutOutcome::Deduplicated { refcount: 2 });
        assert_eq!(store.refcount(&digest), 2);
        assert_eq!(backend.len(), 1);
        assert_eq!(store.get(&digest).await.unwrap(), Some(data));
    }

    #[tokio::test]
    async fn test_release_purges_at_zero() {
        let (store, backend) = memory_store();
        let data = Bytes::from_static(b"short lived");
        let digest = ContentDigest::of(&data);

        store.put(&digest, data.clone(), 11).await.unwrap();
        store.put(&digest, data, 11).await.unwrap();

        assert_eq!(
            store.release(&digest).await.unwrap(),
            ReleaseOutcome::Decremented { refcount: 1 }
        );
        assert!(backend.contains(&digest));

        assert_eq!(store.release(&digest).await.unwrap(), ReleaseOutcome::Purged);
        assert!(!store.contains(&digest));
        assert!(!backend.contains(&digest));
        assert_eq!(store.get(&digest).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_release_unknown_is_noop() {
        let (store, _) = memory_store();
        let digest = ContentDigest::of(b"never stored");

        assert_eq!(store.release(&digest).await.unwrap(), ReleaseOutcome::Unknown);
        assert_eq!(store.stats(), ContentStats::default());
    }

    #[tokio::test]
    async fn test_length_mismatch_rejected() {
        let (store, backend) = memory_store();
        let data = Bytes::from_static(b"abc");
        let digest = ContentDigest::of(&data);

        let result = store.put(&digest, data, 4).await;
        assert!(matches!(result, Err(StorageError::LengthMismatch { expected: 4, actual: 3 })));
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_puts_and_releases_keep_count() {
        let (store, backend) = memory_store();
        let data = Bytes::from_static(b"contended");
        let digest = ContentDigest::of(&data);

        let puts: Vec<_> = (0..32)
            .map(|_| {
                let store = store.clone();
                let data = data.clone();
                tokio::spawn(async move { store.put(&digest, data, 9).await })
            })
            .collect();
        for put in puts {
            put.await.unwrap().unwrap();
        }
        assert_eq!(store.refcount(&digest), 32);

        let releases: Vec<_> = (0..31)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.release(&digest).await })
            })
            .collect();
        for release in releases {
            release.await.unwrap().unwrap();
        }

        assert_eq!(store.refcount(&digest), 1);
        assert!(backend.contains(&digest));
        assert!(store.inner.locks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_restore_recounts_and_purges() {
        let (store, backend) = memory_store();
        let kept = Bytes::from_static(b"kept");
        let dropped = Bytes::from_static(b"dropped");
        let kept_digest = ContentDigest::of(&kept);
        let dropped_digest = ContentDigest::of(&dropped);

        backend.put(&kept_digest, kept).await.unwrap();
        backend.put(&dropped_digest, dropped).await.unwrap();

        let records = vec![
            ContentRecord { digest: kept_digest, size: 4, refcount: 5, stored_at: Utc::now() },
            ContentRecord { digest: dropped_digest, size: 7, refcount: 1, stored_at: Utc::now() },
        ];
        let references = HashMap::from([(kept_digest, 2)]);

        store.restore(records, &references).await.unwrap();

        assert_eq!(store.refcount(&kept_digest), 2);
        assert!(!store.contains(&dropped_digest));
        assert!(!backend.contains(&dropped_digest));
        assert_eq!(store.stats(), ContentStats { records: 1, stored_bytes: 4 });
    }

    #[tokio::test]
    async fn test_sweep_unrecorded_keeps_live_content() {
        let (store, backend) = memory_store();
        let live = Bytes::from_static(b"live");
        let live_digest = ContentDigest::of(&live);
        store.put(&live_digest, live, 4).await.unwrap();

        // Bytes written without a record, as after a crash mid-put
        let stray = ContentDigest::of(b"stray");
        backend.put(&stray, Bytes::from_static(b"stray")).await.unwrap();

        assert_eq!(store.sweep_unrecorded().await.unwrap(), 1);
        assert!(!backend.contains(&stray));
        assert!(backend.contains(&live_digest));
        assert_eq!(store.refcount(&live_digest), 1);
    }
}
