//! Blob Service
//!
//! Ties the upload session state machine, content store and blob registry
//! together behind the two client operations, `upload` and `remove`, plus
//! the read-side queries the HTTP layer exposes.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::UploadConfig;
use crate::content_store::ContentStore;
use crate::db::Catalog;
use crate::error::{BlobError, Result, StorageError};
use crate::registry::{BlobEntry, BlobRegistry};
use crate::storage::ByteStorage;
use crate::upload::{
    SessionSnapshot, SessionTicket, SessionTracker, StagedBlob, UploadMessage, UploadReceipt,
    UploadSession,
};

/// Counts for the stats endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub blobs: usize,
    pub content_records: usize,
    pub stored_bytes: u64,
    pub active_uploads: usize,
}

/// Outcome of catalog recovery at start-up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub blobs: usize,
    pub content_records: usize,
    /// Entries whose content record was gone; dropped
    pub dangling_blobs: usize,
    /// Objects on the medium with no content record; deleted
    pub orphaned_objects: usize,
}

#[derive(Clone)]
pub struct BlobService {
    inner: Arc<BlobServiceInner>,
}

struct BlobServiceInner {
    content: ContentStore,
    registry: BlobRegistry,
    sessions: SessionTracker,
    catalog: Option<Catalog>,
    upload: UploadConfig,
}

impl BlobService {
    pub fn new(backend: Arc<dyn ByteStorage>, catalog: Option<Catalog>, upload: UploadConfig) -> Self {
        let (content, registry) = match &catalog {
            Some(catalog) => {
                let content = ContentStore::with_catalog(backend, catalog.clone());
                let registry = BlobRegistry::with_catalog(content.clone(), catalog.clone());
                (content, registry)
            }
            None => {
                let content = ContentStore::new(backend);
                let registry = BlobRegistry::new(content.clone());
                (content, registry)
            }
        };

        Self {
            inner: Arc::new(BlobServiceInner {
                content,
                registry,
                sessions: SessionTracker::new(upload.max_concurrent_uploads),
                catalog,
                upload,
            }),
        }
    }

    pub fn content_store(&self) -> &ContentStore {
        &self.inner.content
    }

    pub fn registry(&self) -> &BlobRegistry {
        &self.inner.registry
    }

    // ========================================================================
    // Upload
    // ========================================================================

    /// Run one streamed upload to completion or abort
    ///
    /// The first message must be a size declaration; every later message is
    /// a content chunk. Dropping the returned future aborts the session.
    pub async fn upload<S, E>(&self, messages: S) -> Result<UploadReceipt>
    where
        S: Stream<Item = std::result::Result<UploadMessage, E>>,
        E: Display,
    {
        let mut session = UploadSession::new(Uuid::new_v4(), self.inner.upload.max_blob_size);
        let ticket = self.inner.sessions.begin(&session)?;

        let result = self.drive(&mut session, &ticket, messages).await;

        match &result {
            Ok(receipt) => {
                tracing::info!(
                    session_id = %session.id(),
                    blob_id = %receipt.id,
                    digest = %receipt.sha256,
                    size = receipt.size,
                    "Upload completed"
                );
            }
            Err(e) => {
                session.abort();
                tracing::warn!(
                    session_id = %session.id(),
                    bytes_received = session.bytes_received(),
                    error = %e,
                    "Upload aborted"
                );
            }
        }

        result
    }

    async fn drive<S, E>(
        &self,
        session: &mut UploadSession,
        ticket: &SessionTicket,
        messages: S,
    ) -> Result<UploadReceipt>
    where
        S: Stream<Item = std::result::Result<UploadMessage, E>>,
        E: Display,
    {
        futures::pin_mut!(messages);
        let idle = self.inner.upload.idle_timeout;

        loop {
            let next = tokio::time::timeout(idle, messages.next())
                .await
                .map_err(|_| BlobError::IdleTimeout(idle))?;

            match next {
                Some(Ok(message)) => {
                    session.apply(message)?;
                    ticket.update(session);
                }
                Some(Err(e)) => return Err(BlobError::Disconnected(e.to_string())),
                None => break,
            }
        }

        let staged = session.end_of_stream()?;
        ticket.update(session);

        tracing::debug!(
            session_id = %session.id(),
            digest = %staged.digest,
            size = staged.size,
            "Finalizing upload"
        );

        let size = staged.size;
        let digest = staged.digest;
        let entry = PendingRegistration::spawn(self.inner.registry.clone(), staged)
            .wait()
            .await?;

        session.complete();

        Ok(UploadReceipt {
            id: entry.id.to_string(),
            size,
            sha256: digest,
        })
    }

    // ========================================================================
    // Remove / Queries
    // ========================================================================

    /// Remove a blob id; runs to completion even if the caller goes away
    pub async fn remove(&self, id: &str) -> Result<()> {
        let registry = self.inner.registry.clone();
        let id = id.to_string();

        tokio::spawn(async move { registry.remove(&id).await })
            .await
            .map_err(|e| StorageError::TaskFailed(e.to_string()))??;
        Ok(())
    }

    pub fn lookup(&self, id: &str) -> Result<BlobEntry> {
        self.inner.registry.lookup(id)
    }

    /// Blob entry, size and bytes for a download
    pub async fn fetch(&self, id: &str) -> Result<(BlobEntry, Bytes)> {
        let entry = self.inner.registry.lookup(id)?;
        let data = self
            .inner
            .content
            .get(&entry.digest)
            .await?
            .ok_or_else(|| BlobError::NotFound(id.to_string()))?;
        Ok((entry, data))
    }

    /// Stored size of a blob's content
    pub fn size_of(&self, entry: &BlobEntry) -> u64 {
        self.inner
            .content
            .record(&entry.digest)
            .map(|r| r.size)
            .unwrap_or(0)
    }

    pub fn active_uploads(&self) -> Vec<SessionSnapshot> {
        self.inner.sessions.active_sessions()
    }

    pub fn stats(&self) -> ServiceStats {
        let content = self.inner.content.stats();
        ServiceStats {
            blobs: self.inner.registry.len(),
            content_records: content.records,
            stored_bytes: content.stored_bytes,
            active_uploads: self.inner.sessions.active_count(),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Rebuild in-memory state from the catalog
    ///
    /// Refcounts are recomputed from the persisted blob entries; content with
    /// no remaining entry is purged, entries pointing at missing content are
    /// dropped, and objects the catalog never recorded are deleted.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let Some(catalog) = &self.inner.catalog else {
            return Ok(RecoveryReport::default());
        };

        let records = catalog.load_content().await?;
        let blobs = catalog.load_blobs().await?;

        let known: HashSet<_> = records.iter().map(|r| r.digest).collect();
        let mut references = HashMap::new();
        let mut live = Vec::with_capacity(blobs.len());
        let mut dangling_blobs = 0;

        for entry in blobs {
            if known.contains(&entry.digest) {
                *references.entry(entry.digest).or_insert(0u64) += 1;
                live.push(entry);
            } else {
                tracing::warn!(
                    blob_id = %entry.id,
                    digest = %entry.digest,
                    "Dropping blob entry without content"
                );
                catalog.delete_blob(&entry.id).await?;
                dangling_blobs += 1;
            }
        }

        self.inner.content.restore(records, &references).await?;
        let orphaned_objects = self.inner.content.sweep_unrecorded().await?;

        let report = RecoveryReport {
            blobs: live.len(),
            content_records: self.inner.content.stats().records,
            dangling_blobs,
            orphaned_objects,
        };
        self.inner.registry.restore(live);

        tracing::info!(
            blobs = report.blobs,
            content_records = report.content_records,
            dangling_blobs = report.dangling_blobs,
            orphaned_objects = report.orphaned_objects,
            "Recovered catalog"
        );

        Ok(report)
    }

    pub async fn shutdown(&self) {
        tracing::info!(
            active_uploads = self.inner.sessions.active_count(),
            "Shutting down blob service"
        );
        if let Some(catalog) = &self.inner.catalog {
            catalog.close().await;
        }
    }
}

// ============================================================================
// Finalize
// ============================================================================

/// Registration running on its own task so storage writes are never torn
///
/// If the waiting upload is dropped before the result is observed, the
/// registered blob is removed again once the task finishes.
struct PendingRegistration {
    registry: BlobRegistry,
    handle: Option<JoinHandle<Result<BlobEntry>>>,
}

impl PendingRegistration {
    fn spawn(registry: BlobRegistry, staged: StagedBlob) -> Self {
        let task_registry = registry.clone();
        let handle = tokio::spawn(async move {
            task_registry
                .register(staged.digest, staged.data, staged.size)
                .await
        });

        Self {
            registry,
            handle: Some(handle),
        }
    }

    async fn wait(mut self) -> Result<BlobEntry> {
        // The handle stays in `self` while awaited so a dropped waiter still cleans up
        let Some(handle) = self.handle.as_mut() else {
            return Err(StorageError::TaskFailed("registration already consumed".into()).into());
        };
        let joined = handle.await;
        self.handle = None;

        joined.map_err(|e| StorageError::TaskFailed(e.to_string()))?
    }
}

impl Drop for PendingRegistration {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let registry = self.registry.clone();
        runtime.spawn(async move {
            if let Ok(Ok(entry)) = handle.await {
                tracing::warn!(blob_id = %entry.id, "Upload cancelled during finalize, removing blob");
                if let Err(e) = registry.remove(&entry.id.to_string()).await {
                    tracing::error!(blob_id = %entry.id, error = %e, "Failed to remove cancelled blob");
                }
            }
        });
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use futures::stream;

    use crate::digest::ContentDigest;
    use crate::storage::{LocalByteStorage, MemoryByteStorage};
    use tempfile::TempDir;

    fn memory_service() -> (BlobService, Arc<MemoryByteStorage>) {
        let backend = Arc::new(MemoryByteStorage::new());
        let service = BlobService::new(backend.clone(), None, UploadConfig::default());
        (service, backend)
    }

    fn messages(
        declared: u64,
        chunks: &[&'static [u8]],
    ) -> impl Stream<Item = std::result::Result<UploadMessage, std::io::Error>> + Send + 'static {
        let mut all = vec![UploadMessage::declare(declared)];
        all.extend(chunks.iter().map(|c| UploadMessage::chunk(*c)));
        stream::iter(all.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn test_upload_returns_digest_of_received_bytes() {
        let (service, _) = memory_service();

        let receipt = service
            .upload(messages(13, &[b"Hello, ", b"", b"World!"]))
            .await
            .unwrap();

        assert_eq!(receipt.size, 13);
        assert_eq!(receipt.sha256, ContentDigest::of(b"Hello, World!"));

        let (entry, data) = service.fetch(&receipt.id).await.unwrap();
        assert_eq!(entry.digest, receipt.sha256);
        assert_eq!(&data[..], b"Hello, World!");
        assert_eq!(service.stats().active_uploads, 0);
    }

    #[tokio::test]
    async fn test_empty_upload() {
        let (service, _) = memory_service();

        let receipt = service.upload(messages(0, &[])).await.unwrap();

        assert_eq!(receipt.size, 0);
        assert_eq!(receipt.sha256, ContentDigest::of(b""));
        assert!(service.lookup(&receipt.id).is_ok());
    }

    #[tokio::test]
    async fn test_size_exceeded_stores_nothing() {
        let (service, backend) = memory_service();

        let result = service.upload(messages(10, &[b"0123456789", b"X"])).await;

        assert!(matches!(
            result,
            Err(BlobError::SizeExceeded { declared: 10, received: 11 })
        ));
        assert!(backend.is_empty());
        assert_eq!(service.stats().content_records, 0);
        assert!(service.registry().is_empty());
    }

    #[tokio::test]
    async fn test_short_stream_is_size_mismatch() {
        let (service, backend) = memory_service();

        let result = service.upload(messages(10, &[b"01234"])).await;

        assert!(matches!(
            result,
            Err(BlobError::SizeMismatch { declared: 10, received: 5 })
        ));
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_missing_declaration_is_protocol_violation() {
        let (service, _) = memory_service();
        let stream = stream::iter(vec![Ok::<_, std::io::Error>(UploadMessage::chunk(
            &b"data"[..],
        ))]);

        let result = service.upload(stream).await;
        assert!(matches!(result, Err(BlobError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_concurrent_identical_uploads_dedupe() {
        let (service, backend) = memory_service();

        let a = tokio::spawn({
            let service = service.clone();
            async move { service.upload(messages(4, &[b"same"])).await }
        });
        let b = tokio::spawn({
            let service = service.clone();
            async move { service.upload(messages(4, &[b"sa", b"me"])).await }
        });
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.sha256, b.sha256);
        assert_eq!(service.content_store().refcount(&a.sha256), 2);
        assert_eq!(backend.len(), 1);

        service.remove(&a.id).await.unwrap();
        assert_eq!(service.content_store().refcount(&a.sha256), 1);
        let (_, data) = service.fetch(&b.id).await.unwrap();
        assert_eq!(&data[..], b"same");
    }

    #[tokio::test]
    async fn test_remove_unknown_and_repeated() {
        let (service, _) = memory_service();

        assert!(matches!(
            service.remove(&Uuid::new_v4().to_string()).await,
            Err(BlobError::NotFound(_))
        ));

        let receipt = service.upload(messages(3, &[b"abc"])).await.unwrap();
        service.remove(&receipt.id).await.unwrap();
        assert!(matches!(
            service.remove(&receipt.id).await,
            Err(BlobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_last_remove_purges_bytes() {
        let (service, backend) = memory_service();

        let receipt = service.upload(messages(5, &[b"bytes"])).await.unwrap();
        assert!(backend.contains(&receipt.sha256));

        service.remove(&receipt.id).await.unwrap();

        assert_eq!(service.content_store().refcount(&receipt.sha256), 0);
        assert!(!service.content_store().contains(&receipt.sha256));
        assert!(!backend.contains(&receipt.sha256));
        assert_eq!(service.content_store().get(&receipt.sha256).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_disconnect_mid_stream_leaves_nothing() {
        let (service, backend) = memory_service();
        let stream = stream::iter(vec![
            Ok(UploadMessage::declare(8)),
            Ok(UploadMessage::chunk(&b"half"[..])),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ]);

        let result = service.upload(stream).await;

        assert!(matches!(result, Err(BlobError::Disconnected(_))));
        assert!(backend.is_empty());
        assert!(service.registry().is_empty());
        assert_eq!(service.stats().active_uploads, 0);
    }

    #[tokio::test]
    async fn test_dropped_upload_future_leaves_nothing() {
        let (service, backend) = memory_service();
        let stream = stream::iter(vec![
            Ok::<_, std::io::Error>(UploadMessage::declare(8)),
            Ok(UploadMessage::chunk(&b"half"[..])),
        ])
        .chain(stream::pending());

        let cancelled = tokio::time::timeout(Duration::from_millis(50), service.upload(stream)).await;

        assert!(cancelled.is_err());
        assert!(backend.is_empty());
        assert!(service.registry().is_empty());
        assert_eq!(service.stats().active_uploads, 0);
    }

    #[tokio::test]
    async fn test_idle_upload_times_out() {
        let backend = Arc::new(MemoryByteStorage::new());
        let config = UploadConfig {
            idle_timeout: Duration::from_millis(50),
            ..UploadConfig::default()
        };
        let service = BlobService::new(backend.clone(), None, config);
        let stream = stream::iter(vec![Ok::<_, std::io::Error>(UploadMessage::declare(4))])
            .chain(stream::pending());

        let result = service.upload(stream).await;

        assert!(matches!(result, Err(BlobError::IdleTimeout(_))));
        assert!(backend.is_empty());
        assert_eq!(service.stats().active_uploads, 0);
    }

    #[tokio::test]
    async fn test_concurrent_upload_cap() {
        let backend = Arc::new(MemoryByteStorage::new());
        let config = UploadConfig {
            max_concurrent_uploads: 1,
            ..UploadConfig::default()
        };
        let service = BlobService::new(backend, None, config);

        let stalled = tokio::spawn({
            let service = service.clone();
            async move {
                let stream = stream::iter(vec![Ok::<_, std::io::Error>(UploadMessage::declare(4))])
                    .chain(stream::pending());
                service.upload(stream).await
            }
        });

        while service.stats().active_uploads == 0 {
            tokio::task::yield_now().await;
        }

        let result = service.upload(messages(1, &[b"x"])).await;
        assert!(matches!(result, Err(BlobError::TooManyUploads { max: 1 })));

        stalled.abort();
    }

    // ------------------------------------------------------------------------
    // Storage failures
    // ------------------------------------------------------------------------

    /// Memory storage whose next delete fails once when armed
    #[derive(Default)]
    struct FlakyStorage {
        objects: MemoryByteStorage,
        fail_next_delete: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ByteStorage for FlakyStorage {
        async fn put(&self, digest: &ContentDigest, data: Bytes) -> std::result::Result<(), StorageError> {
            self.objects.put(digest, data).await
        }

        async fn get(&self, digest: &ContentDigest) -> std::result::Result<Option<Bytes>, StorageError> {
            self.objects.get(digest).await
        }

        async fn delete(&self, digest: &ContentDigest) -> std::result::Result<(), StorageError> {
            if self.fail_next_delete.swap(false, Ordering::SeqCst) {
                return Err(StorageError::SdkError("injected delete failure".into()));
            }
            self.objects.delete(digest).await
        }

        async fn list(&self) -> std::result::Result<Vec<ContentDigest>, StorageError> {
            self.objects.list().await
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_failed_remove_is_retry_safe() {
        let backend = Arc::new(FlakyStorage::default());
        let service = BlobService::new(backend.clone(), None, UploadConfig::default());
        let receipt = service.upload(messages(4, &[b"keep"])).await.unwrap();

        backend.fail_next_delete.store(true, Ordering::SeqCst);
        let result = service.remove(&receipt.id).await;

        assert!(matches!(result, Err(BlobError::Storage(_))));
        assert!(service.lookup(&receipt.id).is_ok());
        assert_eq!(service.content_store().refcount(&receipt.sha256), 1);

        service.remove(&receipt.id).await.unwrap();
        assert!(!backend.objects.contains(&receipt.sha256));
    }

    /// Memory storage whose reads park until released
    #[derive(Default)]
    struct GatedStorage {
        objects: MemoryByteStorage,
        read_started: tokio::sync::Notify,
        resume_read: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl ByteStorage for GatedStorage {
        async fn put(&self, digest: &ContentDigest, data: Bytes) -> std::result::Result<(), StorageError> {
            self.objects.put(digest, data).await
        }

        async fn get(&self, digest: &ContentDigest) -> std::result::Result<Option<Bytes>, StorageError> {
            self.read_started.notify_one();
            self.resume_read.notified().await;
            self.objects.get(digest).await
        }

        async fn delete(&self, digest: &ContentDigest) -> std::result::Result<(), StorageError> {
            self.objects.delete(digest).await
        }

        async fn list(&self) -> std::result::Result<Vec<ContentDigest>, StorageError> {
            self.objects.list().await
        }

        fn name(&self) -> &'static str {
            "gated"
        }
    }

    #[tokio::test]
    async fn test_fetch_racing_last_remove_is_not_found() {
        let backend = Arc::new(GatedStorage::default());
        let service = BlobService::new(backend.clone(), None, UploadConfig::default());
        let receipt = service.upload(messages(3, &[b"abc"])).await.unwrap();

        let download = tokio::spawn({
            let service = service.clone();
            let id = receipt.id.clone();
            async move { service.fetch(&id).await }
        });

        backend.read_started.notified().await;
        service.remove(&receipt.id).await.unwrap();
        assert!(!backend.objects.contains(&receipt.sha256));

        backend.resume_read.notify_one();
        let result = download.await.unwrap();

        assert!(matches!(result, Err(BlobError::NotFound(_))));
    }

    // ------------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------------

    async fn durable_service(dir: &TempDir) -> BlobService {
        let backend = Arc::new(LocalByteStorage::new(dir.path().join("blobs")));
        let url = format!("sqlite:{}", dir.path().join("catalog.db").display());
        let catalog = Catalog::open(&url).await.unwrap();
        BlobService::new(backend, Some(catalog), UploadConfig::default())
    }

    #[tokio::test]
    async fn test_recover_restores_ids_and_refcounts() {
        let temp_dir = TempDir::new().unwrap();

        let (first, second, other) = {
            let service = durable_service(&temp_dir).await;
            let first = service.upload(messages(5, &[b"twice"])).await.unwrap();
            let second = service.upload(messages(5, &[b"twice"])).await.unwrap();
            let other = service.upload(messages(4, &[b"once"])).await.unwrap();
            service.remove(&other.id).await.unwrap();
            service.shutdown().await;
            (first, second, other)
        };

        let service = durable_service(&temp_dir).await;
        let report = service.recover().await.unwrap();

        assert_eq!(report.blobs, 2);
        assert_eq!(report.content_records, 1);
        assert_eq!(report.dangling_blobs, 0);
        assert_eq!(report.orphaned_objects, 0);
        assert_eq!(service.content_store().refcount(&first.sha256), 2);

        let (_, data) = service.fetch(&second.id).await.unwrap();
        assert_eq!(&data[..], b"twice");
        assert!(matches!(service.lookup(&other.id), Err(BlobError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_recover_deletes_unrecorded_objects() {
        let temp_dir = TempDir::new().unwrap();

        let kept = {
            let service = durable_service(&temp_dir).await;
            let kept = service.upload(messages(4, &[b"kept"])).await.unwrap();
            service.shutdown().await;
            kept
        };

        // Bytes that reached disk before the process died, with no catalog row
        let medium = LocalByteStorage::new(temp_dir.path().join("blobs"));
        let stray = ContentDigest::of(b"stray");
        medium.put(&stray, Bytes::from_static(b"stray")).await.unwrap();

        let service = durable_service(&temp_dir).await;
        let report = service.recover().await.unwrap();

        assert_eq!(report.orphaned_objects, 1);
        assert_eq!(medium.get(&stray).await.unwrap(), None);
        let (_, data) = service.fetch(&kept.id).await.unwrap();
        assert_eq!(&data[..], b"kept");
    }

    #[tokio::test]
    async fn test_recover_without_catalog_is_noop() {
        let (service, _) = memory_service();
        assert_eq!(service.recover().await.unwrap(), RecoveryReport::default());
    }
}
