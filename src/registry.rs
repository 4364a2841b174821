//! Blob Registry
//!
//! Maps the opaque ids handed to clients onto content digests. Every entry
//! holds exactly one reference on its content record.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::content_store::{ContentStore, PutOutcome};
use crate::db::Catalog;
use crate::digest::ContentDigest;
use crate::error::{BlobError, Result};

/// One successful upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobEntry {
    pub id: Uuid,
    pub digest: ContentDigest,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct BlobRegistry {
    inner: Arc<BlobRegistryInner>,
}

struct BlobRegistryInner {
    content: ContentStore,
    catalog: Option<Catalog>,
    entries: RwLock<HashMap<Uuid, BlobEntry>>,
}

impl BlobRegistry {
    pub fn new(content: ContentStore) -> Self {
        Self::build(content, None)
    }

    pub fn with_catalog(content: ContentStore, catalog: Catalog) -> Self {
        Self::build(content, Some(catalog))
    }

    fn build(content: ContentStore, catalog: Option<Catalog>) -> Self {
        Self {
            inner: Arc::new(BlobRegistryInner {
                content,
                catalog,
                entries: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn content(&self) -> &ContentStore {
        &self.inner.content
    }

    /// Store (or dedup-link) content and mint a fresh id bound to it
    ///
    /// The content reference is taken before the entry becomes visible.
    pub async fn register(&self, digest: ContentDigest, data: Bytes, size: u64) -> Result<BlobEntry> {
        let outcome = self.inner.content.put(&digest, data, size).await?;

        let entry = BlobEntry {
            id: self.fresh_id(),
            digest,
            created_at: Utc::now(),
        };

        if let Some(catalog) = &self.inner.catalog {
            if let Err(e) = catalog.insert_blob(&entry).await {
                if let Err(release) = self.inner.content.release(&digest).await {
                    tracing::warn!(digest = %digest, error = %release, "Failed to drop reference after catalog error");
                }
                return Err(e.into());
            }
        }

        self.inner.entries.write().insert(entry.id, entry.clone());

        tracing::info!(
            blob_id = %entry.id,
            digest = %digest,
            size = size,
            deduplicated = matches!(outcome, PutOutcome::Deduplicated { .. }),
            "Registered blob"
        );

        Ok(entry)
    }

    /// v4 ids, re-drawn on collision with a live entry
    fn fresh_id(&self) -> Uuid {
        let entries = self.inner.entries.read();
        loop {
            let id = Uuid::new_v4();
            if !entries.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn lookup(&self, id: &str) -> Result<BlobEntry> {
        let uuid = parse_id(id)?;
        self.inner
            .entries
            .read()
            .get(&uuid)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(id.to_string()))
    }

    /// Delete an entry and drop its content reference
    ///
    /// On a storage failure the entry is reinstated so the call can be retried.
    pub async fn remove(&self, id: &str) -> Result<BlobEntry> {
        let uuid = parse_id(id)?;

        // Claiming the entry first makes a concurrent remove of the same id NotFound
        let entry = self
            .inner
            .entries
            .write()
            .remove(&uuid)
            .ok_or_else(|| BlobError::NotFound(id.to_string()))?;

        if let Some(catalog) = &self.inner.catalog {
            if let Err(e) = catalog.delete_blob(&uuid).await {
                self.reinstate(entry);
                return Err(e.into());
            }
        }

        if let Err(e) = self.inner.content.release(&entry.digest).await {
            if let Some(catalog) = &self.inner.catalog {
                if let Err(restore) = catalog.insert_blob(&entry).await {
                    tracing::error!(blob_id = %uuid, error = %restore, "Failed to restore catalog row after release error");
                }
            }
            self.reinstate(entry);
            return Err(e.into());
        }

        tracing::info!(blob_id = %uuid, digest = %entry.digest, "Removed blob");
        Ok(entry)
    }

    fn reinstate(&self, entry: BlobEntry) {
        self.inner.entries.write().insert(entry.id, entry);
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }

    /// Install entries loaded from the catalog
    pub fn restore(&self, entries: Vec<BlobEntry>) {
        let mut map = self.inner.entries.write();
        map.clear();
        map.extend(entries.into_iter().map(|e| (e.id, e)));
    }
}

fn parse_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).map_err(|_| BlobError::NotFound(id.to_string()))
}
