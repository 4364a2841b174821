//! In-memory byte storage

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;

use super::ByteStorage;
use crate::digest::ContentDigest;
use crate::error::StorageError;

/// Byte storage held in process memory; contents vanish on shutdown
#[derive(Default)]
pub struct MemoryByteStorage {
    objects: RwLock<HashMap<ContentDigest, Bytes>>,
}

impl MemoryByteStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    pub fn contains(&self, digest: &ContentDigest) -> bool {
        self.objects.read().contains_key(digest)
    }
}

#[async_trait::async_trait]
impl ByteStorage for MemoryByteStorage {
    async fn put(&self, digest: &ContentDigest, data: Bytes) -> Result<(), StorageError> {
        self.objects.write().insert(*digest, data);
        Ok(())
    }

    async fn get(&self, digest: &ContentDigest) -> Result<Option<Bytes>, StorageError> {
        Ok(self.objects.read().get(digest).cloned())
    }

    async fn delete(&self, digest: &ContentDigest) -> Result<(), StorageError> {
        self.objects.write().remove(digest);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ContentDigest>, StorageError> {
        Ok(self.objects.read().keys().copied().collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
