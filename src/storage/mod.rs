//! Byte storage medium
//!
//! The durable place blob bytes live, addressed only by content digest.
//! Supports the local filesystem, process memory, and S3-compatible services
//! (MinIO, Cloudflare R2, Backblaze B2, AWS S3).

mod local;
mod memory;
mod s3_client;

pub use local::LocalByteStorage;
pub use memory::MemoryByteStorage;
pub use s3_client::{S3ByteStorage, S3Client};

use bytes::Bytes;

use crate::digest::ContentDigest;
use crate::error::StorageError;

/// Trait for byte storage backends
#[async_trait::async_trait]
pub trait ByteStorage: Send + Sync {
    /// Store bytes under a digest, replacing anything already there
    async fn put(&self, digest: &ContentDigest, data: Bytes) -> Result<(), StorageError>;

    /// Read bytes for a digest, `None` if absent
    async fn get(&self, digest: &ContentDigest) -> Result<Option<Bytes>, StorageError>;

    /// Delete bytes for a digest; deleting an absent key succeeds
    async fn delete(&self, digest: &ContentDigest) -> Result<(), StorageError>;

    /// Every digest currently held by the medium
    async fn list(&self) -> Result<Vec<ContentDigest>, StorageError>;

    /// Short backend name for logs
    fn name(&self) -> &'static str;
}

/// Split a digest into a two-char fan-out directory and the remainder
pub(crate) fn fan_out(digest: &ContentDigest) -> (String, String) {
    let hex = digest.to_hex();
    let rest = hex[2..].to_string();
    let mut prefix = hex;
    prefix.truncate(2);
    (prefix, rest)
}

/// Inverse of `fan_out`; `None` for names that are not object keys
pub(crate) fn fan_in(prefix: &str, rest: &str) -> Option<ContentDigest> {
    if prefix.len() != 2 {
        return None;
    }
    format!("{}{}", prefix, rest).parse().ok()
}
