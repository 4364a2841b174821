//! Local filesystem byte storage
//!
//! Objects live at `<root>/<first 2 hex chars>/<remaining hex chars>`.
//! Writes land in a `.partial` sibling first and are renamed into place once
//! synced, so readers never observe a torn object.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{fan_in, fan_out, ByteStorage};
use crate::digest::ContentDigest;
use crate::error::StorageError;

const PARTIAL_SUFFIX: &str = ".partial";

/// Local filesystem byte storage
pub struct LocalByteStorage {
    base_path: PathBuf,
}

impl LocalByteStorage {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn object_path(&self, digest: &ContentDigest) -> PathBuf {
        let (prefix, rest) = fan_out(digest);
        self.base_path.join(prefix).join(rest)
    }

    /// Remove `.partial` files left behind by interrupted writes
    ///
    /// Returns the number of files removed
    pub async fn sweep_partials(&self) -> Result<usize, StorageError> {
        let mut removed = 0;

        let mut dirs = match tokio::fs::read_dir(&self.base_path).await {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        while let Some(dir) = dirs.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }

            let mut entries = tokio::fs::read_dir(dir.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let is_partial = entry
                    .file_name()
                    .to_str()
                    .map(|name| name.ends_with(PARTIAL_SUFFIX))
                    .unwrap_or(false);

                if is_partial {
                    tokio::fs::remove_file(entry.path()).await?;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            tracing::info!(count = removed, "Swept partial object writes");
        }

        Ok(removed)
    }
}

#[async_trait::async_trait]
impl ByteStorage for LocalByteStorage {
    async fn put(&self, digest: &ContentDigest, data: Bytes) -> Result<(), StorageError> {
        let path = self.object_path(digest);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut partial = path.clone().into_os_string();
        partial.push(format!(".{}{}", Uuid::new_v4().simple(), PARTIAL_SUFFIX));
        let partial = PathBuf::from(partial);

        let written = async {
            let mut file = tokio::fs::File::create(&partial).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&partial, &path).await
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }

        tracing::debug!(digest = %digest, size = data.len(), "Wrote object to disk");
        Ok(())
    }

    async fn get(&self, digest: &ContentDigest) -> Result<Option<Bytes>, StorageError> {
        match tokio::fs::read(self.object_path(digest)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, digest: &ContentDigest) -> Result<(), StorageError> {
        let path = self.object_path(digest);
        // Fan-out directories are left in place; a concurrent put may be writing into one
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<ContentDigest>, StorageError> {
        let mut digests = Vec::new();

        let mut dirs = match tokio::fs::read_dir(&self.base_path).await {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(digests),
            Err(e) => return Err(e.into()),
        };

        while let Some(dir) = dirs.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }
            let prefix = dir.file_name().to_string_lossy().into_owned();

            let mut entries = tokio::fs::read_dir(dir.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                if let Some(digest) = fan_in(&prefix, &entry.file_name().to_string_lossy()) {
                    digests.push(digest);
                }
            }
        }

        Ok(digests)
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
