//! Catalog repository for content records and blob entries

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::content_store::ContentRecord;
use crate::digest::ContentDigest;
use crate::error::StorageError;
use crate::registry::BlobEntry;

#[derive(Debug, sqlx::FromRow)]
struct ContentRow {
    digest: String,
    size: i64,
    refcount: i64,
    stored_at: String,
}

#[derive(Debug, sqlx::FromRow)]
struct BlobRow {
    id: String,
    digest: String,
    created_at: String,
}

/// Write-through persistence for the content store and blob registry
#[derive(Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a catalog at a SQLite URL
    pub async fn open(database_url: &str) -> Result<Self, StorageError> {
        let pool = super::create_pool(database_url).await?;
        Ok(Self::new(pool))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ========================================================================
    // Content
    // ========================================================================

    /// Insert or overwrite a content record
    pub async fn save_content(&self, record: &ContentRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO content (digest, size, refcount, stored_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(digest) DO UPDATE SET
                size = excluded.size,
                refcount = excluded.refcount
            "#,
        )
        .bind(record.digest.to_hex())
        .bind(record.size as i64)
        .bind(record.refcount as i64)
        .bind(record.stored_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete_content(&self, digest: &ContentDigest) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM content WHERE digest = ?")
            .bind(digest.to_hex())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn load_content(&self) -> Result<Vec<ContentRecord>, StorageError> {
        let rows = sqlx::query_as::<_, ContentRow>(
            "SELECT digest, size, refcount, stored_at FROM content",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<ContentRecord, StorageError> {
                Ok(ContentRecord {
                    digest: parse_digest(&row.digest)?,
                    size: non_negative(row.size, &row.digest)?,
                    refcount: non_negative(row.refcount, &row.digest)?,
                    stored_at: parse_time(&row.stored_at)?,
                })
            })
            .collect()
    }

    // ========================================================================
    // Blobs
    // ========================================================================

    pub async fn insert_blob(&self, entry: &BlobEntry) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO blobs (id, digest, created_at) VALUES (?, ?, ?)")
            .bind(entry.id.to_string())
            .bind(entry.digest.to_hex())
            .bind(entry.created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn delete_blob(&self, id: &Uuid) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM blobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn load_blobs(&self) -> Result<Vec<BlobEntry>, StorageError> {
        let rows = sqlx::query_as::<_, BlobRow>("SELECT id, digest, created_at FROM blobs")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| -> Result<BlobEntry, StorageError> {
                Ok(BlobEntry {
                    id: Uuid::parse_str(&row.id)
                        .map_err(|_| StorageError::CorruptCatalog(format!("blob id {}", row.id)))?,
                    digest: parse_digest(&row.digest)?,
                    created_at: parse_time(&row.created_at)?,
                })
            })
            .collect()
    }
}

fn parse_digest(s: &str) -> Result<ContentDigest, StorageError> {
    s.parse()
        .map_err(|e| StorageError::CorruptCatalog(format!("digest {}: {}", s, e)))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::CorruptCatalog(format!("timestamp {}: {}", s, e)))
}

fn non_negative(value: i64, digest: &str) -> Result<u64, StorageError> {
    u64::try_from(value)
        .map_err(|_| StorageError::CorruptCatalog(format!("negative count for {}", digest)))
}
