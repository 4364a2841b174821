//! Catalog schema initialization

use sqlx::SqlitePool;

use crate::error::StorageError;

/// Initialize the catalog schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query(SCHEMA_SQL)
        .execute(pool)
        .await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Physical content, one row per distinct digest
CREATE TABLE IF NOT EXISTS content (
    digest TEXT PRIMARY KEY,
    size INTEGER NOT NULL,
    refcount INTEGER NOT NULL CHECK (refcount >= 0),
    stored_at TEXT NOT NULL
);

-- Logical blobs, one row per successful upload
CREATE TABLE IF NOT EXISTS blobs (
    id TEXT PRIMARY KEY,
    digest TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_blobs_digest ON blobs(digest);
"#;
