//! Blob repository implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use attache_core::{Blob, BlobRepository, Error, Result};

pub(crate) const BLOB_COLUMNS: &str =
    "id, storage_key, filename, content_type, byte_size, checksum, created_at";

/// PostgreSQL implementation of BlobRepository.
#[derive(Clone)]
pub struct PgBlobRepository {
    pool: Pool<Postgres>,
}

impl PgBlobRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub(crate) fn parse_blob_row(row: sqlx::postgres::PgRow) -> Blob {
        Blob {
            id: row.get("id"),
            storage_key: row.get("storage_key"),
            filename: row.get("filename"),
            content_type: row.get("content_type"),
            byte_size: row.get("byte_size"),
            checksum: row.get("checksum"),
            created_at: row.get("created_at"),
        }
    }
}

#[async_trait]
impl BlobRepository for PgBlobRepository {
    async fn insert(&self, blob: &Blob) -> Result<()> {
        sqlx::query(
            "INSERT INTO attache_blobs (id, storage_key, filename, content_type, byte_size, checksum, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(blob.id)
        .bind(&blob.storage_key)
        .bind(&blob.filename)
        .bind(&blob.content_type)
        .bind(blob.byte_size)
        .bind(&blob.checksum)
        .bind(blob.created_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Blob>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM attache_blobs WHERE id = $1",
            BLOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.map(Self::parse_blob_row))
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM attache_blobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_created_before(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<(DateTime<Utc>, Uuid)>,
        limit: i64,
    ) -> Result<Vec<Blob>> {
        let (after_at, after_id) = after.unzip();
        let rows = sqlx::query(&format!(
            "SELECT {} FROM attache_blobs
             WHERE created_at < $1
               AND ($2::timestamptz IS NULL OR (created_at, id) > ($2, $3))
             ORDER BY created_at ASC, id ASC
             LIMIT $4",
            BLOB_COLUMNS
        ))
        .bind(cutoff)
        .bind(after_at)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(rows.into_iter().map(Self::parse_blob_row).collect())
    }
}
