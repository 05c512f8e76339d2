use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, error};

use crate::{
    db::{now_millis, to_i64, to_u64},
    digest::Digest,
    error::{RegistryError, Result, Unknown},
    storage::{ByteStore, ByteStream},
};

#[derive(Debug, sqlx::FromRow)]
struct BlobRow {
    digest: String,
    size: i64,
    key: String,
    created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub digest: Digest,
    pub size: u64,
    pub key: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<BlobRow> for Blob {
    type Error = RegistryError;

    fn try_from(row: BlobRow) -> Result<Self> {
        Ok(Blob {
            digest: row
                .digest
                .parse()
                .map_err(|err| anyhow::anyhow!("corrupt blob row {}: {err}", row.digest))?,
            size: to_u64(row.size),
            key: row.key,
            created_at: Utc
                .timestamp_millis_opt(row.created_at)
                .single()
                .unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Committed {
    /// First commit of this digest.
    Created,
    /// The digest was already present with the same size.
    Existing,
}

/// Maps digests to byte store objects.
#[derive(Debug)]
pub struct BlobRepository {
    pool: SqlitePool,
    store: Arc<dyn ByteStore>,
}

impl BlobRepository {
    pub fn new(pool: SqlitePool, store: Arc<dyn ByteStore>) -> Self {
        Self { pool, store }
    }

    pub fn store(&self) -> &Arc<dyn ByteStore> {
        &self.store
    }

    pub async fn get(&self, digest: &Digest) -> Result<Option<Blob>> {
        let mut conn = self.pool.acquire().await?;
        self.get_in(&mut conn, digest).await
    }

    pub(crate) async fn get_in(
        &self,
        conn: &mut SqliteConnection,
        digest: &Digest,
    ) -> Result<Option<Blob>> {
        let row: Option<BlobRow> = sqlx::query_as(
            "SELECT digest, size, key, created_at FROM blobs WHERE digest = ?",
        )
        .bind(digest.to_string())
        .fetch_optional(&mut *conn)
        .await?;

        row.map(Blob::try_from).transpose()
    }

    pub async fn exists(&self, digest: &Digest) -> Result<bool> {
        Ok(self.get(digest).await?.is_some())
    }

    pub async fn open(&self, digest: &Digest) -> Result<(ByteStream, u64)> {
        let blob = self
            .get(digest)
            .await?
            .ok_or_else(|| RegistryError::NotFound(Unknown::Blob(digest.to_string())))?;

        match self.store.get(&blob.key).await {
            Ok(found) => Ok(found),
            Err(err) if err.is_not_found() => {
                error!(%digest, key = blob.key, "Blob is recorded but its bytes are missing");
                Err(RegistryError::NotFound(Unknown::Blob(digest.to_string())))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Record that `key` holds the bytes of `digest`.
    ///
    /// Committing a digest that is already present with the same size is a
    /// no-op. A different size for a known digest is never accepted.
    pub async fn commit(&self, digest: &Digest, key: &str, size: u64) -> Result<Committed> {
        let mut conn = self.pool.acquire().await?;
        self.commit_in(&mut conn, digest, key, size).await
    }

    pub(crate) async fn commit_in(
        &self,
        conn: &mut SqliteConnection,
        digest: &Digest,
        key: &str,
        size: u64,
    ) -> Result<Committed> {
        let now = now_millis();

        let inserted = sqlx::query(
            "INSERT INTO blobs (digest, size, key, created_at, referenced_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT (digest) DO NOTHING",
        )
        .bind(digest.to_string())
        .bind(to_i64(size))
        .bind(key)
        .bind(now)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if inserted == 1 {
            debug!(%digest, size, "Committed blob");
            return Ok(Committed::Created);
        }

        let stored: i64 = sqlx::query_scalar("SELECT size FROM blobs WHERE digest = ?")
            .bind(digest.to_string())
            .fetch_one(&mut *conn)
            .await?;

        if to_u64(stored) != size {
            return Err(RegistryError::Integrity {
                digest: digest.clone(),
                stored: to_u64(stored),
                offered: size,
            });
        }

        self.touch_in(conn, std::slice::from_ref(digest)).await?;

        Ok(Committed::Existing)
    }

    /// Claim an already stored blob for a new upload. Returns `false` when no
    /// record exists, which includes one that a sweep has just reclaimed.
    pub async fn reuse(&self, digest: &Digest, size: u64) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        let Some(stored) = self.reuse_in(&mut conn, digest).await? else {
            return Ok(false);
        };

        if stored != size {
            return Err(RegistryError::Integrity {
                digest: digest.clone(),
                stored,
                offered: size,
            });
        }

        Ok(true)
    }

    /// Touch the record of `digest` and return its size, in one statement so
    /// a concurrent sweep either sees the touch or has already removed it.
    pub(crate) async fn reuse_in(
        &self,
        conn: &mut SqliteConnection,
        digest: &Digest,
    ) -> Result<Option<u64>> {
        let size: Option<i64> = sqlx::query_scalar(
            "UPDATE blobs SET referenced_at = ?, orphaned_at = NULL
            WHERE digest = ?
            RETURNING size",
        )
        .bind(now_millis())
        .bind(digest.to_string())
        .fetch_optional(&mut *conn)
        .await?;

        Ok(size.map(to_u64))
    }

    /// Note that something just relied on these blobs being present, which
    /// keeps an in-progress garbage collection sweep from reclaiming them.
    pub(crate) async fn touch_in(
        &self,
        conn: &mut SqliteConnection,
        digests: &[Digest],
    ) -> Result<()> {
        let now = now_millis();

        for digest in digests {
            sqlx::query("UPDATE blobs SET referenced_at = ?, orphaned_at = NULL WHERE digest = ?")
                .bind(now)
                .bind(digest.to_string())
                .execute(&mut *conn)
                .await?;
        }

        Ok(())
    }

    /// Remove the record of a blob that has been unreferenced since at least
    /// `orphaned_before` and was not touched after `scan_started`. Returns
    /// the size and key of the removed blob; the caller deletes the bytes
    /// once its transaction commits.
    pub(crate) async fn delete_in(
        &self,
        conn: &mut SqliteConnection,
        digest: &Digest,
        orphaned_before: i64,
        scan_started: i64,
    ) -> Result<Option<(u64, String)>> {
        let row: Option<(i64, String)> = sqlx::query_as(
            "DELETE FROM blobs
            WHERE digest = ?1
            AND orphaned_at IS NOT NULL AND orphaned_at <= ?2
            AND (referenced_at IS NULL OR referenced_at < ?3)
            RETURNING size, key",
        )
        .bind(digest.to_string())
        .bind(orphaned_before)
        .bind(scan_started)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(row.map(|(size, key)| (to_u64(size), key)))
    }
}
