//! Resumable blob uploads.
//!
//! A session moves `created -> receiving -> finalizing -> committed`, or ends
//! in `expired` or `aborted`. Every transition is a compare-and-swap on the
//! session's version, so concurrent requests for one session can never both
//! win. Chunks are written to the byte store before the transition that
//! records them; a loser deletes what it wrote.

use std::{io, sync::Arc, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt, stream};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use tokio::{
    sync::{Mutex, OwnedMutexGuard},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    blobs::{BlobRepository, Committed},
    db::{millis, now_millis, to_i64, to_u64},
    digest::Digest,
    error::{RegistryError, Result, Unknown},
    hasher::DigestState,
    metrics::RegistryMetrics,
    names::project_of,
    quota::QuotaAccountant,
    storage::{ByteStore, ByteStream, StoreError, chunk_key, session_prefix},
};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::EnumString, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UploadState {
    Created,
    Receiving,
    Finalizing,
    Committed,
    Expired,
    Aborted,
}

impl UploadState {
    fn accepts_chunks(self) -> bool {
        matches!(self, Self::Created | Self::Receiving)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    id: String,
    repository: String,
    state: String,
    byte_offset: i64,
    digest_state: String,
    version: i64,
    created_at: i64,
    last_activity: i64,
}

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub id: String,
    pub repository: String,
    pub state: UploadState,
    /// Bytes accepted so far; the next chunk must start here.
    pub offset: u64,
    pub(crate) digest_state: DigestState,
    pub(crate) version: i64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl TryFrom<SessionRow> for UploadSession {
    type Error = RegistryError;

    fn try_from(row: SessionRow) -> Result<Self> {
        let state = row
            .state
            .parse()
            .map_err(|err| anyhow::anyhow!("upload {} has state {:?}: {err}", row.id, row.state))?;
        let digest_state = DigestState::from_json(&row.digest_state)
            .map_err(|err| anyhow::anyhow!("upload {} has corrupt hash state: {err}", row.id))?;

        Ok(UploadSession {
            id: row.id,
            repository: row.repository,
            state,
            offset: to_u64(row.byte_offset),
            digest_state,
            version: row.version,
            created_at: timestamp(row.created_at),
            last_activity: timestamp(row.last_activity),
        })
    }
}

fn timestamp(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedUpload {
    pub digest: Digest,
    pub size: u64,
    pub committed: Committed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions moved to `expired`.
    pub expired: u64,
    /// Finished sessions whose records were removed.
    pub purged: u64,
    /// Chunk objects that belonged to no live session.
    pub orphaned_chunks: u64,
    /// Partial writes left behind by an interrupted process.
    pub temp_files: u64,
}

/// Serializes work on one session within this process. Cross-process safety
/// comes from the version checks; this only avoids pointless contention.
struct SessionGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    id: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        // The map and this guard hold a reference each.
        self.locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) <= 2);
    }
}

#[derive(Debug)]
pub struct UploadManager {
    pool: SqlitePool,
    store: Arc<dyn ByteStore>,
    blobs: Arc<BlobRepository>,
    quota: Arc<QuotaAccountant>,
    metrics: RegistryMetrics,
    session_timeout: Duration,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl UploadManager {
    pub fn new(
        pool: SqlitePool,
        blobs: Arc<BlobRepository>,
        quota: Arc<QuotaAccountant>,
        metrics: RegistryMetrics,
        session_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            store: blobs.store().clone(),
            blobs,
            quota,
            metrics,
            session_timeout,
            locks: DashMap::new(),
        }
    }

    async fn lock(&self, id: &str) -> SessionGuard<'_> {
        let lock = self.locks.entry(id.to_string()).or_default().value().clone();
        SessionGuard {
            locks: &self.locks,
            id: id.to_string(),
            _guard: lock.lock_owned().await,
        }
    }

    fn try_lock(&self, id: &str) -> Option<SessionGuard<'_>> {
        let lock = self.locks.entry(id.to_string()).or_default().value().clone();
        let guard = lock.try_lock_owned().ok()?;
        Some(SessionGuard {
            locks: &self.locks,
            id: id.to_string(),
            _guard: guard,
        })
    }

    async fn load(&self, conn: &mut SqliteConnection, id: &str) -> Result<Option<UploadSession>> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT id, repository, state, byte_offset, digest_state, version, created_at, last_activity
            FROM upload_sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        row.map(UploadSession::try_from).transpose()
    }

    async fn load_owned(&self, id: &str, repository: &str) -> Result<UploadSession> {
        let mut conn = self.pool.acquire().await?;
        let session = self.load(&mut conn, id).await?;
        drop(conn);

        match session {
            Some(session) if session.repository == repository => Ok(session),
            _ => Err(RegistryError::NotFound(Unknown::Upload(id.to_string()))),
        }
    }

    fn check_open(session: UploadSession) -> Result<UploadSession> {
        match session.state {
            state if state.accepts_chunks() => Ok(session),
            UploadState::Expired => Err(RegistryError::UploadExpired(session.id)),
            UploadState::Finalizing => Err(RegistryError::Conflict(format!(
                "upload {} is being finalized",
                session.id
            ))),
            _ => Err(RegistryError::NotFound(Unknown::Upload(session.id))),
        }
    }

    /// Load a session that can still take chunks. Callers hold the session
    /// lock.
    async fn load_open(&self, id: &str, repository: &str) -> Result<UploadSession> {
        let session = self.load_owned(id, repository).await?;
        if session.state == UploadState::Finalizing {
            return self.resume(session).await;
        }
        Self::check_open(session)
    }

    /// Hand back a session left in `finalizing` by a completion that never
    /// ran to the end, such as one whose request was dropped mid-commit.
    /// Holding the session lock means no completion in this process is
    /// still running; one elsewhere loses its next version check.
    async fn resume(&self, session: UploadSession) -> Result<UploadSession> {
        let swapped = sqlx::query(
            "UPDATE upload_sessions SET state = ?, version = version + 1, last_activity = ?
            WHERE id = ? AND version = ? AND state = 'finalizing'",
        )
        .bind(UploadState::Receiving.as_ref())
        .bind(now_millis())
        .bind(&session.id)
        .bind(session.version)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if swapped == 0 {
            return Err(self.lost_race(&session.id, &session.repository).await);
        }

        warn!(upload_id = session.id, "Resumed an interrupted completion");
        Ok(UploadSession {
            state: UploadState::Receiving,
            version: session.version + 1,
            ..session
        })
    }

    /// The error to report after losing a compare-and-swap on a session.
    async fn lost_race(&self, id: &str, repository: &str) -> RegistryError {
        match self.load_owned(id, repository).await.and_then(Self::check_open) {
            Ok(_) => RegistryError::Conflict(format!("upload {id} was modified concurrently")),
            Err(err) => err,
        }
    }

    pub async fn start(&self, repository: &str) -> Result<UploadSession> {
        let id = Uuid::new_v4().to_string();
        let now = now_millis();
        let digest_state = DigestState::new();

        sqlx::query(
            "INSERT INTO upload_sessions (id, repository, state, byte_offset, digest_state, version, created_at, last_activity)
            VALUES (?1, ?2, ?3, 0, ?4, 0, ?5, ?5)",
        )
        .bind(&id)
        .bind(repository)
        .bind(UploadState::Created.as_ref())
        .bind(digest_state.to_json())
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!(upload_id = id, repository, "Started upload");

        Ok(UploadSession {
            id,
            repository: repository.to_string(),
            state: UploadState::Created,
            offset: 0,
            digest_state,
            version: 0,
            created_at: timestamp(now),
            last_activity: timestamp(now),
        })
    }

    pub async fn status(&self, id: &str, repository: &str) -> Result<UploadSession> {
        let mut conn = self.pool.acquire().await?;
        match self.load(&mut conn, id).await? {
            Some(session) if session.repository == repository => match session.state {
                UploadState::Expired => Err(RegistryError::UploadExpired(id.to_string())),
                UploadState::Aborted | UploadState::Committed => {
                    Err(RegistryError::NotFound(Unknown::Upload(id.to_string())))
                }
                _ => Ok(session),
            },
            _ => Err(RegistryError::NotFound(Unknown::Upload(id.to_string()))),
        }
    }

    /// Append a chunk at `start`, or at the current offset when the client
    /// did not say. A chunk at any other offset is refused and leaves the
    /// session untouched.
    pub async fn append(
        &self,
        id: &str,
        repository: &str,
        start: Option<u64>,
        length: Option<u64>,
        body: ByteStream,
    ) -> Result<UploadSession> {
        let _guard = self.lock(id).await;
        self.append_locked(id, repository, start, length, body).await
    }

    async fn append_locked(
        &self,
        id: &str,
        repository: &str,
        start: Option<u64>,
        length: Option<u64>,
        body: ByteStream,
    ) -> Result<UploadSession> {
        let session = self.load_open(id, repository).await?;

        if let Some(start) = start
            && start != session.offset
        {
            return Err(RegistryError::UploadOutOfOrder {
                repository: repository.to_string(),
                upload_id: id.to_string(),
                expected: session.offset,
                received: start,
            });
        }

        let key = chunk_key(id, session.offset, &Uuid::new_v4());
        let hasher = Arc::new(parking_lot::Mutex::new(session.digest_state.clone()));
        let tap = hasher.clone();
        let body = body
            .map_ok(move |chunk| {
                tap.lock().update(&chunk);
                chunk
            })
            .boxed();

        let written = match self.store.put(&key, body, length).await {
            Ok(written) => written,
            Err(StoreError::SizeMismatch { .. }) => {
                return Err(RegistryError::UploadOutOfOrder {
                    repository: repository.to_string(),
                    upload_id: id.to_string(),
                    expected: session.offset,
                    received: start.unwrap_or(session.offset),
                });
            }
            Err(err) => return Err(err.into()),
        };

        let now = now_millis();

        if written == 0 {
            self.store.delete(&key).await?;
            sqlx::query("UPDATE upload_sessions SET last_activity = ? WHERE id = ? AND version = ?")
                .bind(now)
                .bind(id)
                .bind(session.version)
                .execute(&self.pool)
                .await?;
            return Ok(UploadSession {
                last_activity: timestamp(now),
                ..session
            });
        }

        let digest_state = hasher.lock().clone();
        let offset = session.offset + written;

        let mut tx = self.pool.begin().await?;
        let swapped = sqlx::query(
            "UPDATE upload_sessions
            SET state = ?, byte_offset = ?, digest_state = ?, version = version + 1, last_activity = ?
            WHERE id = ? AND version = ? AND state IN ('created', 'receiving')",
        )
        .bind(UploadState::Receiving.as_ref())
        .bind(to_i64(offset))
        .bind(digest_state.to_json())
        .bind(now)
        .bind(id)
        .bind(session.version)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if swapped == 1 {
            sqlx::query(
                "INSERT INTO upload_chunks (session_id, byte_offset, size, key) VALUES (?, ?, ?, ?)",
            )
            .bind(id)
            .bind(to_i64(session.offset))
            .bind(to_i64(written))
            .bind(&key)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        if swapped == 0 {
            self.store.delete(&key).await?;
            return Err(self.lost_race(id, repository).await);
        }

        debug!(upload_id = id, offset, written, "Accepted chunk");

        Ok(UploadSession {
            state: UploadState::Receiving,
            offset,
            digest_state,
            version: session.version + 1,
            last_activity: timestamp(now),
            ..session
        })
    }

    /// Finish an upload, optionally appending a final chunk first. The blob
    /// is committed only if everything received hashes to `expected`.
    pub async fn complete(
        &self,
        id: &str,
        repository: &str,
        expected: &str,
        tail: Option<ByteStream>,
    ) -> Result<CompletedUpload> {
        let _guard = self.lock(id).await;

        if let Some(tail) = tail {
            self.append_locked(id, repository, None, None, tail).await?;
        }

        let session = self.load_open(id, repository).await?;

        let swapped = sqlx::query(
            "UPDATE upload_sessions SET state = ?, version = version + 1, last_activity = ?
            WHERE id = ? AND version = ? AND state IN ('created', 'receiving')",
        )
        .bind(UploadState::Finalizing.as_ref())
        .bind(now_millis())
        .bind(id)
        .bind(session.version)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if swapped == 0 {
            return Err(self.lost_race(id, repository).await);
        }
        let session = UploadSession {
            state: UploadState::Finalizing,
            version: session.version + 1,
            ..session
        };

        let actual = session.digest_state.finalize();
        let size = session.offset;

        let digest = match expected.parse::<Digest>() {
            Ok(digest) if digest == actual => digest,
            _ => {
                self.abort(&session, "digest_mismatch").await?;
                return Err(RegistryError::DigestMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
        };

        let project = project_of(repository);
        let charged = match self.quota.charge(project, &[(digest.clone(), size)]).await {
            Ok(charged) => charged,
            Err(err) => {
                self.abort(&session, "quota_exceeded").await?;
                return Err(err);
            }
        };

        match self.commit_blob(&session, &digest, size).await {
            Ok(committed) => {
                self.finish(&session).await?;
                self.metrics.upload(match committed {
                    Committed::Created => "committed",
                    Committed::Existing => "deduplicated",
                });
                info!(upload_id = id, repository, %digest, size, "Committed upload");

                Ok(CompletedUpload {
                    digest,
                    size,
                    committed,
                })
            }
            Err(err) => {
                if charged > 0 {
                    self.quota.uncharge(project, &[digest.clone()]).await?;
                }
                match &err {
                    RegistryError::Integrity { .. } => self.abort(&session, "integrity").await?,
                    _ => self.reopen(&session).await?,
                }
                Err(err)
            }
        }
    }

    async fn commit_blob(
        &self,
        session: &UploadSession,
        digest: &Digest,
        size: u64,
    ) -> Result<Committed> {
        if self.blobs.reuse(digest, size).await? {
            return Ok(Committed::Existing);
        }

        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT key FROM upload_chunks WHERE session_id = ? ORDER BY byte_offset",
        )
        .bind(&session.id)
        .fetch_all(&self.pool)
        .await?;

        let key = digest.object_key(&Uuid::new_v4());
        self.store
            .put(&key, self.assemble(keys), Some(size))
            .await?;

        let committed = self.blobs.commit(digest, &key, size).await;
        if !matches!(committed, Ok(Committed::Created)) {
            // Another upload of the same digest committed first, or the
            // commit failed. Either way nothing refers to this copy.
            if let Err(err) = self.store.delete(&key).await {
                warn!(%digest, key, error = %err, "Failed to delete unused blob copy");
            }
        }

        committed
    }

    /// The chunks of a session as one stream.
    fn assemble(&self, keys: Vec<String>) -> ByteStream {
        let store = self.store.clone();

        stream::iter(keys)
            .then(move |key| {
                let store = store.clone();
                async move {
                    store
                        .get(&key)
                        .await
                        .map(|(body, _)| body)
                        .map_err(io::Error::other)
                }
            })
            .try_flatten()
            .boxed()
    }

    /// Drop a committed session along with its chunks.
    async fn finish(&self, session: &UploadSession) -> Result<()> {
        sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
            .bind(&session.id)
            .execute(&self.pool)
            .await?;
        self.delete_chunks(&session.id).await;
        Ok(())
    }

    /// Give a failed finalization back to the client.
    async fn reopen(&self, session: &UploadSession) -> Result<()> {
        sqlx::query(
            "UPDATE upload_sessions SET state = ?, version = version + 1, last_activity = ?
            WHERE id = ? AND version = ?",
        )
        .bind(UploadState::Receiving.as_ref())
        .bind(now_millis())
        .bind(&session.id)
        .bind(session.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn abort(&self, session: &UploadSession, outcome: &'static str) -> Result<()> {
        self.end(&session.id, UploadState::Aborted, outcome).await?;
        Ok(())
    }

    /// Move a session to a terminal state and release its chunks.
    async fn end(&self, id: &str, state: UploadState, outcome: &'static str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let ended = sqlx::query(
            "UPDATE upload_sessions SET state = ?, version = version + 1, last_activity = ?
            WHERE id = ? AND state IN ('created', 'receiving', 'finalizing')",
        )
        .bind(state.as_ref())
        .bind(now_millis())
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        sqlx::query("DELETE FROM upload_chunks WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.delete_chunks(id).await;

        if ended == 1 {
            self.metrics.upload(outcome);
            debug!(upload_id = id, %state, outcome, "Upload ended");
        }

        Ok(ended == 1)
    }

    async fn delete_chunks(&self, id: &str) {
        let keys = match self.store.list(&session_prefix(id)).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(upload_id = id, error = %err, "Failed to list upload chunks");
                return;
            }
        };

        for key in keys {
            if let Err(err) = self.store.delete(&key).await {
                warn!(upload_id = id, key, error = %err, "Failed to delete upload chunk");
            }
        }
    }

    pub async fn cancel(&self, id: &str, repository: &str) -> Result<()> {
        let _guard = self.lock(id).await;
        self.load_open(id, repository).await?;

        if !self.end(id, UploadState::Aborted, "cancelled").await? {
            return Err(self.lost_race(id, repository).await);
        }

        Ok(())
    }

    /// Link an existing blob into a repository without uploading it again.
    /// Returns `None` when the blob is unknown, in which case the client
    /// falls back to a normal upload.
    pub async fn mount(&self, repository: &str, digest: &Digest) -> Result<Option<u64>> {
        let mut tx = self.pool.begin().await?;
        let Some(size) = self.blobs.reuse_in(&mut tx, digest).await? else {
            return Ok(None);
        };
        self.quota
            .charge_in(&mut tx, project_of(repository), &[(digest.clone(), size)])
            .await?;
        tx.commit().await?;

        debug!(repository, %digest, "Mounted blob");
        Ok(Some(size))
    }

    /// Expire sessions idle for longer than the session timeout and clean up
    /// whatever chunks they left behind.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let cutoff = now.timestamp_millis() - millis(self.session_timeout);
        let mut report = SweepReport::default();

        let stale: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM upload_sessions
            WHERE state IN ('created', 'receiving', 'finalizing') AND last_activity < ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        for id in stale {
            let Some(_guard) = self.try_lock(&id) else {
                continue;
            };

            let expired = sqlx::query(
                "UPDATE upload_sessions SET state = ?, version = version + 1, last_activity = ?
                WHERE id = ? AND state IN ('created', 'receiving', 'finalizing') AND last_activity < ?",
            )
            .bind(UploadState::Expired.as_ref())
            .bind(now.timestamp_millis())
            .bind(&id)
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

            if expired == 1 {
                sqlx::query("DELETE FROM upload_chunks WHERE session_id = ?")
                    .bind(&id)
                    .execute(&self.pool)
                    .await?;
                self.delete_chunks(&id).await;
                self.metrics.upload("expired");
                report.expired += 1;
            }
        }

        report.purged = sqlx::query(
            "DELETE FROM upload_sessions WHERE state IN ('expired', 'aborted') AND last_activity < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let live: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM upload_sessions WHERE state IN ('created', 'receiving', 'finalizing')",
        )
        .fetch_all(&self.pool)
        .await?;

        for key in self.store.list("uploads/").await? {
            let owner = key.split('/').nth(1).unwrap_or_default();
            if live.iter().any(|id| id == owner) {
                continue;
            }
            let meta = match self.store.stat(&key).await {
                Ok(meta) => meta,
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err.into()),
            };
            // A session started after `live` was read may already own this.
            if meta.created.timestamp_millis() >= cutoff {
                continue;
            }
            self.store.delete(&key).await?;
            report.orphaned_chunks += 1;
        }

        let stale_before = Utc.timestamp_millis_opt(cutoff).single().unwrap_or(now);
        report.temp_files = self.store.purge_temp(stale_before).await?;

        if report != SweepReport::default() {
            info!(
                expired = report.expired,
                purged = report.purged,
                orphaned_chunks = report.orphaned_chunks,
                temp_files = report.temp_files,
                "Swept upload sessions"
            );
        }

        Ok(report)
    }

    pub fn spawn_sweeper(
        self: Arc<Self>,
        tasks: &mut JoinSet<anyhow::Result<()>>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.sweep(Utc::now()).await {
                            warn!(error = %err, "Upload sweep failed");
                        }
                    }
                }
            }

            Ok(())
        });
    }
}
