//! Manifests and the tags that point at them.
//!
//! A push is one metadata transaction: referenced blobs are checked, the
//! project is charged, the manifest row is written and the tag is repointed
//! with a single upsert. Readers therefore see either the old or the new
//! tag target, and a failed push leaves nothing behind.

use std::{collections::HashSet, fmt, str::FromStr, sync::Arc};

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use futures::TryStreamExt;
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::{
    blobs::BlobRepository,
    context::RequestContext,
    db::{now_millis, to_i64, to_u64},
    digest::Digest,
    error::{ManifestProblem, RegistryError, Result, Unknown},
    events::{Action, EventNotifier, Target},
    extractor::{DOCKER_MANIFEST_LIST, ManifestInfo, OCI_INDEX, parse_manifest},
    names::{project_of, validate_repository, validate_tag},
    quota::QuotaAccountant,
};

/// A tag name or a manifest digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Tag(String),
    Digest(Digest),
}

impl FromStr for Reference {
    type Err = RegistryError;

    fn from_str(value: &str) -> Result<Self> {
        if value.contains(':') {
            let digest = value.parse().map_err(|err| {
                RegistryError::ManifestInvalid(ManifestProblem::Malformed(format!(
                    "invalid digest reference {value:?}: {err}"
                )))
            })?;
            return Ok(Self::Digest(digest));
        }

        validate_tag(value)?;
        Ok(Self::Tag(value.to_string()))
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tag(tag) => f.write_str(tag),
            Self::Digest(digest) => digest.fmt(f),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ManifestRow {
    repository: String,
    digest: String,
    media_type: String,
    size: i64,
    body: Vec<u8>,
    created_at: i64,
}

#[derive(Debug, Clone)]
pub struct StoredManifest {
    pub repository: String,
    pub digest: Digest,
    pub media_type: String,
    pub size: u64,
    pub body: Bytes,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ManifestRow> for StoredManifest {
    type Error = RegistryError;

    fn try_from(row: ManifestRow) -> Result<Self> {
        Ok(StoredManifest {
            digest: row
                .digest
                .parse()
                .map_err(|err| anyhow::anyhow!("corrupt manifest row {}: {err}", row.digest))?,
            repository: row.repository,
            media_type: row.media_type,
            size: to_u64(row.size),
            body: Bytes::from(row.body),
            created_at: Utc
                .timestamp_millis_opt(row.created_at)
                .single()
                .unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushedManifest {
    pub digest: Digest,
    pub media_type: String,
    /// False when the repository already held this exact manifest.
    pub created: bool,
    /// Bytes newly charged to the project.
    pub charged: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedManifest {
    pub digest: Digest,
    pub tags: Vec<String>,
    /// Whether the manifest itself went, not just a tag.
    pub removed: bool,
    /// Bytes released from the project.
    pub released: u64,
}

/// Blob references of a stored manifest.
fn references(media_type: &str, body: &[u8]) -> Result<ManifestInfo> {
    parse_manifest(body, Some(media_type)).map_err(|problem| {
        anyhow::anyhow!("stored manifest no longer parses: {problem}").into()
    })
}

#[derive(Debug)]
pub struct ManifestRepository {
    pool: SqlitePool,
    blobs: Arc<BlobRepository>,
    quota: Arc<QuotaAccountant>,
    notifier: Arc<EventNotifier>,
    gc: Arc<Notify>,
    max_size: u64,
}

impl ManifestRepository {
    pub fn new(
        pool: SqlitePool,
        blobs: Arc<BlobRepository>,
        quota: Arc<QuotaAccountant>,
        notifier: Arc<EventNotifier>,
        gc: Arc<Notify>,
        max_size: u64,
    ) -> Self {
        Self {
            pool,
            blobs,
            quota,
            notifier,
            gc,
            max_size,
        }
    }

    pub async fn push(
        &self,
        repository: &str,
        reference: &str,
        content_type: Option<&str>,
        body: Bytes,
        context: &RequestContext,
    ) -> Result<PushedManifest> {
        validate_repository(repository)?;
        let reference: Reference = reference.parse()?;

        let size = body.len() as u64;
        if size > self.max_size {
            return Err(RegistryError::ManifestInvalid(ManifestProblem::TooLarge(
                size,
            )));
        }

        let info = parse_manifest(&body, content_type).map_err(RegistryError::ManifestInvalid)?;
        let digest = Digest::of(&body);

        if let Reference::Digest(expected) = &reference
            && expected != &digest
        {
            return Err(RegistryError::DigestMismatch {
                expected: expected.to_string(),
                actual: digest,
            });
        }

        let project = project_of(repository);
        let mut tx = self.pool.begin().await?;

        for descriptor in &info.blobs {
            let Some(blob) = self.blobs.get_in(&mut tx, &descriptor.digest).await? else {
                return Err(RegistryError::ManifestInvalid(ManifestProblem::BlobUnknown(
                    descriptor.digest.clone(),
                )));
            };
            if blob.size != descriptor.size {
                return Err(RegistryError::ManifestInvalid(ManifestProblem::SizeMismatch {
                    digest: descriptor.digest.clone(),
                    declared: descriptor.size,
                    actual: blob.size,
                }));
            }
        }

        for descriptor in &info.manifests {
            let stored: Option<i64> = sqlx::query_scalar(
                "SELECT size FROM manifests WHERE repository = ? AND digest = ?",
            )
            .bind(repository)
            .bind(descriptor.digest.to_string())
            .fetch_optional(&mut *tx)
            .await?;

            match stored.map(to_u64) {
                None => {
                    return Err(RegistryError::ManifestInvalid(
                        ManifestProblem::ManifestUnknown(descriptor.digest.clone()),
                    ));
                }
                Some(actual) if actual != descriptor.size => {
                    return Err(RegistryError::ManifestInvalid(ManifestProblem::SizeMismatch {
                        digest: descriptor.digest.clone(),
                        declared: descriptor.size,
                        actual,
                    }));
                }
                Some(_) => {}
            }
        }

        let mut charges = vec![(digest.clone(), size)];
        charges.extend(info.blobs.iter().map(|d| (d.digest.clone(), d.size)));
        let charged = self.quota.charge_in(&mut tx, project, &charges).await?;

        let blob_digests: Vec<Digest> = info.blobs.iter().map(|d| d.digest.clone()).collect();
        self.blobs.touch_in(&mut tx, &blob_digests).await?;

        let now = now_millis();
        let created = sqlx::query(
            "INSERT INTO manifests (repository, digest, project, media_type, size, body, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (repository, digest) DO NOTHING",
        )
        .bind(repository)
        .bind(digest.to_string())
        .bind(project)
        .bind(&info.media_type)
        .bind(to_i64(size))
        .bind(body.as_ref())
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        let tag = match &reference {
            Reference::Tag(tag) => {
                sqlx::query(
                    "INSERT INTO tags (repository, name, digest, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?4)
                    ON CONFLICT (repository, name)
                    DO UPDATE SET digest = excluded.digest, updated_at = excluded.updated_at",
                )
                .bind(repository)
                .bind(tag)
                .bind(digest.to_string())
                .bind(now)
                .execute(&mut *tx)
                .await?;
                Some(tag.as_str())
            }
            Reference::Digest(_) => None,
        };

        tx.commit().await?;

        info!(repository, reference = %reference, %digest, charged, "Pushed manifest");

        self.notifier
            .notify(
                Action::Push,
                context,
                Target::new(repository)
                    .manifest(&digest, &info.media_type, size)
                    .tag(tag),
            )
            .await;

        Ok(PushedManifest {
            digest,
            media_type: info.media_type,
            created,
            charged,
        })
    }

    async fn resolve_in(
        &self,
        conn: &mut SqliteConnection,
        repository: &str,
        reference: &Reference,
    ) -> Result<Option<StoredManifest>> {
        let row: Option<ManifestRow> = match reference {
            Reference::Tag(tag) => {
                sqlx::query_as(
                    "SELECT m.repository, m.digest, m.media_type, m.size, m.body, m.created_at
                    FROM tags t JOIN manifests m ON m.repository = t.repository AND m.digest = t.digest
                    WHERE t.repository = ? AND t.name = ?",
                )
                .bind(repository)
                .bind(tag)
                .fetch_optional(&mut *conn)
                .await?
            }
            Reference::Digest(digest) => {
                sqlx::query_as(
                    "SELECT repository, digest, media_type, size, body, created_at
                    FROM manifests WHERE repository = ? AND digest = ?",
                )
                .bind(repository)
                .bind(digest.to_string())
                .fetch_optional(&mut *conn)
                .await?
            }
        };

        row.map(StoredManifest::try_from).transpose()
    }

    /// Look a manifest up without telling anyone.
    pub async fn stat(&self, repository: &str, reference: &str) -> Result<StoredManifest> {
        let unknown = || {
            RegistryError::NotFound(Unknown::Manifest {
                repository: repository.to_string(),
                reference: reference.to_string(),
            })
        };
        let parsed: Reference = reference.parse().map_err(|_| unknown())?;

        let mut conn = self.pool.acquire().await?;
        self.resolve_in(&mut conn, repository, &parsed)
            .await?
            .ok_or_else(unknown)
    }

    /// Fetch a manifest for a client, which counts as a pull.
    pub async fn get(
        &self,
        repository: &str,
        reference: &str,
        context: &RequestContext,
    ) -> Result<StoredManifest> {
        let manifest = self.stat(repository, reference).await?;

        let tag = match reference.parse() {
            Ok(Reference::Tag(tag)) => Some(tag),
            _ => None,
        };
        self.notifier
            .notify(
                Action::Pull,
                context,
                Target::new(repository)
                    .manifest(&manifest.digest, &manifest.media_type, manifest.size)
                    .tag(tag.as_deref()),
            )
            .await;

        Ok(manifest)
    }

    /// Whether an index in the repository lists `digest`.
    async fn listed_by_index(
        &self,
        conn: &mut SqliteConnection,
        repository: &str,
        digest: &Digest,
    ) -> Result<bool> {
        let indexes: Vec<(String, Vec<u8>)> = sqlx::query_as(
            "SELECT media_type, body FROM manifests WHERE repository = ? AND media_type IN (?, ?)",
        )
        .bind(repository)
        .bind(OCI_INDEX)
        .bind(DOCKER_MANIFEST_LIST)
        .fetch_all(&mut *conn)
        .await?;

        for (media_type, body) in indexes {
            if references(&media_type, &body)?
                .manifests
                .iter()
                .any(|child| &child.digest == digest)
            {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Drop the project's charges for `removed` and whatever only it used.
    async fn release_in(
        &self,
        conn: &mut SqliteConnection,
        project: &str,
        removed: &StoredManifest,
    ) -> Result<u64> {
        let mut candidates = vec![removed.digest.clone()];
        candidates.extend(
            references(&removed.media_type, &removed.body)?
                .blobs
                .into_iter()
                .map(|d| d.digest),
        );

        let mut still_used = HashSet::new();
        {
            let mut rows = sqlx::query_as::<_, (String, String, Vec<u8>)>(
                "SELECT digest, media_type, body FROM manifests WHERE project = ?",
            )
            .bind(project)
            .fetch(&mut *conn);

            while let Some((digest, media_type, body)) = rows.try_next().await? {
                still_used.insert(digest);
                for blob in references(&media_type, &body)?.blobs {
                    still_used.insert(blob.digest.to_string());
                }
            }
        }

        candidates.retain(|digest| !still_used.contains(&digest.to_string()));
        self.quota.uncharge_in(conn, project, &candidates).await
    }

    /// Delete by tag or by digest.
    ///
    /// Deleting a tag takes the manifest with it when nothing else in the
    /// repository points at it. Deleting a digest removes the manifest and
    /// every tag on it. Blobs are left for the garbage collector.
    pub async fn delete(
        &self,
        repository: &str,
        reference: &str,
        context: &RequestContext,
    ) -> Result<DeletedManifest> {
        let unknown = || {
            RegistryError::NotFound(Unknown::Manifest {
                repository: repository.to_string(),
                reference: reference.to_string(),
            })
        };
        let parsed: Reference = reference.parse().map_err(|_| unknown())?;

        let mut tx = self.pool.begin().await?;
        let manifest = self
            .resolve_in(&mut tx, repository, &parsed)
            .await?
            .ok_or_else(unknown)?;

        let (tags, remove) = match &parsed {
            Reference::Tag(tag) => {
                sqlx::query("DELETE FROM tags WHERE repository = ? AND name = ?")
                    .bind(repository)
                    .bind(tag)
                    .execute(&mut *tx)
                    .await?;

                let other_tags: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM tags WHERE repository = ? AND digest = ?",
                )
                .bind(repository)
                .bind(manifest.digest.to_string())
                .fetch_one(&mut *tx)
                .await?;

                let remove = other_tags == 0
                    && !self
                        .listed_by_index(&mut tx, repository, &manifest.digest)
                        .await?;

                (vec![tag.clone()], remove)
            }
            Reference::Digest(_) => {
                let mut tags: Vec<String> = sqlx::query_scalar(
                    "DELETE FROM tags WHERE repository = ? AND digest = ? RETURNING name",
                )
                .bind(repository)
                .bind(manifest.digest.to_string())
                .fetch_all(&mut *tx)
                .await?;
                tags.sort();

                (tags, true)
            }
        };

        let mut released = 0;
        if remove {
            sqlx::query("DELETE FROM manifests WHERE repository = ? AND digest = ?")
                .bind(repository)
                .bind(manifest.digest.to_string())
                .execute(&mut *tx)
                .await?;

            released = self
                .release_in(&mut tx, project_of(repository), &manifest)
                .await?;
        }

        tx.commit().await?;

        info!(
            repository,
            reference,
            digest = %manifest.digest,
            removed = remove,
            released,
            "Deleted manifest reference"
        );

        let target = Target::new(repository).manifest(
            &manifest.digest,
            &manifest.media_type,
            manifest.size,
        );
        if tags.is_empty() {
            self.notifier
                .notify(Action::Delete, context, target.clone())
                .await;
        }
        for tag in &tags {
            self.notifier
                .notify(Action::Delete, context, target.clone().tag(Some(tag)))
                .await;
        }

        if remove {
            self.gc.notify_one();
        }

        Ok(DeletedManifest {
            digest: manifest.digest,
            tags,
            removed: remove,
            released,
        })
    }

    /// Tags of a repository in lexical order, starting after `last`.
    pub async fn list_tags(
        &self,
        repository: &str,
        last: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<String>> {
        let known: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM manifests WHERE repository = ? LIMIT 1")
                .bind(repository)
                .fetch_optional(&self.pool)
                .await?;
        if known.is_none() {
            return Err(RegistryError::NotFound(Unknown::Repository(
                repository.to_string(),
            )));
        }

        let tags = sqlx::query_scalar(
            "SELECT name FROM tags WHERE repository = ?1 AND (?2 IS NULL OR name > ?2)
            ORDER BY name LIMIT ?3",
        )
        .bind(repository)
        .bind(last)
        .bind(limit.map(|n| i64::try_from(n).unwrap_or(i64::MAX)).unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;

        Ok(tags)
    }

    /// Every blob some stored manifest refers to, across all repositories.
    pub(crate) async fn referenced_blobs(&self) -> Result<HashSet<Digest>> {
        let mut live = HashSet::new();
        let mut rows = sqlx::query_as::<_, (String, Vec<u8>)>("SELECT media_type, body FROM manifests")
            .fetch(&self.pool);

        while let Some((media_type, body)) = rows.try_next().await? {
            for blob in references(&media_type, &body)?.blobs {
                live.insert(blob.digest);
            }
        }

        debug!(blobs = live.len(), "Computed live blob set");
        Ok(live)
    }

    /// Manifests without tags that no index in their repository lists,
    /// created before `cutoff`.
    pub(crate) async fn untagged_before(&self, cutoff: i64) -> Result<Vec<(String, Digest)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT m.repository, m.digest FROM manifests m
            WHERE m.created_at < ?
            AND NOT EXISTS (
                SELECT 1 FROM tags t WHERE t.repository = m.repository AND t.digest = m.digest
            )",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut untagged = vec![];
        let mut conn = self.pool.acquire().await?;
        for (repository, digest) in rows {
            let digest: Digest = digest
                .parse()
                .map_err(|err| anyhow::anyhow!("corrupt manifest row {digest}: {err}"))?;
            if !self.listed_by_index(&mut conn, &repository, &digest).await? {
                untagged.push((repository, digest));
            }
        }

        Ok(untagged)
    }
}
