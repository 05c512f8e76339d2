//! Garbage collection for manifests and blobs.
//!
//! Liveness is never stored. Each sweep rescans every manifest body for the
//! blobs it references and works from that set alone. A blob has to be
//! found unreferenced by one sweep and still be unreferenced a full grace
//! period later before its bytes go; any push that relies on it in the
//! meantime clears the mark.

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::{sync::Notify, task::JoinSet};
use tokio_retry::{
    Retry,
    strategy::{ExponentialBackoff, jitter},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    blobs::BlobRepository,
    config::{GarbageConfig, lifecycle::RetentionRule},
    context::RequestContext,
    db::{millis, now_millis},
    digest::Digest,
    error::{RegistryError, Result},
    manifests::ManifestRepository,
    metrics::{OutcomeLabels, RegistryMetrics},
    quota::QuotaAccountant,
    storage::ByteStore,
};

const ACTOR: &str = "garbage-collector";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcReport {
    pub tags_expired: u64,
    pub manifests_deleted: u64,
    /// Blobs found unreferenced for the first time.
    pub blobs_marked: u64,
    pub blobs_deleted: u64,
    pub bytes_reclaimed: u64,
    pub charges_released: u64,
    pub orphan_objects: u64,
    /// Blobs that could not be reclaimed this time round.
    pub failures: u64,
}

#[derive(Debug)]
pub struct GarbageCollector {
    pool: SqlitePool,
    store: Arc<dyn ByteStore>,
    blobs: Arc<BlobRepository>,
    manifests: Arc<ManifestRepository>,
    quota: Arc<QuotaAccountant>,
    metrics: RegistryMetrics,
    config: GarbageConfig,
    retention: Vec<RetentionRule>,
    trigger: Arc<Notify>,
}

impl GarbageCollector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        blobs: Arc<BlobRepository>,
        manifests: Arc<ManifestRepository>,
        quota: Arc<QuotaAccountant>,
        metrics: RegistryMetrics,
        config: GarbageConfig,
        retention: Vec<RetentionRule>,
        trigger: Arc<Notify>,
    ) -> Self {
        Self {
            pool,
            store: blobs.store().clone(),
            blobs,
            manifests,
            quota,
            metrics,
            config,
            retention,
            trigger,
        }
    }

    /// Ask for a sweep soon, without waiting for it.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    fn grace(&self) -> i64 {
        millis(self.config.grace_period)
    }

    async fn expire_tags(&self, now: DateTime<Utc>, report: &mut GcReport) -> Result<()> {
        let context = RequestContext::internal(ACTOR);

        for rule in &self.retention {
            let cutoff = (now - rule.max_age()).timestamp_millis();

            let expired: Vec<(String, String)> = sqlx::query_as(
                "SELECT repository, name FROM tags
                WHERE updated_at < ? AND name GLOB ? AND repository GLOB ?",
            )
            .bind(cutoff)
            .bind(rule.tag_glob())
            .bind(rule.repository_glob())
            .fetch_all(&self.pool)
            .await?;

            for (repository, tag) in expired {
                match self.manifests.delete(&repository, &tag, &context).await {
                    Ok(deleted) => {
                        debug!(repository, tag, "Expired tag");
                        report.tags_expired += 1;
                        if deleted.removed {
                            report.manifests_deleted += 1;
                        }
                    }
                    // Moved or deleted since the query ran.
                    Err(RegistryError::NotFound(_)) => {}
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(())
    }

    async fn delete_untagged(&self, now: DateTime<Utc>, report: &mut GcReport) -> Result<()> {
        let context = RequestContext::internal(ACTOR);
        let cutoff = now.timestamp_millis() - self.grace();

        for (repository, digest) in self.manifests.untagged_before(cutoff).await? {
            match self
                .manifests
                .delete(&repository, &digest.to_string(), &context)
                .await
            {
                Ok(_) => report.manifests_deleted += 1,
                Err(RegistryError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    /// Clear the mark on every live blob and mark the rest.
    async fn mark(
        &self,
        live: &HashSet<Digest>,
        now: DateTime<Utc>,
        scan_started: i64,
        report: &mut GcReport,
    ) -> Result<()> {
        let known: Vec<(String, Option<i64>)> =
            sqlx::query_as("SELECT digest, orphaned_at FROM blobs")
                .fetch_all(&self.pool)
                .await?;

        for (digest, orphaned_at) in known {
            let parsed: Digest = match digest.parse() {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(digest, error = %err, "Skipping blob with unparseable digest");
                    continue;
                }
            };

            if live.contains(&parsed) {
                if orphaned_at.is_some() {
                    sqlx::query("UPDATE blobs SET orphaned_at = NULL WHERE digest = ?")
                        .bind(&digest)
                        .execute(&self.pool)
                        .await?;
                }
                continue;
            }

            if orphaned_at.is_none() {
                // Skipped when a push relied on the blob after the scan began.
                let marked = sqlx::query(
                    "UPDATE blobs SET orphaned_at = ?
                    WHERE digest = ? AND orphaned_at IS NULL
                    AND (referenced_at IS NULL OR referenced_at < ?)",
                )
                .bind(now.timestamp_millis())
                .bind(&digest)
                .bind(scan_started)
                .execute(&self.pool)
                .await?
                .rows_affected();

                report.blobs_marked += marked;
            }
        }

        Ok(())
    }

    async fn delete_bytes(&self, key: &str) -> Result<()> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(50)
            .map(jitter)
            .take(3);

        Retry::spawn(strategy, || async {
            match self.store.delete(key).await {
                Err(err) if err.is_not_found() => Ok(()),
                other => other,
            }
        })
        .await?;

        Ok(())
    }

    async fn reclaim(
        &self,
        live: &HashSet<Digest>,
        now: DateTime<Utc>,
        scan_started: i64,
        report: &mut GcReport,
    ) -> Result<()> {
        let cutoff = now.timestamp_millis() - self.grace();

        let candidates: Vec<String> = sqlx::query_scalar(
            "SELECT digest FROM blobs
            WHERE orphaned_at IS NOT NULL AND orphaned_at <= ?1 AND created_at <= ?1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        for digest in candidates {
            let Ok(digest) = digest.parse::<Digest>() else {
                continue;
            };
            if live.contains(&digest) {
                continue;
            }

            let mut tx = self.pool.begin().await?;
            let Some((size, key)) = self
                .blobs
                .delete_in(&mut tx, &digest, cutoff, scan_started)
                .await?
            else {
                continue;
            };
            let released = self.quota.uncharge_everywhere_in(&mut tx, &digest).await?;
            tx.commit().await?;

            if let Err(err) = self.delete_bytes(&key).await {
                // The record is gone, so the orphan object pass picks the
                // bytes up once they are old enough.
                error!(%digest, key, error = %err, "Failed to delete blob bytes");
                report.failures += 1;
            }

            info!(%digest, size, released, "Reclaimed blob");
            report.blobs_deleted += 1;
            report.bytes_reclaimed += size;
            report.charges_released += released;
        }

        Ok(())
    }

    /// Charges for digests that are neither a blob nor a manifest any more.
    async fn release_dangling_charges(
        &self,
        now: DateTime<Utc>,
        report: &mut GcReport,
    ) -> Result<()> {
        let cutoff = now.timestamp_millis() - self.grace();

        let dangling: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT digest FROM project_charges c
            WHERE c.created_at < ?
            AND NOT EXISTS (SELECT 1 FROM blobs b WHERE b.digest = c.digest)
            AND NOT EXISTS (SELECT 1 FROM manifests m WHERE m.digest = c.digest)",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        for digest in dangling {
            let Ok(digest) = digest.parse::<Digest>() else {
                continue;
            };
            let mut tx = self.pool.begin().await?;
            report.charges_released += self.quota.uncharge_everywhere_in(&mut tx, &digest).await?;
            tx.commit().await?;
        }

        Ok(())
    }

    /// Objects under `blobs/` that no blob record points at.
    async fn delete_orphan_objects(&self, now: DateTime<Utc>, report: &mut GcReport) -> Result<()> {
        let cutoff = now.timestamp_millis() - self.grace();

        for key in self.store.list("blobs/").await? {
            let known: Option<i64> = sqlx::query_scalar("SELECT 1 FROM blobs WHERE key = ?")
                .bind(&key)
                .fetch_optional(&self.pool)
                .await?;
            if known.is_some() {
                continue;
            }

            let meta = match self.store.stat(&key).await {
                Ok(meta) => meta,
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err.into()),
            };
            // An upload may be about to commit it.
            if meta.created.timestamp_millis() > cutoff {
                continue;
            }

            self.delete_bytes(&key).await?;
            debug!(key, "Deleted orphan object");
            report.orphan_objects += 1;
            report.bytes_reclaimed += meta.size;
        }

        Ok(())
    }

    /// One full sweep. `now` decides what counts as old; races with
    /// concurrent pushes are judged against the wall clock.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<GcReport> {
        let scan_started = now_millis();
        let mut report = GcReport::default();

        self.expire_tags(now, &mut report).await?;
        if self.config.delete_untagged {
            self.delete_untagged(now, &mut report).await?;
        }

        let live = self.manifests.referenced_blobs().await?;
        self.mark(&live, now, scan_started, &mut report).await?;
        self.reclaim(&live, now, scan_started, &mut report).await?;
        self.release_dangling_charges(now, &mut report).await?;
        self.delete_orphan_objects(now, &mut report).await?;

        self.metrics.gc_blobs_deleted.inc_by(report.blobs_deleted);
        self.metrics.gc_bytes_reclaimed.inc_by(report.bytes_reclaimed);

        let usage = self.store.usage("blobs/").await?;
        self.metrics
            .stored_blobs
            .set(i64::try_from(usage.count).unwrap_or(i64::MAX));
        self.metrics
            .stored_bytes
            .set(i64::try_from(usage.bytes).unwrap_or(i64::MAX));

        if report != GcReport::default() {
            info!(
                tags_expired = report.tags_expired,
                manifests_deleted = report.manifests_deleted,
                blobs_marked = report.blobs_marked,
                blobs_deleted = report.blobs_deleted,
                bytes_reclaimed = report.bytes_reclaimed,
                orphan_objects = report.orphan_objects,
                "Garbage collection finished"
            );
        }

        Ok(report)
    }

    pub fn spawn(
        self: Arc<Self>,
        tasks: &mut JoinSet<anyhow::Result<()>>,
        shutdown: CancellationToken,
    ) {
        if !self.config.enabled {
            info!("Garbage collection is disabled");
            return;
        }

        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = self.trigger.notified() => {
                        // Let a burst of deletes settle into one sweep.
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }

                let outcome = match self.sweep(Utc::now()).await {
                    Ok(_) => "ok",
                    Err(err) => {
                        warn!(error = %err, "Garbage collection failed, retrying next sweep");
                        "failed"
                    }
                };
                self.metrics
                    .gc_sweeps
                    .get_or_create(&OutcomeLabels { outcome })
                    .inc();
            }

            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;
    use uuid::Uuid;

    use super::*;
    use crate::{
        config::lifecycle::StringMatch,
        storage::{once, read_all},
        tests::{Gate, GatedStore, StateFixture},
    };

    fn later(fixture: &StateFixture) -> DateTime<Utc> {
        Utc::now()
            + chrono::Duration::from_std(fixture.config.garbage.grace_period).unwrap()
            + chrono::Duration::seconds(1)
    }

    #[test(tokio::test)]
    async fn reclaims_only_unreferenced_blobs() -> anyhow::Result<()> {
        let fixture = StateFixture::new().await?;
        let (kept, kept_blobs) = fixture.image("library/alpine", "kept").await?;
        let (gone, gone_blobs) = fixture.image("library/alpine", "gone").await?;
        // A layer of the deleted image lives on in another repository.
        let shared = StateFixture::manifest_body(&gone_blobs[..1], "shared");

        fixture
            .manifests
            .push("library/alpine", "kept", None, kept, &fixture.context())
            .await?;
        fixture
            .manifests
            .push("library/alpine", "gone", None, gone, &fixture.context())
            .await?;
        fixture
            .manifests
            .push("other/app", "shared", None, shared, &fixture.context())
            .await?;

        fixture
            .manifests
            .delete("library/alpine", "gone", &fixture.context())
            .await?;

        let first = fixture.gc.sweep(Utc::now()).await?;
        assert_eq!(first.blobs_marked, 1);
        assert_eq!(first.blobs_deleted, 0);

        let second = fixture.gc.sweep(later(&fixture)).await?;
        assert_eq!(second.blobs_deleted, 1);
        assert_eq!(second.bytes_reclaimed, gone_blobs[1].1);

        assert!(!fixture.blobs.exists(&gone_blobs[1].0).await?);
        assert!(fixture.blobs.exists(&gone_blobs[0].0).await?);
        for (digest, _) in &kept_blobs {
            assert!(fixture.blobs.exists(digest).await?);
        }
        assert!(fixture.store.list(&gone_blobs[1].0.blob_prefix()).await?.is_empty());
        assert_eq!(fixture.metrics.stored_blobs.get(), 3);

        fixture.teardown().await
    }

    #[test(tokio::test)]
    async fn reupload_while_bytes_are_deleted_survives() -> anyhow::Result<()> {
        let store = Arc::new(GatedStore::new(Gate::Delete, "blobs/"));
        let fixture = StateFixture::with_store(store.clone(), |_| {}).await?;
        let (digest, _) = fixture.blob("library/alpine", b"layer").await?;

        fixture.gc.sweep(Utc::now()).await?;
        let sweep = tokio::spawn({
            let gc = fixture.gc.clone();
            let now = later(&fixture);
            async move { gc.sweep(now).await }
        });

        // The record is gone and the old bytes are about to be deleted.
        store.reached.notified().await;
        assert!(!fixture.blobs.exists(&digest).await?);
        fixture.blob("library/alpine", b"layer").await?;
        store.release.notify_one();

        let report = sweep.await??;
        assert_eq!(report.blobs_deleted, 1);

        let (body, size) = fixture.blobs.open(&digest).await?;
        assert_eq!(size, 5);
        assert_eq!(read_all(body).await?, "layer");
        assert_eq!(fixture.store.list(&digest.blob_prefix()).await?.len(), 1);

        fixture.teardown().await
    }

    #[test(tokio::test)]
    async fn repush_clears_the_mark() -> anyhow::Result<()> {
        let fixture = StateFixture::new().await?;
        let (body, blobs) = fixture.image("library/alpine", "v1").await?;

        // Uploaded but not yet referenced.
        fixture.gc.sweep(Utc::now()).await?;

        fixture
            .manifests
            .push("library/alpine", "latest", None, body, &fixture.context())
            .await?;

        let report = fixture.gc.sweep(later(&fixture)).await?;
        assert_eq!(report.blobs_deleted, 0);
        for (digest, _) in &blobs {
            assert!(fixture.blobs.exists(digest).await?);
        }

        fixture.teardown().await
    }

    #[test(tokio::test)]
    async fn young_blobs_survive() -> anyhow::Result<()> {
        let fixture = StateFixture::new().await?;
        let (_, blobs) = fixture.image("library/alpine", "v1").await?;

        fixture.gc.sweep(Utc::now()).await?;
        let report = fixture.gc.sweep(Utc::now()).await?;
        assert_eq!(report.blobs_deleted, 0);
        assert!(fixture.blobs.exists(&blobs[0].0).await?);

        fixture.teardown().await
    }

    #[test(tokio::test)]
    async fn reclaiming_releases_quota() -> anyhow::Result<()> {
        let fixture = StateFixture::new().await?;
        let (_, blobs) = fixture.image("library/alpine", "v1").await?;
        let (digest, size) = blobs[0].clone();

        fixture.uploads.mount("team/app", &digest).await?;
        assert_eq!(fixture.quota.usage("team").await?.used, size);

        fixture.gc.sweep(Utc::now()).await?;
        fixture.gc.sweep(later(&fixture)).await?;

        assert_eq!(fixture.quota.usage("team").await?.used, 0);
        assert!(!fixture.quota.is_charged("team", &digest).await?);

        fixture.teardown().await
    }

    #[test(tokio::test)]
    async fn removes_orphan_objects() -> anyhow::Result<()> {
        let fixture = StateFixture::new().await?;
        let stray = Digest::of(b"stray").object_key(&Uuid::new_v4());

        fixture.store.put(&stray, once("stray"), Some(5)).await?;

        let report = fixture.gc.sweep(Utc::now()).await?;
        assert_eq!(report.orphan_objects, 0);

        let report = fixture.gc.sweep(later(&fixture)).await?;
        assert_eq!(report.orphan_objects, 1);
        assert!(!fixture.store.exists(&stray).await?);

        fixture.teardown().await
    }

    #[test(tokio::test)]
    async fn expires_old_tags() -> anyhow::Result<()> {
        let fixture = StateFixture::with_config(|config| {
            config.retention = vec![RetentionRule::Tag {
                repository: Some(StringMatch::Exact {
                    exact: "library/alpine".into(),
                }),
                tag: Some(StringMatch::Starts {
                    starts: "pr-".into(),
                }),
                older_than: 5,
            }];
        })
        .await?;
        let (body, _) = fixture.image("library/alpine", "v1").await?;

        for tag in ["pr-1", "latest"] {
            fixture
                .manifests
                .push("library/alpine", tag, None, body.clone(), &fixture.context())
                .await?;
        }

        let report = fixture.gc.sweep(Utc::now()).await?;
        assert_eq!(report.tags_expired, 0);

        let report = fixture
            .gc
            .sweep(Utc::now() + chrono::Duration::days(6))
            .await?;
        assert_eq!(report.tags_expired, 1);
        assert_eq!(
            fixture.manifests.list_tags("library/alpine", None, None).await?,
            vec!["latest"]
        );

        fixture.teardown().await
    }

    #[test(tokio::test)]
    async fn untagged_manifests_are_collected_when_enabled() -> anyhow::Result<()> {
        let fixture =
            StateFixture::with_config(|config| config.garbage.delete_untagged = true).await?;
        let (body, _) = fixture.image("library/alpine", "v1").await?;
        let digest = Digest::of(&body);

        fixture
            .manifests
            .push("library/alpine", &digest.to_string(), None, body, &fixture.context())
            .await?;

        let report = fixture.gc.sweep(Utc::now()).await?;
        assert_eq!(report.manifests_deleted, 0);

        let report = fixture.gc.sweep(later(&fixture)).await?;
        assert_eq!(report.manifests_deleted, 1);
        assert!(
            fixture
                .manifests
                .stat("library/alpine", &digest.to_string())
                .await
                .is_err()
        );

        fixture.teardown().await
    }
}
