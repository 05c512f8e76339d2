//! Per-project storage accounting.
//!
//! A project is charged once for every distinct digest (blob or manifest)
//! it references. The charge is remembered in `project_charges` so releasing
//! it later gives back exactly what was taken, however often the release is
//! retried.

use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::{
    db::{now_millis, to_i64, to_u64},
    digest::Digest,
    error::{RegistryError, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProjectUsage {
    pub used: u64,
    /// `None` means unlimited.
    pub limit: Option<u64>,
}

impl ProjectUsage {
    fn from_row(used: i64, quota: i64) -> Self {
        Self {
            used: to_u64(used),
            limit: (quota >= 0).then(|| to_u64(quota)),
        }
    }
}

#[derive(Debug)]
pub struct QuotaAccountant {
    pool: SqlitePool,
    default_limit: Option<u64>,
}

impl QuotaAccountant {
    pub fn new(pool: SqlitePool, default_limit: Option<u64>) -> Self {
        Self {
            pool,
            default_limit,
        }
    }

    fn default_quota(&self) -> i64 {
        self.default_limit.map(to_i64).unwrap_or(-1)
    }

    /// Create the quota row for a project if it does not exist yet. Callers
    /// that open a transaction issue this first so the transaction holds the
    /// write lock before it reads anything.
    pub(crate) async fn ensure(&self, conn: &mut SqliteConnection, project: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO quotas (project, used, quota) VALUES (?, 0, ?)")
            .bind(project)
            .bind(self.default_quota())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn usage(&self, project: &str) -> Result<ProjectUsage> {
        let mut conn = self.pool.acquire().await?;
        self.usage_in(&mut conn, project).await
    }

    pub(crate) async fn usage_in(
        &self,
        conn: &mut SqliteConnection,
        project: &str,
    ) -> Result<ProjectUsage> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT used, quota FROM quotas WHERE project = ?")
                .bind(project)
                .fetch_optional(&mut *conn)
                .await?;

        Ok(match row {
            Some((used, quota)) => ProjectUsage::from_row(used, quota),
            None => ProjectUsage {
                used: 0,
                limit: self.default_limit,
            },
        })
    }

    /// Atomically add `bytes` to the project's usage if it stays within quota.
    pub async fn check_and_reserve(&self, project: &str, bytes: u64) -> Result<ProjectUsage> {
        let mut conn = self.pool.acquire().await?;
        self.reserve_in(&mut conn, project, bytes).await
    }

    pub(crate) async fn reserve_in(
        &self,
        conn: &mut SqliteConnection,
        project: &str,
        bytes: u64,
    ) -> Result<ProjectUsage> {
        self.ensure(conn, project).await?;

        if bytes == 0 {
            return self.usage_in(conn, project).await;
        }

        let row: Option<(i64, i64)> = sqlx::query_as(
            "UPDATE quotas SET used = used + ?1
            WHERE project = ?2 AND (quota < 0 OR used + ?1 <= quota)
            RETURNING used, quota",
        )
        .bind(to_i64(bytes))
        .bind(project)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some((used, quota)) => {
                debug!(project, bytes, used, "Reserved quota");
                Ok(ProjectUsage::from_row(used, quota))
            }
            None => {
                let current = self.usage_in(conn, project).await?;
                Err(RegistryError::QuotaExceeded {
                    project: project.to_string(),
                    requested: bytes,
                    used: current.used,
                    limit: current.limit.unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Give back `bytes`. Usage is clamped at zero.
    pub async fn release(&self, project: &str, bytes: u64) -> Result<ProjectUsage> {
        let mut conn = self.pool.acquire().await?;
        self.release_in(&mut conn, project, bytes).await?;
        self.usage_in(&mut conn, project).await
    }

    pub(crate) async fn release_in(
        &self,
        conn: &mut SqliteConnection,
        project: &str,
        bytes: u64,
    ) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }

        sqlx::query("UPDATE quotas SET used = MAX(used - ?, 0) WHERE project = ?")
            .bind(to_i64(bytes))
            .bind(project)
            .execute(&mut *conn)
            .await?;

        debug!(project, bytes, "Released quota");

        Ok(())
    }

    pub async fn set_limit(&self, project: &str, limit: Option<u64>) -> Result<ProjectUsage> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            "INSERT INTO quotas (project, used, quota) VALUES (?1, 0, ?2)
            ON CONFLICT (project) DO UPDATE SET quota = excluded.quota",
        )
        .bind(project)
        .bind(limit.map(to_i64).unwrap_or(-1))
        .execute(&mut *conn)
        .await?;

        self.usage_in(&mut conn, project).await
    }

    /// Charge a project for every digest in `items` it is not already charged
    /// for. Either all new charges fit in the quota and are recorded, or
    /// nothing is. Returns the bytes added.
    pub(crate) async fn charge_in(
        &self,
        conn: &mut SqliteConnection,
        project: &str,
        items: &[(Digest, u64)],
    ) -> Result<u64> {
        self.ensure(conn, project).await?;

        let mut fresh: Vec<&(Digest, u64)> = vec![];
        for item in items {
            if fresh.iter().any(|(digest, _)| digest == &item.0) {
                continue;
            }

            let charged: Option<i64> =
                sqlx::query_scalar("SELECT size FROM project_charges WHERE project = ? AND digest = ?")
                    .bind(project)
                    .bind(item.0.to_string())
                    .fetch_optional(&mut *conn)
                    .await?;

            if charged.is_none() {
                fresh.push(item);
            }
        }

        let bytes = fresh.iter().map(|(_, size)| size).sum();
        self.reserve_in(conn, project, bytes).await?;

        let now = now_millis();
        for (digest, size) in fresh {
            sqlx::query(
                "INSERT INTO project_charges (project, digest, size, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(project)
            .bind(digest.to_string())
            .bind(to_i64(*size))
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }

        Ok(bytes)
    }

    /// Charge in a transaction of its own.
    pub async fn charge(&self, project: &str, items: &[(Digest, u64)]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let bytes = self.charge_in(&mut tx, project, items).await?;
        tx.commit().await?;
        Ok(bytes)
    }

    /// Drop the project's charges for `digests` and release what they cost.
    pub(crate) async fn uncharge_in(
        &self,
        conn: &mut SqliteConnection,
        project: &str,
        digests: &[Digest],
    ) -> Result<u64> {
        let mut bytes = 0;

        for digest in digests {
            let size: Option<i64> = sqlx::query_scalar(
                "DELETE FROM project_charges WHERE project = ? AND digest = ? RETURNING size",
            )
            .bind(project)
            .bind(digest.to_string())
            .fetch_optional(&mut *conn)
            .await?;

            bytes += size.map(to_u64).unwrap_or(0);
        }

        self.release_in(conn, project, bytes).await?;
        Ok(bytes)
    }

    pub async fn uncharge(&self, project: &str, digests: &[Digest]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let bytes = self.uncharge_in(&mut tx, project, digests).await?;
        tx.commit().await?;
        Ok(bytes)
    }

    /// Drop every project's charge for a digest that no longer exists.
    pub(crate) async fn uncharge_everywhere_in(
        &self,
        conn: &mut SqliteConnection,
        digest: &Digest,
    ) -> Result<u64> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("DELETE FROM project_charges WHERE digest = ? RETURNING project, size")
                .bind(digest.to_string())
                .fetch_all(&mut *conn)
                .await?;

        let mut total = 0;
        for (project, size) in rows {
            self.release_in(conn, &project, to_u64(size)).await?;
            total += to_u64(size);
        }

        Ok(total)
    }

    pub async fn is_charged(&self, project: &str, digest: &Digest) -> Result<bool> {
        let row: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM project_charges WHERE project = ? AND digest = ?")
                .bind(project)
                .bind(digest.to_string())
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.is_some())
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::db;

    async fn accountant(default_limit: Option<u64>) -> QuotaAccountant {
        QuotaAccountant::new(db::memory().await.unwrap(), default_limit)
    }

    #[test(tokio::test)]
    async fn unlimited_by_default() -> anyhow::Result<()> {
        let quota = accountant(None).await;

        let usage = quota.check_and_reserve("library", 1 << 40).await?;
        assert_eq!(
            usage,
            ProjectUsage {
                used: 1 << 40,
                limit: None
            }
        );

        Ok(())
    }

    #[test(tokio::test)]
    async fn reserve_within_limit() -> anyhow::Result<()> {
        let quota = accountant(Some(100)).await;

        quota.check_and_reserve("team", 60).await?;
        quota.check_and_reserve("team", 40).await?;

        let err = quota.check_and_reserve("team", 1).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::QuotaExceeded {
                used: 100,
                limit: 100,
                requested: 1,
                ..
            }
        ));

        // Other projects are independent
        quota.check_and_reserve("other", 100).await?;

        Ok(())
    }

    #[test(tokio::test)]
    async fn rejected_reservation_leaves_usage_alone() -> anyhow::Result<()> {
        let quota = accountant(None).await;
        quota.set_limit("team", Some(100)).await?;
        quota.check_and_reserve("team", 90).await?;

        assert!(matches!(
            quota.check_and_reserve("team", 20).await,
            Err(RegistryError::QuotaExceeded { .. })
        ));
        assert_eq!(quota.usage("team").await?.used, 90);

        Ok(())
    }

    #[test(tokio::test)]
    async fn concurrent_reservations_cannot_overshoot() -> anyhow::Result<()> {
        let quota = accountant(Some(100)).await;

        let (a, b) = tokio::join!(
            quota.check_and_reserve("team", 60),
            quota.check_and_reserve("team", 60)
        );

        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert_eq!(quota.usage("team").await?.used, 60);

        Ok(())
    }

    #[test(tokio::test)]
    async fn release_clamps_at_zero() -> anyhow::Result<()> {
        let quota = accountant(None).await;
        quota.check_and_reserve("team", 10).await?;

        assert_eq!(quota.release("team", 4).await?.used, 6);
        assert_eq!(quota.release("team", 100).await?.used, 0);
        assert_eq!(quota.release("team", 100).await?.used, 0);

        Ok(())
    }

    #[test(tokio::test)]
    async fn charges_each_digest_once() -> anyhow::Result<()> {
        let quota = accountant(None).await;
        let a = Digest::of(b"a");
        let b = Digest::of(b"b");

        assert_eq!(quota.charge("team", &[(a.clone(), 10)]).await?, 10);
        assert_eq!(
            quota
                .charge("team", &[(a.clone(), 10), (b.clone(), 5), (b.clone(), 5)])
                .await?,
            5
        );
        assert_eq!(quota.usage("team").await?.used, 15);

        // Another project pays for its own reference
        assert_eq!(quota.charge("other", &[(a.clone(), 10)]).await?, 10);

        assert_eq!(quota.uncharge("team", &[a.clone()]).await?, 10);
        assert_eq!(quota.uncharge("team", &[a.clone()]).await?, 0);
        assert_eq!(quota.usage("team").await?.used, 5);
        assert!(!quota.is_charged("team", &a).await?);
        assert!(quota.is_charged("other", &a).await?);

        Ok(())
    }

    #[test(tokio::test)]
    async fn failed_charge_records_nothing() -> anyhow::Result<()> {
        let quota = accountant(Some(10)).await;
        let a = Digest::of(b"a");
        let b = Digest::of(b"b");

        let err = quota
            .charge("team", &[(a.clone(), 6), (b.clone(), 6)])
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::QuotaExceeded { .. }));

        assert!(!quota.is_charged("team", &a).await?);
        assert_eq!(quota.usage("team").await?.used, 0);

        Ok(())
    }
}
