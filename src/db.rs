use std::{str::FromStr, time::Duration};

use anyhow::{Context, Result};
use sqlx::{
    SqlitePool,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
};
use tracing::info;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Open the metadata database and bring its schema up to date.
///
/// The pool holds a single connection: SQLite allows one writer at a time and
/// every write path here is a short transaction, so serializing on the pool
/// is cheaper than retrying on `SQLITE_BUSY`. Nothing may hold a transaction
/// open across byte store I/O.
pub(crate) async fn connect(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("Invalid database url {url}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .context("Failed to open metadata database")?;

    MIGRATOR
        .run(&pool)
        .await
        .context("Failed to apply metadata migrations")?;

    info!(url, "Metadata database ready");

    Ok(pool)
}

/// In-memory database, one per call.
#[cfg(test)]
pub(crate) async fn memory() -> Result<SqlitePool> {
    connect("sqlite::memory:").await
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// SQLite integers are signed; sizes and offsets never are.
pub(crate) fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

pub(crate) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
