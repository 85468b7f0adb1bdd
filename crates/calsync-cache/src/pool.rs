//! State database connections and schema versioning
//!
//! ## Design Notes
//!
//! - The schema is an ordered list of SQL scripts. `PRAGMA user_version`
//!   records how many have been applied; each remaining script runs in its
//!   own transaction together with the version bump.
//! - Every script only uses `IF NOT EXISTS` statements, so a database
//!   created before versioning was introduced (version 0) upgrades cleanly.
//! - File databases run in WAL mode with a 5 second busy timeout. An
//!   in-memory database is private to its connection, so that pool has a
//!   single connection.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::CacheError;

/// Schema scripts in application order
const SCHEMA: &[(&str, &str)] = &[
    ("initial", include_str!("migrations/20260301_initial.sql")),
    ("relay_inbox", include_str!("migrations/20260315_relay_inbox.sql")),
];

const FILE_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn file_options(db_path: &Path) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT)
}

fn memory_options() -> Result<SqliteConnectOptions, sqlx::Error> {
    SqliteConnectOptions::from_str("sqlite::memory:").map(|options| options.foreign_keys(true))
}

fn connect_error(target: &str) -> impl FnOnce(sqlx::Error) -> CacheError + '_ {
    move |e| CacheError::ConnectionFailed(format!("cannot open {target}: {e}"))
}

/// Applies the schema scripts the database has not seen yet; returns the
/// resulting schema version
async fn upgrade_schema(pool: &SqlitePool) -> Result<usize, CacheError> {
    let (version,): (i64,) = sqlx::query_as("PRAGMA user_version")
        .fetch_one(pool)
        .await
        .map_err(|e| CacheError::MigrationFailed(format!("cannot read schema version: {e}")))?;
    let applied = usize::try_from(version).unwrap_or(0);

    for (index, (name, script)) in SCHEMA.iter().enumerate().skip(applied) {
        let failed = |e: sqlx::Error| CacheError::MigrationFailed(format!("{name}: {e}"));
        let mut tx = pool.begin().await.map_err(failed)?;
        sqlx::raw_sql(script).execute(&mut *tx).await.map_err(failed)?;
        // PRAGMA arguments cannot be bound
        sqlx::raw_sql(&format!("PRAGMA user_version = {}", index + 1))
            .execute(&mut *tx)
            .await
            .map_err(failed)?;
        tx.commit().await.map_err(failed)?;
        tracing::debug!(migration = *name, version = index + 1, "Applied schema migration");
    }

    Ok(SCHEMA.len().max(applied))
}

/// Connection pool over the calsync state database
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Opens (creating if needed) the database at `db_path` and brings its
    /// schema up to date
    ///
    /// # Errors
    ///
    /// `CacheError::ConnectionFailed` when the directory or the database
    /// cannot be opened, `CacheError::MigrationFailed` when the schema
    /// cannot be upgraded.
    pub async fn new(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(dir) = db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                CacheError::ConnectionFailed(format!("cannot create {}: {e}", dir.display()))
            })?;
        }

        let target = db_path.display().to_string();
        let pool = SqlitePoolOptions::new()
            .max_connections(FILE_CONNECTIONS)
            .connect_with(file_options(db_path))
            .await
            .map_err(connect_error(&target))?;
        let version = upgrade_schema(&pool).await?;

        tracing::info!(path = %target, schema_version = version, "State database opened");
        Ok(Self { pool })
    }

    /// Private in-memory database, used by tests
    ///
    /// # Errors
    ///
    /// Same as [`DatabasePool::new`].
    pub async fn in_memory() -> Result<Self, CacheError> {
        let target = "in-memory database";
        let options = memory_options().map_err(connect_error(target))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(connect_error(target))?;
        upgrade_schema(&pool).await?;

        tracing::debug!("In-memory state database opened");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn table_exists(pool: &SqlitePool, table: &str) -> bool {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table)
                .fetch_one(pool)
                .await
                .unwrap();
        count == 1
    }

    async fn schema_version(pool: &SqlitePool) -> i64 {
        let (version,): (i64,) = sqlx::query_as("PRAGMA user_version")
            .fetch_one(pool)
            .await
            .unwrap();
        version
    }

    #[tokio::test]
    async fn test_file_database_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("calsync.db");

        let db = DatabasePool::new(&path).await.unwrap();

        assert!(path.exists());
        assert!(table_exists(db.pool(), "dedup_index").await);
        assert!(table_exists(db.pool(), "relay_batches").await);
        assert_eq!(schema_version(db.pool()).await, SCHEMA.len() as i64);
    }

    #[tokio::test]
    async fn test_reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calsync.db");

        drop(DatabasePool::new(&path).await.unwrap());
        let db = DatabasePool::new(&path).await.unwrap();
        assert_eq!(schema_version(db.pool()).await, SCHEMA.len() as i64);
    }

    #[tokio::test]
    async fn test_unversioned_database_gains_relay_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calsync.db");

        // A database that only ever saw the initial script
        {
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(file_options(&path))
                .await
                .unwrap();
            sqlx::raw_sql(SCHEMA[0].1).execute(&pool).await.unwrap();
            pool.close().await;
        }

        let db = DatabasePool::new(&path).await.unwrap();
        assert!(table_exists(db.pool(), "relay_state").await);
        assert!(table_exists(db.pool(), "relay_batch_calendars").await);
    }

    #[tokio::test]
    async fn test_in_memory_enforces_foreign_keys() {
        let db = DatabasePool::in_memory().await.unwrap();
        let (enabled,): (i64,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(enabled, 1);
    }
}
