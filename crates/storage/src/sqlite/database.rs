//! SQLite database connection and schema management.
//!
//! One embedded database file per user. Migrations are append-only; a
//! `schema_version` row gates startup so an older binary refuses a
//! newer database instead of corrupting it.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, instrument};

use watchtower_core::error::{StorageError, StorageResult};

/// Append-only migration list. Never edit an entry in place; add a new
/// one at the end.
const MIGRATIONS: &[&str] = &[
    // v1: base schema
    r#"
    CREATE TABLE IF NOT EXISTS substrate_extrinsics (
        chain      TEXT    NOT NULL,
        height     INTEGER NOT NULL,
        xidx       INTEGER NOT NULL,
        block_hash BLOB    NOT NULL,
        ts         INTEGER NULL,
        signer     BLOB    NULL,
        module     TEXT    NOT NULL,
        function   TEXT    NOT NULL,
        success    INTEGER NOT NULL,
        tip        TEXT    NOT NULL,
        fee        TEXT    NULL,
        params     TEXT    NOT NULL,
        matched    TEXT    NOT NULL,
        PRIMARY KEY (chain, height, xidx)
    );

    CREATE TABLE IF NOT EXISTS substrate_staking_events (
        chain       TEXT    NOT NULL,
        height      INTEGER NOT NULL,
        xidx        INTEGER NOT NULL,
        eidx        INTEGER NOT NULL,
        module      TEXT    NOT NULL,
        event_id    TEXT    NOT NULL,
        beneficiary BLOB    NOT NULL,
        amount      TEXT    NOT NULL,
        era         INTEGER NULL,
        validator   BLOB    NULL,
        PRIMARY KEY (chain, height, xidx, eidx)
    );

    CREATE TABLE IF NOT EXISTS substrate_checkpoints (
        chain  TEXT    NOT NULL,
        pubkey BLOB    NOT NULL,
        stream TEXT    NOT NULL,
        height INTEGER NOT NULL,
        PRIMARY KEY (chain, pubkey, stream)
    );

    CREATE INDEX IF NOT EXISTS idx_extrinsics_matched_ts
        ON substrate_extrinsics (chain, matched, ts);

    CREATE INDEX IF NOT EXISTS idx_staking_beneficiary
        ON substrate_staking_events (chain, beneficiary, height);
    "#,
];

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the database file, or `:memory:` for tests.
    pub path: String,
    /// Maximum number of connections in the pool. The writer holds one
    /// exclusively; readers share the rest.
    pub max_connections: u32,
    /// Connection acquisition timeout.
    pub acquire_timeout: Duration,
}

impl DatabaseConfig {
    pub fn at_path(path: &str) -> Self {
        Self {
            path: path.to_string(),
            max_connections: 4,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Connection pool wrapper for one user's database file.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database and bring the schema up to date.
    #[instrument(skip_all, fields(path = %config.path))]
    pub async fn open(config: &DatabaseConfig) -> StorageResult<Self> {
        let url = if config.path.starts_with("sqlite:") {
            config.path.clone()
        } else {
            format!("sqlite:{}?mode=rwc", config.path)
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| StorageError::ConnectionError(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionError(e.to_string()))?;

        // WAL mode: concurrent readers while the writer commits.
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&pool)
            .await
            .map_err(|e| StorageError::ConnectionError(e.to_string()))?;
        sqlx::query("PRAGMA foreign_keys=ON;")
            .execute(&pool)
            .await
            .map_err(|e| StorageError::ConnectionError(e.to_string()))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Open an in-memory database. All data is lost when the pool is
    /// dropped; for tests.
    pub async fn in_memory() -> StorageResult<Self> {
        // A single connection keeps every handle on the same in-memory
        // database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StorageError::ConnectionError(e.to_string()))?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply pending migrations, gated on the stored schema version.
    async fn migrate(&self) -> StorageResult<()> {
        sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::MigrationError(e.to_string()))?;

        let current: Option<(i64,)> = sqlx::query_as("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::MigrationError(e.to_string()))?;
        let current = current.map(|(v,)| v).unwrap_or(0);

        let latest = MIGRATIONS.len() as i64;
        if current > latest {
            return Err(StorageError::MigrationError(format!(
                "database schema version {current} is newer than supported version {latest}"
            )));
        }
        if current == latest {
            debug!(version = current, "schema up to date");
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;

        for (index, migration) in MIGRATIONS.iter().enumerate().skip(current as usize) {
            debug!(version = index + 1, "applying migration");
            sqlx::raw_sql(migration)
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::MigrationError(e.to_string()))?;
        }

        sqlx::query("DELETE FROM schema_version")
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::MigrationError(e.to_string()))?;
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(latest)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::MigrationError(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;

        debug!(version = latest, "migrations applied");
        Ok(())
    }

    /// Check if the database connection is healthy.
    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_schema_is_current() {
        let db = Database::in_memory().await.unwrap();
        let (version,): (i64,) = sqlx::query_as("SELECT version FROM schema_version")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(version, MIGRATIONS.len() as i64);
        assert!(db.is_healthy().await);
    }

    #[tokio::test]
    async fn newer_schema_is_rejected() {
        let db = Database::in_memory().await.unwrap();
        sqlx::query("UPDATE schema_version SET version = 999")
            .execute(db.pool())
            .await
            .unwrap();

        let result = db.migrate().await;
        assert!(matches!(result, Err(StorageError::MigrationError(_))));
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        db.migrate().await.unwrap();
        assert!(db.is_healthy().await);
    }
}
