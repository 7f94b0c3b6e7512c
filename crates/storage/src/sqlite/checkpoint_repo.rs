//! Checkpoint repository for SQLite.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Sqlite;

use watchtower_core::error::{StorageError, StorageResult};
use watchtower_core::models::{AccountId, Checkpoint, StreamKind};
use watchtower_core::ports::CheckpointStore;

use super::helpers::{bytes_to_hash32, parse_stream};

/// Monotone upsert: a height at or below the stored one leaves the row
/// untouched.
const ADVANCE_SQL: &str = r#"
INSERT INTO substrate_checkpoints (chain, pubkey, stream, height)
VALUES (?, ?, ?, ?)
ON CONFLICT (chain, pubkey, stream) DO UPDATE SET
    height = excluded.height
WHERE excluded.height > substrate_checkpoints.height
"#;

/// Advance one checkpoint through any executor. Monotone by
/// construction; use [`CheckpointStore::advance_checkpoint`] when a
/// regression must be reported instead of ignored.
pub(crate) async fn advance_checkpoint_monotone<'e, E>(
    executor: E,
    checkpoint: &Checkpoint,
) -> StorageResult<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(ADVANCE_SQL)
        .bind(&checkpoint.chain)
        .bind(checkpoint.pubkey.0.to_vec())
        .bind(checkpoint.stream.as_str())
        .bind(checkpoint.height as i64)
        .execute(executor)
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?;
    Ok(())
}

/// SQLite implementation of [`CheckpointStore`].
pub struct SqliteCheckpointRepository {
    pool: SqlitePool,
}

impl SqliteCheckpointRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointRepository {
    async fn get_checkpoint(
        &self,
        chain: &str,
        pubkey: &AccountId,
        stream: StreamKind,
    ) -> StorageResult<Option<Checkpoint>> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT chain, pubkey, stream, height
            FROM substrate_checkpoints
            WHERE chain = ? AND pubkey = ? AND stream = ?
            "#,
        )
        .bind(chain)
        .bind(pubkey.0.to_vec())
        .bind(stream.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?;

        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    async fn advance_checkpoint(&self, checkpoint: &Checkpoint) -> StorageResult<()> {
        let existing = self
            .get_checkpoint(&checkpoint.chain, &checkpoint.pubkey, checkpoint.stream)
            .await?;
        if let Some(existing) = existing {
            if checkpoint.height < existing.height {
                return Err(StorageError::CheckpointRegression {
                    chain: checkpoint.chain.clone(),
                    stream: checkpoint.stream.as_str().to_string(),
                    from: existing.height,
                    to: checkpoint.height,
                });
            }
        }
        advance_checkpoint_monotone(&self.pool, checkpoint).await
    }
}

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    chain: String,
    pubkey: Vec<u8>,
    stream: String,
    height: i64,
}

impl CheckpointRow {
    fn into_checkpoint(self) -> StorageResult<Checkpoint> {
        Ok(Checkpoint {
            chain: self.chain,
            pubkey: AccountId(bytes_to_hash32(self.pubkey, "checkpoint.pubkey")?),
            stream: parse_stream(&self.stream)?,
            height: self.height as u64,
        })
    }
}
