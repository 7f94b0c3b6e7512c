//! Extrinsic repository for SQLite.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Sqlite;

use watchtower_core::error::{StorageError, StorageResult};
use watchtower_core::models::{AccountId, BlockHash, ExtrinsicRecord, TimeRange};
use watchtower_core::ports::ExtrinsicStore;

use super::helpers::{bytes_to_hash32, matched_from_json, matched_to_json, parse_u128};

/// Idempotent insert: on a primary-key conflict the existing row wins,
/// except `matched`, which becomes the sorted union of both sides.
const UPSERT_SQL: &str = r#"
INSERT INTO substrate_extrinsics (
    chain, height, xidx, block_hash, ts, signer, module, function,
    success, tip, fee, params, matched
)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT (chain, height, xidx) DO UPDATE SET
    matched = (
        SELECT json_group_array(value) FROM (
            SELECT value FROM json_each(substrate_extrinsics.matched)
            UNION
            SELECT value FROM json_each(excluded.matched)
            ORDER BY value
        )
    )
"#;

/// Insert one record through any executor, so the same statement serves
/// both the standalone path and the writer's transaction.
pub(crate) async fn upsert_extrinsic<'e, E>(
    executor: E,
    record: &ExtrinsicRecord,
) -> StorageResult<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(UPSERT_SQL)
        .bind(&record.chain)
        .bind(record.block_height as i64)
        .bind(record.extrinsic_index as i64)
        .bind(&record.block_hash.0[..])
        .bind(record.block_timestamp.map(|ts| ts.timestamp_millis()))
        .bind(record.signer.as_ref().map(|s| s.0.to_vec()))
        .bind(&record.call_module)
        .bind(&record.call_function)
        .bind(record.success)
        .bind(record.tip.to_string())
        .bind(record.fee.map(|f| f.to_string()))
        .bind(record.params.to_string())
        .bind(matched_to_json(&record.matched))
        .execute(executor)
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?;
    Ok(())
}

/// SQLite implementation of [`ExtrinsicStore`].
pub struct SqliteExtrinsicRepository {
    pool: SqlitePool,
}

impl SqliteExtrinsicRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExtrinsicStore for SqliteExtrinsicRepository {
    async fn upsert_extrinsics(&self, records: &[ExtrinsicRecord]) -> StorageResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;
        for record in records {
            upsert_extrinsic(&mut *tx, record).await?;
        }
        tx.commit()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;
        Ok(())
    }

    async fn get_extrinsics(
        &self,
        chain: &str,
        pubkey: &AccountId,
        range: TimeRange,
    ) -> StorageResult<Vec<ExtrinsicRecord>> {
        let mut sql = String::from(
            r#"
            SELECT chain, height, xidx, block_hash, ts, signer, module,
                   function, success, tip, fee, params, matched
            FROM substrate_extrinsics
            WHERE chain = ?
              AND EXISTS (SELECT 1 FROM json_each(matched) WHERE json_each.value = ?)
            "#,
        );
        // Null timestamps cannot satisfy a time bound, so any bounded
        // query excludes them.
        if range.from.is_some() || range.to.is_some() {
            sql.push_str(" AND ts IS NOT NULL");
        }
        if range.from.is_some() {
            sql.push_str(" AND ts >= ?");
        }
        if range.to.is_some() {
            sql.push_str(" AND ts <= ?");
        }
        sql.push_str(" ORDER BY height ASC, xidx ASC");

        let mut query = sqlx::query_as::<_, ExtrinsicRow>(&sql)
            .bind(chain)
            .bind(pubkey.to_hex());
        if let Some(from) = range.from {
            query = query.bind(from.timestamp_millis());
        }
        if let Some(to) = range.to {
            query = query.bind(to.timestamp_millis());
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::QueryError(e.to_string()))?;

        rows.into_iter().map(ExtrinsicRow::into_record).collect()
    }
}

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(sqlx::FromRow)]
struct ExtrinsicRow {
    chain: String,
    height: i64,
    xidx: i64,
    block_hash: Vec<u8>,
    ts: Option<i64>,
    signer: Option<Vec<u8>>,
    module: String,
    function: String,
    success: bool,
    tip: String,
    fee: Option<String>,
    params: String,
    matched: String,
}

impl ExtrinsicRow {
    fn into_record(self) -> StorageResult<ExtrinsicRecord> {
        let block_hash = bytes_to_hash32(self.block_hash, "extrinsic.block_hash")?;
        let signer = self
            .signer
            .map(|s| bytes_to_hash32(s, "extrinsic.signer").map(AccountId))
            .transpose()?;
        let params: serde_json::Value = serde_json::from_str(&self.params)
            .map_err(|e| StorageError::SerializationError(format!("extrinsic.params: {e}")))?;

        Ok(ExtrinsicRecord {
            chain: self.chain,
            block_height: self.height as u64,
            extrinsic_index: self.xidx as u32,
            block_hash: BlockHash(block_hash),
            block_timestamp: self
                .ts
                .and_then(chrono::DateTime::from_timestamp_millis),
            signer,
            call_module: self.module,
            call_function: self.function,
            success: self.success,
            tip: parse_u128(&self.tip, "extrinsic.tip")?,
            fee: self
                .fee
                .as_deref()
                .map(|f| parse_u128(f, "extrinsic.fee"))
                .transpose()?,
            params,
            matched: matched_from_json(&self.matched)?,
        })
    }
}
