//! Staking event repository for SQLite.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Sqlite;

use watchtower_core::error::{StorageError, StorageResult};
use watchtower_core::models::{AccountId, StakingEventRecord, TimeRange};
use watchtower_core::ports::StakingEventStore;

use super::helpers::{bytes_to_hash32, parse_u128};

/// Idempotent insert: re-insertion of an existing key is a no-op.
const UPSERT_SQL: &str = r#"
INSERT INTO substrate_staking_events (
    chain, height, xidx, eidx, module, event_id, beneficiary,
    amount, era, validator
)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT (chain, height, xidx, eidx) DO NOTHING
"#;

pub(crate) async fn upsert_staking_event<'e, E>(
    executor: E,
    record: &StakingEventRecord,
) -> StorageResult<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(UPSERT_SQL)
        .bind(&record.chain)
        .bind(record.block_height as i64)
        .bind(record.extrinsic_index as i64)
        .bind(record.event_index as i64)
        .bind(&record.module)
        .bind(&record.event_id)
        .bind(record.beneficiary.0.to_vec())
        .bind(record.amount.to_string())
        .bind(record.era.map(|e| e as i64))
        .bind(record.validator_stash.as_ref().map(|v| v.0.to_vec()))
        .execute(executor)
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?;
    Ok(())
}

/// SQLite implementation of [`StakingEventStore`].
pub struct SqliteStakingRepository {
    pool: SqlitePool,
}

impl SqliteStakingRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StakingEventStore for SqliteStakingRepository {
    async fn upsert_staking_events(&self, records: &[StakingEventRecord]) -> StorageResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;
        for record in records {
            upsert_staking_event(&mut *tx, record).await?;
        }
        tx.commit()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;
        Ok(())
    }

    async fn get_staking_events(
        &self,
        chain: &str,
        pubkey: &AccountId,
        range: TimeRange,
    ) -> StorageResult<Vec<StakingEventRecord>> {
        // The staking table carries no timestamp; a bounded query maps
        // heights to block timestamps through the extrinsics table.
        let mut sql = String::from(
            r#"
            SELECT s.chain, s.height, s.xidx, s.eidx, s.module, s.event_id,
                   s.beneficiary, s.amount, s.era, s.validator
            FROM substrate_staking_events s
            WHERE s.chain = ? AND s.beneficiary = ?
            "#,
        );
        if range.from.is_some() || range.to.is_some() {
            sql.push_str(
                r#" AND EXISTS (
                    SELECT 1 FROM substrate_extrinsics e
                    WHERE e.chain = s.chain AND e.height = s.height
                      AND e.ts IS NOT NULL
                "#,
            );
            if range.from.is_some() {
                sql.push_str(" AND e.ts >= ?");
            }
            if range.to.is_some() {
                sql.push_str(" AND e.ts <= ?");
            }
            sql.push(')');
        }
        sql.push_str(" ORDER BY s.height ASC, s.xidx ASC, s.eidx ASC");

        let mut query = sqlx::query_as::<_, StakingEventRow>(&sql)
            .bind(chain)
            .bind(pubkey.0.to_vec());
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

        rows.into_iter().map(StakingEventRow::into_record).collect()
    }
}

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(sqlx::FromRow)]
struct StakingEventRow {
    chain: String,
    height: i64,
    xidx: i64,
    eidx: i64,
    module: String,
    event_id: String,
    beneficiary: Vec<u8>,
    amount: String,
    era: Option<i64>,
    validator: Option<Vec<u8>>,
}

impl StakingEventRow {
    fn into_record(self) -> StorageResult<StakingEventRecord> {
        Ok(StakingEventRecord {
            chain: self.chain,
            block_height: self.height as u64,
            extrinsic_index: self.xidx as u32,
            event_index: self.eidx as u32,
            module: self.module,
            event_id: self.event_id,
            beneficiary: AccountId(bytes_to_hash32(self.beneficiary, "staking.beneficiary")?),
            amount: parse_u128(&self.amount, "staking.amount")?,
            era: self.era.map(|e| e as u32),
            validator_stash: self
                .validator
                .map(|v| bytes_to_hash32(v, "staking.validator").map(AccountId))
                .transpose()?,
        })
    }
}
