//! SQLite storage adapter.
//!
//! This module implements the store traits defined in `watchtower-core`
//! against a single embedded database file.
//!
//! # Architecture
//!
//! - [`Database`] - Connection pool, WAL mode, schema-version gate
//! - [`SqliteStore`] - Composite store implementing the `Store` trait
//! - Individual repos: `SqliteExtrinsicRepository`, etc.
//!
//! The load-bearing piece is [`SqliteStore::commit_batch`]: records and
//! the checkpoints covering them commit in one transaction, so a crash
//! can leave checkpoints behind the data but never ahead of it.

mod checkpoint_repo;
mod database;
mod extrinsic_repo;
mod helpers;
mod staking_repo;

pub use checkpoint_repo::SqliteCheckpointRepository;
pub use database::{Database, DatabaseConfig};
pub use extrinsic_repo::SqliteExtrinsicRepository;
pub use staking_repo::SqliteStakingRepository;

use std::sync::Arc;

use async_trait::async_trait;

use watchtower_core::error::{StorageError, StorageResult};
use watchtower_core::models::{AccountId, Checkpoint, RecordBatch};
use watchtower_core::ports::{CheckpointStore, ExtrinsicStore, StakingEventStore, Store};

// =============================================================================
// Composite Store
// =============================================================================

/// Aggregated SQLite repositories implementing the `Store` trait.
pub struct SqliteStore {
    db: Arc<Database>,
    extrinsics: SqliteExtrinsicRepository,
    staking: SqliteStakingRepository,
    checkpoints: SqliteCheckpointRepository,
}

impl SqliteStore {
    /// Create a new store aggregate from a database connection.
    pub fn new(db: Arc<Database>) -> Self {
        let pool = db.pool().clone();
        Self {
            extrinsics: SqliteExtrinsicRepository::new(pool.clone()),
            staking: SqliteStakingRepository::new(pool.clone()),
            checkpoints: SqliteCheckpointRepository::new(pool),
            db,
        }
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn extrinsics(&self) -> &dyn ExtrinsicStore {
        &self.extrinsics
    }

    fn staking_events(&self) -> &dyn StakingEventStore {
        &self.staking
    }

    fn checkpoints(&self) -> &dyn CheckpointStore {
        &self.checkpoints
    }

    async fn commit_batch(
        &self,
        batch: &RecordBatch,
        checkpoints: &[Checkpoint],
    ) -> StorageResult<()> {
        if batch.is_empty() && checkpoints.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;

        for record in &batch.extrinsics {
            extrinsic_repo::upsert_extrinsic(&mut *tx, record).await?;
        }
        for record in &batch.staking_events {
            staking_repo::upsert_staking_event(&mut *tx, record).await?;
        }
        for checkpoint in checkpoints {
            checkpoint_repo::advance_checkpoint_monotone(&mut *tx, checkpoint).await?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;
        Ok(())
    }

    async fn delete_history(
        &self,
        chain: &str,
        pubkey: Option<&AccountId>,
    ) -> StorageResult<u64> {
        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;

        let removed = match pubkey {
            None => {
                let extrinsics = sqlx::query("DELETE FROM substrate_extrinsics WHERE chain = ?")
                    .bind(chain)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StorageError::QueryError(e.to_string()))?
                    .rows_affected();
                let staking =
                    sqlx::query("DELETE FROM substrate_staking_events WHERE chain = ?")
                        .bind(chain)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| StorageError::QueryError(e.to_string()))?
                        .rows_affected();
                sqlx::query("DELETE FROM substrate_checkpoints WHERE chain = ?")
                    .bind(chain)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StorageError::QueryError(e.to_string()))?;
                extrinsics + staking
            }
            Some(pubkey) => {
                // Scrub the account out of matched sets, then drop rows
                // that no longer pertain to anyone.
                sqlx::query(
                    r#"
                    UPDATE substrate_extrinsics SET matched = (
                        SELECT COALESCE(json_group_array(value), '[]')
                        FROM json_each(matched) WHERE value <> ?2
                    )
                    WHERE chain = ?1
                      AND EXISTS (SELECT 1 FROM json_each(matched) WHERE value = ?2)
                    "#,
                )
                .bind(chain)
                .bind(pubkey.to_hex())
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::QueryError(e.to_string()))?;

                let extrinsics = sqlx::query(
                    "DELETE FROM substrate_extrinsics WHERE chain = ? AND json_array_length(matched) = 0",
                )
                .bind(chain)
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::QueryError(e.to_string()))?
                .rows_affected();

                let staking = sqlx::query(
                    "DELETE FROM substrate_staking_events WHERE chain = ? AND beneficiary = ?",
                )
                .bind(chain)
                .bind(pubkey.0.to_vec())
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::QueryError(e.to_string()))?
                .rows_affected();

                sqlx::query("DELETE FROM substrate_checkpoints WHERE chain = ? AND pubkey = ?")
                    .bind(chain)
                    .bind(pubkey.0.to_vec())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StorageError::QueryError(e.to_string()))?;

                extrinsics + staking
            }
        };

        tx.commit()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;
        Ok(removed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeSet;
    use watchtower_core::models::{
        BlockHash, ExtrinsicRecord, StakingEventRecord, StreamKind, TimeRange,
    };

    async fn store() -> SqliteStore {
        SqliteStore::new(Arc::new(Database::in_memory().await.unwrap()))
    }

    fn extrinsic(height: u64, xidx: u32, matched: &[u8]) -> ExtrinsicRecord {
        ExtrinsicRecord {
            chain: "kusama".into(),
            block_height: height,
            extrinsic_index: xidx,
            block_hash: BlockHash([height as u8; 32]),
            block_timestamp: chrono::Utc
                .timestamp_millis_opt(1_613_727_474_000 + height as i64 * 6_000)
                .single(),
            signer: Some(AccountId([0xaa; 32])),
            call_module: "Balances".into(),
            call_function: "transfer_keep_alive".into(),
            success: true,
            tip: 0,
            fee: Some(15_600_000_000),
            params: serde_json::json!({"dest": "0x01", "value": "200000000000000"}),
            matched: matched.iter().map(|b| AccountId([*b; 32])).collect(),
        }
    }

    fn staking_event(height: u64, eidx: u32, beneficiary: u8) -> StakingEventRecord {
        StakingEventRecord {
            chain: "kusama".into(),
            block_height: height,
            extrinsic_index: 2,
            event_index: eidx,
            module: "Staking".into(),
            event_id: "Reward".into(),
            beneficiary: AccountId([beneficiary; 32]),
            amount: 56_754_728_805,
            era: Some(2048),
            validator_stash: Some(AccountId([0x11; 32])),
        }
    }

    fn checkpoint(pubkey: u8, stream: StreamKind, height: u64) -> Checkpoint {
        Checkpoint {
            chain: "kusama".into(),
            pubkey: AccountId([pubkey; 32]),
            stream,
            height,
        }
    }

    #[tokio::test]
    async fn replayed_upsert_unions_matched_sets() {
        let store = store().await;
        let account = AccountId([0x20; 32]);

        store
            .extrinsics()
            .upsert_extrinsics(&[extrinsic(100, 2, &[0x20])])
            .await
            .unwrap();
        // Replay the same key with a different matched set.
        store
            .extrinsics()
            .upsert_extrinsics(&[extrinsic(100, 2, &[0x21])])
            .await
            .unwrap();

        let records = store
            .extrinsics()
            .get_extrinsics("kusama", &account, TimeRange::default())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].matched,
            BTreeSet::from([AccountId([0x20; 32]), AccountId([0x21; 32])])
        );
    }

    #[tokio::test]
    async fn staking_reinsert_is_noop() {
        let store = store().await;
        let event = staking_event(100, 7, 0x20);

        store
            .staking_events()
            .upsert_staking_events(&[event.clone()])
            .await
            .unwrap();
        store
            .staking_events()
            .upsert_staking_events(&[event])
            .await
            .unwrap();

        let records = store
            .staking_events()
            .get_staking_events("kusama", &AccountId([0x20; 32]), TimeRange::default())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].amount, 56_754_728_805);
        assert_eq!(records[0].era, Some(2048));
    }

    #[tokio::test]
    async fn checkpoint_is_monotone() {
        let store = store().await;
        store
            .checkpoints()
            .advance_checkpoint(&checkpoint(0x20, StreamKind::Extrinsics, 100))
            .await
            .unwrap();
        store
            .checkpoints()
            .advance_checkpoint(&checkpoint(0x20, StreamKind::Extrinsics, 200))
            .await
            .unwrap();

        // Regression is rejected.
        let result = store
            .checkpoints()
            .advance_checkpoint(&checkpoint(0x20, StreamKind::Extrinsics, 150))
            .await;
        assert!(matches!(
            result,
            Err(StorageError::CheckpointRegression { from: 200, to: 150, .. })
        ));

        let current = store
            .checkpoints()
            .get_checkpoint("kusama", &AccountId([0x20; 32]), StreamKind::Extrinsics)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.height, 200);
    }

    #[tokio::test]
    async fn checkpoint_streams_are_independent() {
        let store = store().await;
        store
            .checkpoints()
            .advance_checkpoint(&checkpoint(0x20, StreamKind::Extrinsics, 100))
            .await
            .unwrap();

        let staking = store
            .checkpoints()
            .get_checkpoint("kusama", &AccountId([0x20; 32]), StreamKind::Staking)
            .await
            .unwrap();
        assert!(staking.is_none());
    }

    #[tokio::test]
    async fn commit_batch_is_atomic() {
        let store = store().await;
        let batch = RecordBatch {
            extrinsics: vec![extrinsic(100, 2, &[0x20]), extrinsic(101, 1, &[0x20])],
            staking_events: vec![staking_event(101, 5, 0x20)],
        };
        let checkpoints = vec![
            checkpoint(0x20, StreamKind::Extrinsics, 101),
            checkpoint(0x20, StreamKind::Staking, 101),
        ];

        store.commit_batch(&batch, &checkpoints).await.unwrap();

        let records = store
            .extrinsics()
            .get_extrinsics("kusama", &AccountId([0x20; 32]), TimeRange::default())
            .await
            .unwrap();
        assert_eq!(records.len(), 2);

        let cp = store
            .checkpoints()
            .get_checkpoint("kusama", &AccountId([0x20; 32]), StreamKind::Extrinsics)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cp.height, 101);
    }

    #[tokio::test]
    async fn commit_batch_replay_yields_identical_state() {
        let store = store().await;
        let batch = RecordBatch {
            extrinsics: vec![extrinsic(100, 2, &[0x20])],
            staking_events: vec![staking_event(100, 5, 0x20)],
        };
        let checkpoints = vec![checkpoint(0x20, StreamKind::Extrinsics, 100)];

        store.commit_batch(&batch, &checkpoints).await.unwrap();
        // A crashed writer replays its suffix after restart.
        store.commit_batch(&batch, &checkpoints).await.unwrap();

        let records = store
            .extrinsics()
            .get_extrinsics("kusama", &AccountId([0x20; 32]), TimeRange::default())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);

        let staking = store
            .staking_events()
            .get_staking_events("kusama", &AccountId([0x20; 32]), TimeRange::default())
            .await
            .unwrap();
        assert_eq!(staking.len(), 1);
    }

    #[tokio::test]
    async fn time_range_excludes_null_timestamps() {
        let store = store().await;
        let mut no_ts = extrinsic(50, 1, &[0x20]);
        no_ts.block_timestamp = None;
        store
            .extrinsics()
            .upsert_extrinsics(&[no_ts, extrinsic(100, 1, &[0x20])])
            .await
            .unwrap();

        // Unbounded query returns both.
        let all = store
            .extrinsics()
            .get_extrinsics("kusama", &AccountId([0x20; 32]), TimeRange::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        // Any time bound excludes the null-timestamp row.
        let bounded = store
            .extrinsics()
            .get_extrinsics(
                "kusama",
                &AccountId([0x20; 32]),
                TimeRange {
                    from: chrono::Utc.timestamp_millis_opt(0).single(),
                    to: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(bounded.len(), 1);
        assert_eq!(bounded[0].block_height, 100);
    }

    #[tokio::test]
    async fn params_round_trip_losslessly() {
        let store = store().await;
        let mut record = extrinsic(100, 2, &[0x20]);
        record.params = serde_json::json!({
            "calls": [
                {"Staking": {"payout_stakers": {
                    "validator_stash": "0x1111",
                    "era": "2048"
                }}}
            ],
            "nested": {"deep": [1, "2", null, true]}
        });

        store
            .extrinsics()
            .upsert_extrinsics(std::slice::from_ref(&record))
            .await
            .unwrap();

        let loaded = store
            .extrinsics()
            .get_extrinsics("kusama", &AccountId([0x20; 32]), TimeRange::default())
            .await
            .unwrap();
        assert_eq!(loaded[0].params, record.params);
    }

    #[tokio::test]
    async fn delete_history_for_chain() {
        let store = store().await;
        store
            .commit_batch(
                &RecordBatch {
                    extrinsics: vec![extrinsic(100, 2, &[0x20])],
                    staking_events: vec![staking_event(100, 5, 0x20)],
                },
                &[checkpoint(0x20, StreamKind::Extrinsics, 100)],
            )
            .await
            .unwrap();

        let removed = store.delete_history("kusama", None).await.unwrap();
        assert_eq!(removed, 2);

        let cp = store
            .checkpoints()
            .get_checkpoint("kusama", &AccountId([0x20; 32]), StreamKind::Extrinsics)
            .await
            .unwrap();
        assert!(cp.is_none());
    }

    #[tokio::test]
    async fn delete_history_for_account_keeps_shared_rows() {
        let store = store().await;
        store
            .extrinsics()
            .upsert_extrinsics(&[
                extrinsic(100, 2, &[0x20, 0x21]),
                extrinsic(101, 1, &[0x20]),
            ])
            .await
            .unwrap();

        let removed = store
            .delete_history("kusama", Some(&AccountId([0x20; 32])))
            .await
            .unwrap();
        // Only the row that pertained exclusively to 0x20 is gone.
        assert_eq!(removed, 1);

        let other = store
            .extrinsics()
            .get_extrinsics("kusama", &AccountId([0x21; 32]), TimeRange::default())
            .await
            .unwrap();
        assert_eq!(other.len(), 1);
        assert_eq!(
            other[0].matched,
            BTreeSet::from([AccountId([0x21; 32])])
        );

        let gone = store
            .extrinsics()
            .get_extrinsics("kusama", &AccountId([0x20; 32]), TimeRange::default())
            .await
            .unwrap();
        assert!(gone.is_empty());
    }

    #[tokio::test]
    async fn records_ordered_by_height_and_index() {
        let store = store().await;
        store
            .extrinsics()
            .upsert_extrinsics(&[
                extrinsic(101, 3, &[0x20]),
                extrinsic(100, 2, &[0x20]),
                extrinsic(101, 1, &[0x20]),
            ])
            .await
            .unwrap();

        let records = store
            .extrinsics()
            .get_extrinsics("kusama", &AccountId([0x20; 32]), TimeRange::default())
            .await
            .unwrap();
        let keys: Vec<(u64, u32)> = records
            .iter()
            .map(|r| (r.block_height, r.extrinsic_index))
            .collect();
        assert_eq!(keys, vec![(100, 2), (101, 1), (101, 3)]);
    }
}
