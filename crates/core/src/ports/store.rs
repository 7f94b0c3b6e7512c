//! Port traits for the record store.
//!
//! These traits define the storage interface used by the writer and the
//! query paths. Implementations live in the infrastructure layer
//! (e.g., `watchtower-storage`).

use async_trait::async_trait;

use crate::error::StorageResult;
use crate::models::{
    AccountId, Checkpoint, ExtrinsicRecord, RecordBatch, StakingEventRecord, StreamKind, TimeRange,
};

// =============================================================================
// Per-table traits
// =============================================================================

/// Store for matched extrinsics.
#[async_trait]
pub trait ExtrinsicStore: Send + Sync {
    /// Insert records idempotently. On a primary-key conflict the row is
    /// kept and `matched` becomes the set union of both sides.
    async fn upsert_extrinsics(&self, records: &[ExtrinsicRecord]) -> StorageResult<()>;

    /// Records matching `pubkey` within `range`, ascending by
    /// (height, extrinsic_index). Rows with a null timestamp are
    /// excluded whenever a time bound is present.
    async fn get_extrinsics(
        &self,
        chain: &str,
        pubkey: &AccountId,
        range: TimeRange,
    ) -> StorageResult<Vec<ExtrinsicRecord>>;
}

/// Store for staking events.
#[async_trait]
pub trait StakingEventStore: Send + Sync {
    /// Insert records idempotently; re-insertion is a no-op.
    async fn upsert_staking_events(&self, records: &[StakingEventRecord]) -> StorageResult<()>;

    /// Events benefiting `pubkey`, ascending by
    /// (height, extrinsic_index, event_index).
    async fn get_staking_events(
        &self,
        chain: &str,
        pubkey: &AccountId,
        range: TimeRange,
    ) -> StorageResult<Vec<StakingEventRecord>>;
}

/// Store for scan checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Current checkpoint for one (chain, pubkey, stream) triple.
    async fn get_checkpoint(
        &self,
        chain: &str,
        pubkey: &AccountId,
        stream: StreamKind,
    ) -> StorageResult<Option<Checkpoint>>;

    /// Advance a checkpoint. Monotone: a height below the stored one is
    /// rejected with [`crate::error::StorageError::CheckpointRegression`].
    async fn advance_checkpoint(&self, checkpoint: &Checkpoint) -> StorageResult<()>;
}

// =============================================================================
// Composite store
// =============================================================================

/// Combined store access for one session's writer.
///
/// `commit_batch` is the only write path the writer uses during normal
/// operation: records and the checkpoints covering them land in a single
/// transaction, so a crash can leave checkpoints behind the data but
/// never ahead of it.
#[async_trait]
pub trait Store: Send + Sync {
    fn extrinsics(&self) -> &dyn ExtrinsicStore;

    fn staking_events(&self) -> &dyn StakingEventStore;

    fn checkpoints(&self) -> &dyn CheckpointStore;

    /// Persist a record batch and advance checkpoints atomically.
    ///
    /// `checkpoints` may be empty (records-only flush: checkpoints stay
    /// behind the data). Every checkpoint must cover all records in
    /// `batch` for its stream, which the writer guarantees by pairing
    /// heartbeat markers with the batches preceding them.
    async fn commit_batch(
        &self,
        batch: &RecordBatch,
        checkpoints: &[Checkpoint],
    ) -> StorageResult<()>;

    /// Delete all history for `chain`, or only for `pubkey` when given.
    /// Checkpoints are reset alongside. Returns the number of record
    /// rows removed.
    async fn delete_history(
        &self,
        chain: &str,
        pubkey: Option<&AccountId>,
    ) -> StorageResult<u64>;
}
