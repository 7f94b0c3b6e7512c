//! Port trait for chain data access.
//!
//! This trait defines the interface for fetching historical blocks and
//! events from a Substrate chain by height. Implementations live in the
//! infrastructure layer (e.g., `watchtower-substrate`).

use async_trait::async_trait;

use crate::error::ChainResult;
use crate::models::{AccountId, BlockHash};

// =============================================================================
// Raw chain data
// =============================================================================

/// Raw block data from the chain before domain transformation.
///
/// Extrinsics are ordered by their in-block index.
#[derive(Debug, Clone)]
pub struct RawBlock {
    /// Block height.
    pub height: u64,
    /// Block hash.
    pub hash: BlockHash,
    /// Parent hash.
    pub parent_hash: BlockHash,
    /// Milliseconds since epoch from the index-0 `Timestamp.set`
    /// inherent; `None` when the block carries no timestamp inherent.
    pub timestamp_ms: Option<u64>,
    /// Decoded extrinsics, in index order.
    pub extrinsics: Vec<RawExtrinsic>,
}

/// Raw extrinsic data.
#[derive(Debug, Clone)]
pub struct RawExtrinsic {
    /// Index in block.
    pub index: u32,
    /// Decoded pallet name.
    pub pallet: String,
    /// Decoded call name.
    pub call: String,
    /// Signer (if signed).
    pub signer: Option<AccountId>,
    /// Arguments as a JSON tree. Account ids appear as 0x-hex strings,
    /// amounts as decimal strings.
    pub args: serde_json::Value,
    /// Success flag, derived from `System.ExtrinsicSuccess`/`Failed`.
    pub success: bool,
    /// Tip in planck units, if signed.
    pub tip: Option<u128>,
}

/// Raw event data.
#[derive(Debug, Clone)]
pub struct RawEvent {
    /// Index in block.
    pub index: u32,
    /// Index of the extrinsic this event belongs to; `None` for
    /// initialization/finalization-phase events.
    pub extrinsic_index: Option<u32>,
    /// Pallet name.
    pub pallet: String,
    /// Event variant name.
    pub name: String,
    /// Event data as a JSON tree, same conventions as extrinsic args.
    pub data: serde_json::Value,
}

/// A block together with its events, as consumed by the worker's
/// classify stage.
#[derive(Debug, Clone)]
pub struct BlockBundle {
    pub block: RawBlock,
    pub events: Vec<RawEvent>,
}

impl BlockBundle {
    /// Events belonging to the extrinsic at `index`.
    pub fn events_for(&self, index: u32) -> impl Iterator<Item = &RawEvent> {
        self.events
            .iter()
            .filter(move |e| e.extrinsic_index == Some(index))
    }
}

// =============================================================================
// Port trait
// =============================================================================

/// Port trait for chain data access.
///
/// Every call is independently retryable; the implementation owns its
/// connection bound and request limiter, so callers may fan out freely.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Genesis hash of the connected chain.
    async fn genesis_hash(&self) -> ChainResult<BlockHash>;

    /// Current best block height.
    async fn head_height(&self) -> ChainResult<u64>;

    /// Hash of the block at `height`. Implementations cache this.
    async fn hash_at(&self, height: u64) -> ChainResult<BlockHash>;

    /// Header and ordered extrinsics of the block at `height`.
    async fn block_at(&self, height: u64) -> ChainResult<RawBlock>;

    /// Events of the block at `height`, grouped by extrinsic index.
    async fn events_at(&self, height: u64) -> ChainResult<Vec<RawEvent>>;

    /// Best-effort height at which `pubkey` first existed on chain.
    /// `None` when the chain cannot answer cheaply.
    async fn account_creation_height(&self, pubkey: &AccountId) -> ChainResult<Option<u64>>;
}
