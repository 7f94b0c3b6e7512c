//! Port traits (interfaces) for infrastructure adapters.

mod chain_client;
mod store;

pub use chain_client::{BlockBundle, ChainClient, RawBlock, RawEvent, RawExtrinsic};
pub use store::{CheckpointStore, ExtrinsicStore, StakingEventStore, Store};
