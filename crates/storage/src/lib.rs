//! SQLite storage adapter for the watchtower indexer.
//!
//! Implements the store traits from `watchtower-core` against one
//! embedded database file per user. See [`sqlite`] for the adapter and
//! its transactional batch-commit semantics.

pub mod sqlite;

pub use sqlite::{
    Database, DatabaseConfig, SqliteCheckpointRepository, SqliteExtrinsicRepository,
    SqliteStakingRepository, SqliteStore,
};
