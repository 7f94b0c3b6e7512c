//! Error types for the indexer domain layer.
//!
//! This module defines a hierarchy of error types:
//!
//! - [`ChainError`] - Node RPC and decode errors, split by retryability
//! - [`StorageError`] - Database/repository errors
//! - [`WorkerError`] - Per-worker pipeline errors
//!
//! Error conversion is automatic via `From` implementations,
//! allowing `?` to work across error boundaries.

use thiserror::Error;

// =============================================================================
// Chain Errors
// =============================================================================

/// Node RPC and decode errors.
///
/// The variant determines the retry policy: `Transient` is retried with
/// backoff, `Protocol` gets a single retry, `NotFound` on a finalised
/// height is fatal to the worker.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Network-level failure (connect, reset, timeout). Retryable.
    #[error("Transient RPC error: {0}")]
    Transient(String),

    /// The node answered with an unexpected shape, or a block-level
    /// decode failed.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A block is missing at a height the chain reports as existing.
    #[error("Block not found at height {0}")]
    NotFound(u64),

    /// An RPC call exceeded its deadline. Escalates to the transient
    /// retry path.
    #[error("RPC timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl ChainError {
    /// Whether the worker retry loop should keep trying.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Transient(_) | ChainError::Timeout(_))
    }
}

// =============================================================================
// Storage Errors
// =============================================================================

/// Database and repository errors.
///
/// Any storage error is fatal to the session that owns the writer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Failed to open or create the database file.
    #[error("Database connection error: {0}")]
    ConnectionError(String),

    /// SQL execution failed.
    #[error("Query execution error: {0}")]
    QueryError(String),

    /// Requested record was not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Constraint violation other than an idempotent duplicate.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// A checkpoint advance would move backwards.
    #[error("Checkpoint regression for {chain}/{stream}: {from} -> {to}")]
    CheckpointRegression {
        chain: String,
        stream: String,
        from: u64,
        to: u64,
    },

    /// Schema migration failed or the on-disk version is ahead of us.
    #[error("Migration error: {0}")]
    MigrationError(String),

    /// Transaction commit/rollback failed.
    #[error("Transaction error: {0}")]
    TransactionError(String),

    /// Data serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

// =============================================================================
// Worker Errors
// =============================================================================

/// Per-worker pipeline errors.
///
/// This is the error type a worker task resolves with; the controller
/// decides whether it pauses the worker (retries exhausted) or tears the
/// session down (storage).
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Chain access error that survived the retry policy.
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    /// Storage error surfaced through the writer channel.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Transient retries exhausted for one height. The worker pauses at
    /// its last good checkpoint; not fatal to the session.
    #[error("Retries exhausted at height {height} after {attempts} attempts: {last}")]
    RetriesExhausted {
        height: u64,
        attempts: u32,
        last: String,
    },

    /// The worker was cancelled. Control flow, never surfaced to the
    /// client as an error.
    #[error("Worker cancelled")]
    Cancelled,

    /// The writer channel closed underneath the worker.
    #[error("Writer channel closed")]
    WriterGone,

    /// An internal invariant was violated.
    #[error("Fatal worker error: {0}")]
    Fatal(String),
}

impl WorkerError {
    /// Errors that pause the worker rather than killing the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, WorkerError::RetriesExhausted { .. })
    }
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_conversion_chain() {
        let chain_err = ChainError::Transient("connection reset".into());
        let worker_err: WorkerError = chain_err.into();
        assert!(worker_err.to_string().contains("connection reset"));

        let storage_err = StorageError::QueryError("db failed".into());
        let worker_err: WorkerError = storage_err.into();
        assert!(worker_err.to_string().contains("db failed"));
    }

    #[test]
    fn transient_classification() {
        assert!(ChainError::Transient("reset".into()).is_transient());
        assert!(ChainError::Timeout(std::time::Duration::from_secs(15)).is_transient());
        assert!(!ChainError::Protocol("bad shape".into()).is_transient());
        assert!(!ChainError::NotFound(100).is_transient());
    }

    #[test]
    fn checkpoint_regression_includes_heights() {
        let err = StorageError::CheckpointRegression {
            chain: "kusama".into(),
            stream: "extrinsics".into(),
            from: 200,
            to: 100,
        };
        let msg = err.to_string();
        assert!(msg.contains("200") && msg.contains("100"));
    }

    #[test]
    fn retries_exhausted_is_recoverable() {
        let err = WorkerError::RetriesExhausted {
            height: 1000,
            attempts: 5,
            last: "timed out".into(),
        };
        assert!(err.is_recoverable());
        assert!(!WorkerError::Cancelled.is_recoverable());
    }
}
