//! Core domain layer for the watchtower indexer.
//!
//! This crate contains the domain models, port traits (interfaces), and
//! business logic for scanning Substrate chains on behalf of watched
//! portfolio accounts. It follows hexagonal architecture principles -
//! this is the innermost layer with no dependencies on infrastructure.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   watchtower (binary)                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │        watchtower-session        │   watchtower-substrate   │
//! │  (writer, controller, protocol)  │         (RPC)            │
//! ├──────────────────────────────────┴──────────────────────────┤
//! │                     watchtower-storage                      │
//! │                        (SQLite)                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  watchtower-core  ← YOU ARE HERE            │
//! │        (models, ports, classifier, filter, worker)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`models`] - Domain models (records, checkpoints, chains)
//! - [`ports`] - Interface traits for adapters to implement
//! - [`classify`] - Extrinsic classification and fee computation
//! - [`filter`] - Watched-address matching
//! - [`services`] - The per-stream indexer worker
//! - [`error`] - Layered error types
//! - [`metrics`] - Prometheus metrics definitions
//!
//! # Data flow
//!
//! 1. The worker plans a block range from durable checkpoints
//! 2. Block fetches fan out over a bounded pool and re-order by height
//! 3. Each extrinsic is classified and matched against watched accounts
//! 4. Matched records flow over a bounded channel to the session writer
//! 5. Heartbeat markers let the writer commit records and checkpoints
//!    in one transaction

pub mod classify;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod models;
pub mod ports;
pub mod services;
