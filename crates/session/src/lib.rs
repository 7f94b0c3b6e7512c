//! Session layer for the watchtower indexer.
//!
//! Bridges clients to the core pipeline: the WebSocket [`server`]
//! accepts connections, the [`controller`] owns each session's workers
//! and writer, the [`writer`] serializes persistence, and [`protocol`]
//! defines the wire envelopes.

pub mod controller;
pub mod error;
pub mod protocol;
pub mod server;
pub mod writer;

pub use controller::{ChainHandle, ControllerConfig, Session, SessionController};
pub use error::{SessionError, SessionResult};
pub use server::{serve, ServerConfig};
pub use writer::{DbWriter, WriterEvent, WriterHandle};
