//! Session-level errors and their wire-code mapping.

use thiserror::Error;

use crate::protocol::ErrorCode;
use watchtower_core::error::{ChainError, StorageError};

/// Errors surfaced while serving one client session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Malformed or out-of-order client command.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The requested chain is not configured on this server.
    #[error("unknown chain: {0}")]
    UnknownChain(String),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// WebSocket transport failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::BadRequest(_) | SessionError::UnknownChain(_) => ErrorCode::BadRequest,
            SessionError::Chain(e) if e.is_transient() => ErrorCode::RpcTransient,
            SessionError::Chain(_) => ErrorCode::RpcProtocol,
            SessionError::Storage(_) => ErrorCode::Storage,
            SessionError::Transport(_) => ErrorCode::Unknown,
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
