//! Wire protocol between clients and the session controller.
//!
//! Messages travel as JSON envelopes `{type, session_id, payload,
//! request_id?}` over a bidirectional WebSocket. Every client command
//! is answered with an `ack` carrying the originating request id;
//! progress, checkpoints, records and errors stream server-to-client.

use serde::{Deserialize, Serialize};

use watchtower_core::models::{ExtrinsicRecord, StakingEventRecord, StreamKind};
use watchtower_core::services::WorkerState;

// =============================================================================
// Client-to-server
// =============================================================================

/// One watched account as submitted by the client. The address may be
/// SS58 or 0x-hex; it is converted to a public key at ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSpec {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_block: Option<u64>,
}

/// Optional time bounds (unix milliseconds) on a record query.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueryRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_ms: Option<i64>,
}

/// Commands a client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientCommand {
    Attach {
        chain: String,
        accounts: Vec<AccountSpec>,
    },
    Detach,
    Pause,
    Resume,
    Stop,
    AddAccount {
        chain: String,
        address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_block: Option<u64>,
    },
    RemoveAccount {
        chain: String,
        address: String,
    },
    QueryExtrinsics {
        chain: String,
        address: String,
        #[serde(default)]
        range: QueryRange,
    },
    QueryStaking {
        chain: String,
        address: String,
        #[serde(default)]
        range: QueryRange,
    },
    Status,
    ResetHistory {
        chain: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
}

/// Client envelope: command plus correlation fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    #[serde(flatten)]
    pub command: ClientCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

// =============================================================================
// Server-to-client
// =============================================================================

/// Wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "E_RPC_TRANSIENT")]
    RpcTransient,
    #[serde(rename = "E_RPC_PROTOCOL")]
    RpcProtocol,
    #[serde(rename = "E_DECODE")]
    Decode,
    #[serde(rename = "E_STORAGE")]
    Storage,
    #[serde(rename = "E_CANCELLED")]
    Cancelled,
    #[serde(rename = "E_BAD_REQUEST")]
    BadRequest,
    #[serde(rename = "E_UNKNOWN")]
    Unknown,
}

/// Query results, typed per stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordsBatch {
    Extrinsics(Vec<ExtrinsicRecord>),
    Staking(Vec<StakingEventRecord>),
}

/// Per-(account, stream) progress snapshot returned by `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEntry {
    pub account: String,
    pub stream: StreamKind,
    pub state: WorkerState,
    pub last_checkpoint: Option<u64>,
    pub target_height: u64,
    pub rate_blocks_per_sec: f64,
    pub in_flight: usize,
    pub errors_last_5m: usize,
}

/// Events the server pushes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    Progress {
        account: String,
        stream: StreamKind,
        height: u64,
        target: u64,
        rate: f64,
    },
    Checkpoint {
        account: String,
        stream: StreamKind,
        height: u64,
    },
    Error {
        code: ErrorCode,
        message: String,
        fatal: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<serde_json::Value>,
    },
    Records {
        stream: StreamKind,
        batch: RecordsBatch,
    },
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
}

/// Server envelope: event plus the owning session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEnvelope {
    #[serde(flatten)]
    pub event: ServerEvent,
    pub session_id: String,
}

// =============================================================================
// Tests
// =============================================================================
