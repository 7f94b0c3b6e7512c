//! Row conversion helpers shared by the repositories.

use std::collections::BTreeSet;

use watchtower_core::error::{StorageError, StorageResult};
use watchtower_core::models::{AccountId, StreamKind};

/// Convert a BLOB column into a fixed 32-byte array, naming the column
/// in the error.
pub(crate) fn bytes_to_hash32(bytes: Vec<u8>, column: &str) -> StorageResult<[u8; 32]> {
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        StorageError::SerializationError(format!(
            "{column}: expected 32 bytes, got {}",
            bytes.len()
        ))
    })
}

/// Serialize a matched-account set as a sorted JSON array of hex
/// strings. Sorted so the union upsert stays deterministic.
pub(crate) fn matched_to_json(matched: &BTreeSet<AccountId>) -> String {
    let hexes: Vec<String> = matched.iter().map(|a| a.to_hex()).collect();
    serde_json::to_string(&hexes).unwrap_or_else(|_| "[]".to_string())
}

/// Parse a matched-account JSON array back into a set.
pub(crate) fn matched_from_json(raw: &str) -> StorageResult<BTreeSet<AccountId>> {
    let hexes: Vec<String> = serde_json::from_str(raw)
        .map_err(|e| StorageError::SerializationError(format!("matched: {e}")))?;
    hexes
        .iter()
        .map(|h| {
            AccountId::from_hex(h)
                .map_err(|e| StorageError::SerializationError(format!("matched entry: {e}")))
        })
        .collect()
}

/// Parse a decimal TEXT amount column.
pub(crate) fn parse_u128(raw: &str, column: &str) -> StorageResult<u128> {
    raw.parse()
        .map_err(|e| StorageError::SerializationError(format!("{column}: {e}")))
}

/// Parse the stream column.
pub(crate) fn parse_stream(raw: &str) -> StorageResult<StreamKind> {
    match raw {
        "extrinsics" => Ok(StreamKind::Extrinsics),
        "staking" => Ok(StreamKind::Staking),
        other => Err(StorageError::SerializationError(format!(
            "unknown stream: {other}"
        ))),
    }
}
