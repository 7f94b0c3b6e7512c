//! Domain models for indexed portfolio data.
//!
//! These models are storage-agnostic and represent the canonical
//! form of matched chain data within the domain layer. Addresses are
//! carried as raw 32-byte public keys everywhere; SS58 strings are
//! converted at session ingress and never stored.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// 32-byte Hash Types
// =============================================================================

/// Macro to generate 32-byte newtypes with common functionality.
///
/// Generates:
/// - `from_hex()` - Parse from hex string (with or without 0x prefix)
/// - `to_hex()` - Convert to 0x-prefixed hex string
/// - `Display` trait implementation
/// - `From<[u8; 32]>` implementation
macro_rules! hash32_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// Parse from hex string (with or without 0x prefix).
            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let s = s.strip_prefix("0x").unwrap_or(s);
                let bytes = hex::decode(s)?;
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| hex::FromHexError::InvalidStringLength)?;
                Ok(Self(arr))
            }

            /// Convert to 0x-prefixed hex string.
            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(self.0))
            }

            /// Get the inner bytes.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        // Hex on the wire and in JSON blobs, not a 32-element array.
        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

hash32_newtype!(
    /// 32-byte block hash (Blake2-256).
    BlockHash
);

hash32_newtype!(
    /// 32-byte account identifier (SS58-decoded public key).
    AccountId
);

// =============================================================================
// Chains
// =============================================================================

/// Static description of a Substrate chain the indexer can track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSpec {
    /// Chain identifier (`kusama`, `polkadot`, ...). Used as the `chain`
    /// column in every persisted row.
    pub id: String,
    /// Genesis hash, when known in advance. Verified against the node at
    /// connection time when present.
    pub genesis_hash: Option<BlockHash>,
    /// Native token decimals.
    pub token_decimals: u8,
    /// SS58 address prefix.
    pub ss58_prefix: u16,
    /// Blocks behind the head treated as immutable. Zero accepts the
    /// node's best head at the operator's own risk.
    pub finality_depth: u64,
}

impl ChainSpec {
    pub fn kusama() -> Self {
        Self {
            id: "kusama".to_string(),
            genesis_hash: BlockHash::from_hex(
                "0xb0a8d493285c2df73290dfb7e61f870f17b41801197a149ca93654499ea3dafe",
            )
            .ok(),
            token_decimals: 12,
            ss58_prefix: 2,
            finality_depth: 10,
        }
    }

    pub fn polkadot() -> Self {
        Self {
            id: "polkadot".to_string(),
            genesis_hash: BlockHash::from_hex(
                "0x91b171bb158e2d3848fa23a9f1c25182fb8e20313b2c1eb49219da7a70ce90c3",
            )
            .ok(),
            token_decimals: 10,
            ss58_prefix: 0,
            finality_depth: 10,
        }
    }

    /// Look up a built-in preset by identifier.
    pub fn preset(id: &str) -> Option<Self> {
        match id {
            "kusama" => Some(Self::kusama()),
            "polkadot" => Some(Self::polkadot()),
            _ => None,
        }
    }
}

/// First Kusama block with consistent staking events (runtime spec 1050).
/// Staking-stream plans clamp their start to this height.
pub const KUSAMA_STAKING_EVENTS_START: u64 = 1_375_086;

// =============================================================================
// Watched Accounts & Streams
// =============================================================================

/// An account a session is tracking on one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedAccount {
    /// Canonical 32-byte public key.
    pub pubkey: AccountId,
    /// Optional human label, for progress reporting only.
    pub label: Option<String>,
    /// Block to start scanning from. When absent the plan falls back to
    /// the account creation block if discoverable, else genesis.
    pub start_block: Option<u64>,
}

impl WatchedAccount {
    pub fn new(pubkey: AccountId) -> Self {
        Self {
            pubkey,
            label: None,
            start_block: None,
        }
    }
}

/// The two record streams a worker can produce. Each (chain, pubkey,
/// stream) triple owns an independent checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Extrinsics,
    Staking,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Extrinsics => "extrinsics",
            StreamKind::Staking => "staking",
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Records
// =============================================================================

/// A matched extrinsic, uniquely keyed by (chain, block_height,
/// extrinsic_index).
///
/// `params` preserves the full decoded argument tree, including nested
/// batch calls, and must round-trip losslessly through storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtrinsicRecord {
    pub chain: String,
    pub block_height: u64,
    pub extrinsic_index: u32,
    pub block_hash: BlockHash,
    /// Timestamp from the index-0 `Timestamp.set` inherent; absent when
    /// the block carries none. Time-range queries exclude null timestamps.
    pub block_timestamp: Option<DateTime<Utc>>,
    /// Signer public key; `None` for inherents and unsigned extrinsics.
    pub signer: Option<AccountId>,
    pub call_module: String,
    pub call_function: String,
    pub success: bool,
    /// Tip in planck units.
    pub tip: u128,
    /// Computed fee in planck units; `None` means unknown, never zero.
    pub fee: Option<u128>,
    /// Full decoded argument tree.
    pub params: serde_json::Value,
    /// Watched public keys this record pertains to.
    pub matched: BTreeSet<AccountId>,
}

/// A staking event attributed to a beneficiary, uniquely keyed by
/// (chain, block_height, extrinsic_index, event_index).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakingEventRecord {
    pub chain: String,
    pub block_height: u64,
    pub extrinsic_index: u32,
    pub event_index: u32,
    pub module: String,
    /// Event variant (`Reward`, `Bonded`, `Unbonded`, `Nominated`,
    /// `Slashed`, ...).
    pub event_id: String,
    pub beneficiary: AccountId,
    /// Amount in planck units. Persisted as a decimal string.
    pub amount: u128,
    /// Era, when resolvable from the enclosing call.
    pub era: Option<u32>,
    /// Validator stash, when derivable from the enclosing call.
    pub validator_stash: Option<AccountId>,
}

/// A batch of records produced by one worker for a contiguous run of
/// blocks, in ascending (height, extrinsic_index, event_index) order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordBatch {
    pub extrinsics: Vec<ExtrinsicRecord>,
    pub staking_events: Vec<StakingEventRecord>,
}

impl RecordBatch {
    pub fn is_empty(&self) -> bool {
        self.extrinsics.is_empty() && self.staking_events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.extrinsics.len() + self.staking_events.len()
    }
}

// =============================================================================
// Checkpoints
// =============================================================================

/// Durable scan position for one (chain, pubkey, stream) triple.
///
/// Invariant: every matching record at heights <= `height` is committed.
/// Advances are monotone; the store rejects regressions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub chain: String,
    pub pubkey: AccountId,
    pub stream: StreamKind,
    pub height: u64,
}

// =============================================================================
// Queries
// =============================================================================

/// Time window for record reads. `None` bounds are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_hash_hex_roundtrip() {
        let hex = "0x1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef";
        let hash = BlockHash::from_hex(hex).unwrap();
        assert_eq!(hash.to_hex(), hex);
    }

    #[test]
    fn account_id_without_prefix() {
        let hex = "203066b0a657bdbdbe9974c20a2644881f384f9b206c7c394054c0d411d7bc6e";
        let account = AccountId::from_hex(hex).unwrap();
        assert_eq!(account.to_hex(), format!("0x{}", hex));
    }

    #[test]
    fn hash32_invalid_length() {
        assert!(BlockHash::from_hex("0x1234").is_err());
    }

    #[test]
    fn chain_presets() {
        let kusama = ChainSpec::preset("kusama").unwrap();
        assert_eq!(kusama.ss58_prefix, 2);
        assert_eq!(kusama.token_decimals, 12);
        assert!(kusama.genesis_hash.is_some());

        let polkadot = ChainSpec::preset("polkadot").unwrap();
        assert_eq!(polkadot.ss58_prefix, 0);

        assert!(ChainSpec::preset("acala").is_none());
    }

    #[test]
    fn stream_kind_display() {
        assert_eq!(StreamKind::Extrinsics.to_string(), "extrinsics");
        assert_eq!(StreamKind::Staking.to_string(), "staking");
    }
}
