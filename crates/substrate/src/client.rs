//! Node access for historical scans.
//!
//! Historical block access by height: the legacy RPC resolves heights
//! to hashes (cached process-wide), and the blocks API decodes bodies
//! and events dynamically, so no static runtime metadata is baked in.
//! A connection semaphore and a token bucket keep fan-out from the
//! worker pools within the node's comfort zone; bursts queue instead of
//! being rejected.

use std::num::NonZeroU32;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use moka::sync::Cache;
use subxt::backend::legacy::LegacyRpcMethods;
use subxt::backend::rpc::RpcClient;
use subxt::utils::H256;
use subxt::{OnlineClient, PolkadotConfig};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, instrument, trace};

use watchtower_core::error::{ChainError, ChainResult};
use watchtower_core::metrics::record_decode_error;
use watchtower_core::models::{AccountId, BlockHash, ChainSpec};
use watchtower_core::ports::{ChainClient, RawBlock, RawEvent, RawExtrinsic};

type SubstrateBlock = subxt::blocks::Block<PolkadotConfig, OnlineClient<PolkadotConfig>>;

/// Configuration for the Substrate client.
#[derive(Debug, Clone)]
pub struct SubstrateClientConfig {
    /// WebSocket URL (e.g., "wss://kusama-rpc.polkadot.io").
    pub ws_url: String,
    /// Concurrent in-flight RPC requests.
    pub max_concurrent_requests: usize,
    /// Token-bucket refill rate. Bursts beyond it queue.
    pub requests_per_second: u32,
    /// Deadline for a single RPC call.
    pub rpc_timeout: Duration,
}

impl Default for SubstrateClientConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:9944".to_string(),
            max_concurrent_requests: 16,
            requests_per_second: 50,
            rpc_timeout: Duration::from_secs(15),
        }
    }
}

/// Process-wide hash-by-height cache, shared by every client so
/// overlapping sessions on the same chain do not re-resolve heights.
fn hash_cache() -> &'static Cache<(String, u64), BlockHash> {
    static CACHE: OnceLock<Cache<(String, u64), BlockHash>> = OnceLock::new();
    CACHE.get_or_init(|| Cache::new(64 * 1024))
}

/// Substrate client adapter implementing the [`ChainClient`] port.
pub struct SubstrateClient {
    chain: ChainSpec,
    client: OnlineClient<PolkadotConfig>,
    rpc: LegacyRpcMethods<PolkadotConfig>,
    permits: Semaphore,
    limiter: DefaultDirectRateLimiter,
    rpc_timeout: Duration,
}

impl SubstrateClient {
    /// Connect to a node and verify it serves the expected chain.
    #[instrument(skip_all, fields(chain = %chain.id, url = %config.ws_url))]
    pub async fn connect(chain: ChainSpec, config: SubstrateClientConfig) -> ChainResult<Self> {
        debug!("Connecting to node");

        let rpc_client = RpcClient::from_url(&config.ws_url)
            .await
            .map_err(|e| ChainError::Transient(e.to_string()))?;
        let rpc = LegacyRpcMethods::<PolkadotConfig>::new(rpc_client.clone());
        let client = OnlineClient::<PolkadotConfig>::from_rpc_client(rpc_client)
            .await
            .map_err(|e| ChainError::Transient(e.to_string()))?;

        let connected_genesis = BlockHash(client.genesis_hash().0);
        if let Some(expected) = &chain.genesis_hash {
            if expected != &connected_genesis {
                return Err(ChainError::Protocol(format!(
                    "node serves genesis {connected_genesis}, expected {expected} for {}",
                    chain.id
                )));
            }
        }

        debug!(genesis = %connected_genesis, "Connected");

        Ok(Self {
            chain,
            client,
            rpc,
            permits: Semaphore::new(config.max_concurrent_requests),
            limiter: RateLimiter::direct(Quota::per_second(
                NonZeroU32::new(config.requests_per_second.max(1)).expect("non-zero"),
            )),
            rpc_timeout: config.rpc_timeout,
        })
    }

    /// Acquire a connection permit and wait out the token bucket.
    async fn throttle(&self) -> ChainResult<SemaphorePermit<'_>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ChainError::Transient("connection pool closed".into()))?;
        self.limiter.until_ready().await;
        Ok(permit)
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, subxt::Error>>,
    ) -> ChainResult<T> {
        match tokio::time::timeout(self.rpc_timeout, fut).await {
            Ok(result) => result.map_err(chain_error),
            Err(_) => Err(ChainError::Timeout(self.rpc_timeout)),
        }
    }

    async fn block_by_hash(&self, hash: &BlockHash) -> ChainResult<SubstrateBlock> {
        self.with_timeout(self.client.blocks().at(H256(hash.0))).await
    }

    /// Whether `pubkey` had a `System.Account` entry at `hash`.
    async fn account_exists_at(&self, pubkey: &AccountId, hash: &BlockHash) -> ChainResult<bool> {
        let _permit = self.throttle().await?;
        let address = subxt::dynamic::storage(
            "System",
            "Account",
            vec![subxt::dynamic::Value::from_bytes(pubkey.0)],
        );
        let storage = self
            .with_timeout(self.client.storage().at(H256(hash.0)).fetch(&address))
            .await?;
        Ok(storage.is_some())
    }
}

#[async_trait]
impl ChainClient for SubstrateClient {
    async fn genesis_hash(&self) -> ChainResult<BlockHash> {
        Ok(BlockHash(self.client.genesis_hash().0))
    }

    async fn head_height(&self) -> ChainResult<u64> {
        let _permit = self.throttle().await?;
        let header = self
            .with_timeout(self.rpc.chain_get_header(None))
            .await?
            .ok_or_else(|| ChainError::Protocol("node returned no head header".into()))?;
        Ok(header.number as u64)
    }

    async fn hash_at(&self, height: u64) -> ChainResult<BlockHash> {
        let key = (self.chain.id.clone(), height);
        if let Some(hash) = hash_cache().get(&key) {
            return Ok(hash);
        }

        let _permit = self.throttle().await?;
        let hash = self
            .with_timeout(self.rpc.chain_get_block_hash(Some(height.into())))
            .await?
            .ok_or(ChainError::NotFound(height))?;
        let hash = BlockHash(hash.0);

        hash_cache().insert(key, hash.clone());
        Ok(hash)
    }

    async fn block_at(&self, height: u64) -> ChainResult<RawBlock> {
        let hash = self.hash_at(height).await?;
        let _permit = self.throttle().await?;

        let block = self.block_by_hash(&hash).await?;
        let parent_hash = BlockHash(block.header().parent_hash.0);
        let extrinsics = decode_extrinsics(&self.chain.id, &block).await?;
        let timestamp_ms = block_timestamp(&extrinsics);

        Ok(RawBlock {
            height,
            hash,
            parent_hash,
            timestamp_ms,
            extrinsics,
        })
    }

    async fn events_at(&self, height: u64) -> ChainResult<Vec<RawEvent>> {
        let hash = self.hash_at(height).await?;
        let _permit = self.throttle().await?;

        let block = self.block_by_hash(&hash).await?;
        decode_events(&self.chain.id, &block).await
    }

    /// Best-effort binary search for the first block where the account
    /// exists. Requires an archive node; any probe failure degrades to
    /// `None` rather than blocking planning.
    async fn account_creation_height(&self, pubkey: &AccountId) -> ChainResult<Option<u64>> {
        let head = match self.head_height().await {
            Ok(head) => head,
            Err(_) => return Ok(None),
        };

        let head_hash = self.hash_at(head).await?;
        match self.account_exists_at(pubkey, &head_hash).await {
            Ok(true) => {}
            // Not on chain at the head, or the node cannot answer.
            Ok(false) | Err(_) => return Ok(None),
        }

        let mut low = 0u64;
        let mut high = head;
        while low < high {
            let mid = low + (high - low) / 2;
            let hash = match self.hash_at(mid).await {
                Ok(hash) => hash,
                Err(_) => return Ok(None),
            };
            match self.account_exists_at(pubkey, &hash).await {
                Ok(true) => high = mid,
                Ok(false) => low = mid + 1,
                Err(_) => return Ok(None),
            }
        }

        trace!(pubkey = %pubkey, height = low, "account creation height resolved");
        Ok(Some(low))
    }
}

/// Map a subxt error into the retry taxonomy: RPC/transport failures
/// are transient, everything else is a protocol problem.
fn chain_error(error: subxt::Error) -> ChainError {
    match error {
        subxt::Error::Rpc(e) => ChainError::Transient(e.to_string()),
        other => ChainError::Protocol(other.to_string()),
    }
}

// =============================================================================
// Block decoding helpers
// =============================================================================

/// Decode events from a block. Per-event decode failures are counted
/// and skipped; the block proceeds.
async fn decode_events(chain: &str, block: &SubstrateBlock) -> ChainResult<Vec<RawEvent>> {
    let events = block.events().await.map_err(chain_error)?;

    let mut raw_events = Vec::new();
    for (index, event) in events.iter().enumerate() {
        match event {
            Ok(ev) => {
                let data = ev
                    .field_values()
                    .map(|composite| fields_to_json(&composite))
                    .unwrap_or(serde_json::Value::Null);

                let extrinsic_index = match ev.phase() {
                    subxt::events::Phase::ApplyExtrinsic(idx) => Some(idx),
                    _ => None,
                };

                raw_events.push(RawEvent {
                    index: index as u32,
                    extrinsic_index,
                    pallet: ev.pallet_name().to_string(),
                    name: ev.variant_name().to_string(),
                    data,
                });
            }
            Err(e) => {
                trace!(index, error = ?e, "Failed to decode event");
                record_decode_error(chain);
            }
        }
    }

    Ok(raw_events)
}

/// Decode extrinsics from a block, resolving the success flag from the
/// block's `System.ExtrinsicSuccess`/`Failed` events.
async fn decode_extrinsics(chain: &str, block: &SubstrateBlock) -> ChainResult<Vec<RawExtrinsic>> {
    let extrinsics = block.extrinsics().await.map_err(chain_error)?;
    let events = block.events().await.map_err(chain_error)?;

    let mut raw_extrinsics = Vec::new();
    for (index, ext) in extrinsics.iter().enumerate() {
        let (pallet, call) = match (ext.pallet_name(), ext.variant_name()) {
            (Ok(pallet), Ok(call)) => (pallet.to_string(), call.to_string()),
            _ => {
                trace!(index, "Failed to decode extrinsic call");
                record_decode_error(chain);
                continue;
            }
        };

        let signer = ext.address_bytes().and_then(|bytes| {
            let key = decode_signer(bytes);
            if key.is_none() {
                trace!(index, len = bytes.len(), "Unrecognized signer address shape");
            }
            key
        });

        let args = ext
            .field_values()
            .map(|composite| fields_to_json(&composite))
            .unwrap_or(serde_json::Value::Null);

        let tip = ext.signed_extensions().and_then(|se| se.tip());

        raw_extrinsics.push(RawExtrinsic {
            index: index as u32,
            pallet,
            call,
            signer,
            args,
            success: extrinsic_succeeded(&events, index as u32),
            tip,
        });
    }

    Ok(raw_extrinsics)
}

/// Pull the 32-byte key out of a signer address. `MultiAddress::Id`
/// carries a 0x00 tag before the key; bare-`AccountId32` chains give
/// the key alone.
fn decode_signer(bytes: &[u8]) -> Option<AccountId> {
    let key: &[u8] = match bytes.len() {
        32 => bytes,
        33 if bytes[0] == 0 => &bytes[1..],
        _ => return None,
    };
    let mut arr = [0u8; 32];
    arr.copy_from_slice(key);
    Some(AccountId(arr))
}

/// Resolve an extrinsic's success flag from the System events.
fn extrinsic_succeeded(events: &subxt::events::Events<PolkadotConfig>, ext_index: u32) -> bool {
    for ev in events.iter().flatten() {
        if let subxt::events::Phase::ApplyExtrinsic(idx) = ev.phase() {
            if idx == ext_index
                && ev.pallet_name() == "System"
                && ev.variant_name() == "ExtrinsicFailed"
            {
                return false;
            }
        }
    }
    true
}

/// Extract the block timestamp from the `Timestamp.set` inherent, when
/// present. Millisecond precision.
fn block_timestamp(extrinsics: &[RawExtrinsic]) -> Option<u64> {
    let inherent = extrinsics
        .iter()
        .find(|e| e.pallet == "Timestamp" && e.call == "set")?;
    let now = inherent
        .args
        .get("now")
        .or_else(|| inherent.args.get(0))?;
    let value = match now {
        serde_json::Value::String(s) => s.parse().ok()?,
        serde_json::Value::Number(n) => n.as_u64()?,
        _ => return None,
    };
    plausible_timestamp(value).then_some(value)
}

/// Sanity window for millisecond timestamps (2020..=2050), so a decode
/// gone wrong cannot masquerade as a block time.
fn plausible_timestamp(ms: u64) -> bool {
    const MIN_TIMESTAMP_MS: u64 = 1_577_836_800_000;
    const MAX_TIMESTAMP_MS: u64 = 2_524_608_000_000;
    (MIN_TIMESTAMP_MS..=MAX_TIMESTAMP_MS).contains(&ms)
}

// =============================================================================
// Dynamic value rendering
// =============================================================================

use subxt::ext::scale_value::{Composite, Primitive, Value, ValueDef};

/// Shortest all-byte tuple treated as a blob rather than a tuple of
/// small numbers. Covers hashes and account ids (32), eth-style
/// addresses (20) and signatures (64) without swallowing short tuples.
const BLOB_MIN_LEN: usize = 16;

/// Render a decoded value as JSON, preserving the conventions the
/// classifier and filter rely on:
///
/// - byte blobs collapse to 0x-hex strings
/// - integers render as decimal strings, never floats
/// - `Some(x)` flattens to `x`, `None` to null
/// - any other enum variant keeps a single-key `{name: fields}`
///   wrapper, which is what keeps `MultiAddress::Id` and nested batch
///   calls recognizable downstream
fn scale_to_json<T>(value: &Value<T>) -> serde_json::Value {
    match &value.value {
        ValueDef::Composite(fields) => fields_to_json(fields),
        ValueDef::Variant(variant) => {
            let inner = fields_to_json(&variant.values);
            match variant.name.as_str() {
                "None" => serde_json::Value::Null,
                "Some" => inner,
                name => {
                    let mut wrapper = serde_json::Map::with_capacity(1);
                    wrapper.insert(name.to_string(), inner);
                    serde_json::Value::Object(wrapper)
                }
            }
        }
        ValueDef::Primitive(Primitive::Bool(b)) => serde_json::Value::Bool(*b),
        ValueDef::Primitive(Primitive::String(s)) => serde_json::Value::String(s.clone()),
        ValueDef::Primitive(Primitive::Char(c)) => serde_json::Value::String(c.to_string()),
        ValueDef::Primitive(Primitive::U128(n)) => serde_json::Value::String(n.to_string()),
        ValueDef::Primitive(Primitive::I128(n)) => serde_json::Value::String(n.to_string()),
        ValueDef::Primitive(other) => serde_json::Value::String(format!("{other:?}")),
        ValueDef::BitSequence(bits) => serde_json::Value::String(format!("{bits:?}")),
    }
}

fn fields_to_json<T>(fields: &Composite<T>) -> serde_json::Value {
    match fields {
        Composite::Named(pairs) => serde_json::Value::Object(
            pairs
                .iter()
                .map(|(name, field)| (name.clone(), scale_to_json(field)))
                .collect(),
        ),
        Composite::Unnamed(items) => {
            if let Some(bytes) = byte_run(items) {
                return serde_json::Value::String(format!("0x{}", hex::encode(bytes)));
            }
            match items.as_slice() {
                // Newtype wrappers add nothing; keep the payload.
                [single] => scale_to_json(single),
                many => serde_json::Value::Array(many.iter().map(scale_to_json).collect()),
            }
        }
    }
}

/// Collect a tuple into raw bytes when every element is a byte-sized
/// integer and the run is long enough to be a blob.
fn byte_run<T>(items: &[Value<T>]) -> Option<Vec<u8>> {
    if items.len() < BLOB_MIN_LEN {
        return None;
    }
    items
        .iter()
        .map(|item| match &item.value {
            ValueDef::Primitive(Primitive::U128(n)) => u8::try_from(*n).ok(),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extrinsic(index: u32, pallet: &str, call: &str, args: serde_json::Value) -> RawExtrinsic {
        RawExtrinsic {
            index,
            pallet: pallet.into(),
            call: call.into(),
            signer: None,
            args,
            success: true,
            tip: None,
        }
    }

    #[test]
    fn block_timestamp_from_named_arg() {
        let extrinsics = vec![extrinsic(
            0,
            "Timestamp",
            "set",
            json!({"now": "1613727474000"}),
        )];
        assert_eq!(block_timestamp(&extrinsics), Some(1_613_727_474_000));
    }

    #[test]
    fn block_timestamp_absent_without_inherent() {
        let extrinsics = vec![extrinsic(
            0,
            "Balances",
            "transfer",
            json!({"dest": "0x00", "value": "1"}),
        )];
        assert_eq!(block_timestamp(&extrinsics), None);
    }

    #[test]
    fn block_timestamp_rejects_implausible_values() {
        let extrinsics = vec![extrinsic(0, "Timestamp", "set", json!({"now": "42"}))];
        assert_eq!(block_timestamp(&extrinsics), None);
    }

    #[test]
    fn signer_decodes_with_and_without_multiaddress_tag() {
        let key = [0xab; 32];
        assert_eq!(decode_signer(&key), Some(AccountId(key)));

        let mut tagged = vec![0u8];
        tagged.extend_from_slice(&key);
        assert_eq!(decode_signer(&tagged), Some(AccountId(key)));

        // MultiAddress::Index or truncated bytes stay unresolved.
        assert_eq!(decode_signer(&[1, 2, 3]), None);
        let mut wrong_tag = vec![2u8];
        wrong_tag.extend_from_slice(&key);
        assert_eq!(decode_signer(&wrong_tag), None);
    }

    #[test]
    fn byte_runs_collapse_to_hex() {
        let blob: Vec<Value<()>> = (0..32u8).map(|b| Value::u128(b as u128)).collect();
        let bytes = byte_run(&blob).unwrap();
        assert_eq!(bytes.len(), 32);
        assert_eq!(bytes[1], 1);

        // Short tuples and non-byte values stay structured.
        let pair: Vec<Value<()>> = vec![Value::u128(1), Value::u128(2)];
        assert!(byte_run(&pair).is_none());
        let wide: Vec<Value<()>> = (0..20).map(|_| Value::u128(400)).collect();
        assert!(byte_run(&wide).is_none());
    }

    #[test]
    fn integers_render_as_decimal_strings() {
        let value: Value<()> = Value::u128(u128::MAX);
        assert_eq!(
            scale_to_json(&value),
            serde_json::Value::String(u128::MAX.to_string())
        );
    }

    #[test]
    fn variants_keep_single_key_wrappers() {
        let address: Value<()> = Value::variant(
            "Id",
            Composite::unnamed(vec![Value::from_bytes([0xab; 32])]),
        );
        let json = scale_to_json(&address);
        let inner = json.get("Id").unwrap().as_str().unwrap();
        assert_eq!(inner, format!("0x{}", "ab".repeat(32)));

        let none: Value<()> = Value::variant("None", Composite::unnamed(vec![]));
        assert_eq!(scale_to_json(&none), serde_json::Value::Null);
    }
}
