//! Session controller - owns workers and the writer for each client.
//!
//! A controller-owned registry replaces global singletons: every
//! worker and writer reference is acquired through the session that
//! spawned it, and reclaimed when the session ends. On disconnect the
//! controller stops owned workers with a bounded deadline, after which
//! they are cancelled and detached for the runtime to reap.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::TimeZone;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use watchtower_core::models::{AccountId, ChainSpec, StreamKind, TimeRange, WatchedAccount};
use watchtower_core::ports::{ChainClient, Store};
use watchtower_core::services::{
    FatalKind, IndexerWorker, PlannedAccount, WorkerCommand, WorkerEvent, WorkerHandle,
};
use watchtower_substrate::parse_account_address;

use crate::error::{SessionError, SessionResult};
use crate::protocol::{
    AccountSpec, ClientCommand, ClientEnvelope, ErrorCode, QueryRange, RecordsBatch,
    ServerEnvelope, ServerEvent, StatusEntry,
};
use crate::writer::{DbWriter, WriterEvent, WriterHandle};

/// Sliding window for the `errors_last_5m` status figure.
const ERROR_WINDOW: Duration = Duration::from_secs(300);

// =============================================================================
// Configuration
// =============================================================================

/// Controller and worker tuning for every session this process serves.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub window_size: u64,
    pub fetch_parallelism: usize,
    pub heartbeat_blocks: u64,
    pub heartbeat_interval: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub block_timeout: Duration,
    pub poll_interval: Duration,
    /// Writer channel bound; backpressure propagates to fetch pools.
    pub writer_channel_capacity: usize,
    /// Records buffered before a marker forces a records-only flush.
    pub writer_max_buffered: usize,
    /// Graceful-stop deadline on disconnect.
    pub shutdown_deadline: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            window_size: 256,
            fetch_parallelism: 8,
            heartbeat_blocks: 64,
            heartbeat_interval: Duration::from_secs(5),
            max_retries: 5,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            block_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(12),
            writer_channel_capacity: 1024,
            writer_max_buffered: 4096,
            shutdown_deadline: Duration::from_secs(10),
        }
    }
}

impl ControllerConfig {
    fn worker_config(
        &self,
        chain: ChainSpec,
        stream: StreamKind,
    ) -> watchtower_core::services::WorkerConfig {
        let mut config = watchtower_core::services::WorkerConfig::new(chain, stream);
        config.window_size = self.window_size;
        config.fetch_parallelism = self.fetch_parallelism;
        config.heartbeat_blocks = self.heartbeat_blocks;
        config.heartbeat_interval = self.heartbeat_interval;
        config.max_retries = self.max_retries;
        config.backoff_base = self.backoff_base;
        config.backoff_cap = self.backoff_cap;
        config.block_timeout = self.block_timeout;
        config.poll_interval = self.poll_interval;
        config
    }
}

// =============================================================================
// Controller
// =============================================================================

/// One configured chain: its spec and the shared RPC client.
pub struct ChainHandle {
    pub spec: ChainSpec,
    pub client: Arc<dyn ChainClient>,
}

/// Process-wide controller. Sessions are created per connection and
/// own their workers and writer; the controller owns the chains and
/// the store.
pub struct SessionController {
    chains: HashMap<String, ChainHandle>,
    store: Arc<dyn Store>,
    config: ControllerConfig,
    next_session: AtomicU64,
}

impl SessionController {
    pub fn new(store: Arc<dyn Store>, config: ControllerConfig) -> Self {
        Self {
            chains: HashMap::new(),
            store,
            config,
            next_session: AtomicU64::new(1),
        }
    }

    /// Register a chain before serving. Not callable once shared.
    pub fn register_chain(&mut self, handle: ChainHandle) {
        info!(chain = %handle.spec.id, "chain registered");
        self.chains.insert(handle.spec.id.clone(), handle);
    }

    pub fn chain(&self, id: &str) -> Option<&ChainHandle> {
        self.chains.get(id)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Create a session bound to one client connection. Events flow
    /// out through `outbound`.
    pub fn create_session(
        self: &Arc<Self>,
        outbound: mpsc::UnboundedSender<ServerEnvelope>,
    ) -> Session {
        let id = format!("session-{}", self.next_session.fetch_add(1, Ordering::Relaxed));
        Session {
            id,
            controller: self.clone(),
            outbound,
            writer: None,
            workers: Vec::new(),
            accounts: HashMap::new(),
            errors: Arc::new(Mutex::new(VecDeque::new())),
            forwarders: Vec::new(),
        }
    }
}

// =============================================================================
// Session
// =============================================================================

struct WorkerEntry {
    chain: String,
    handle: WorkerHandle,
}

enum Dispatch {
    Ack(Option<serde_json::Value>),
    Close,
}

/// A client's owned workers, writer and configuration, bound to one
/// connection.
pub struct Session {
    id: String,
    controller: Arc<SessionController>,
    outbound: mpsc::UnboundedSender<ServerEnvelope>,
    writer: Option<WriterHandle>,
    workers: Vec<WorkerEntry>,
    accounts: HashMap<String, Vec<WatchedAccount>>,
    errors: Arc<Mutex<VecDeque<Instant>>>,
    forwarders: Vec<JoinHandle<()>>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Handle one client envelope. Returns `false` when the connection
    /// should close.
    #[instrument(skip_all, fields(session = %self.id))]
    pub async fn handle(&mut self, envelope: ClientEnvelope) -> bool {
        let request_id = envelope.request_id.clone();
        match self.dispatch(envelope.command).await {
            Ok(Dispatch::Ack(data)) => {
                self.send(ServerEvent::Ack {
                    request_id,
                    ok: true,
                    error: None,
                    data,
                });
                true
            }
            Ok(Dispatch::Close) => {
                self.send(ServerEvent::Ack {
                    request_id,
                    ok: true,
                    error: None,
                    data: None,
                });
                false
            }
            Err(e) => {
                warn!(error = %e, "command failed");
                self.send(ServerEvent::Error {
                    code: e.code(),
                    message: e.to_string(),
                    fatal: false,
                    context: None,
                });
                self.send(ServerEvent::Ack {
                    request_id,
                    ok: false,
                    error: Some(e.to_string()),
                    data: None,
                });
                true
            }
        }
    }

    /// Report an unparseable client message.
    pub fn reject(&self, message: String) {
        self.send(ServerEvent::Error {
            code: ErrorCode::BadRequest,
            message,
            fatal: false,
            context: None,
        });
    }

    async fn dispatch(&mut self, command: ClientCommand) -> SessionResult<Dispatch> {
        match command {
            ClientCommand::Attach { chain, accounts } => self.attach(&chain, accounts).await,
            ClientCommand::Detach => Ok(Dispatch::Close),
            ClientCommand::Pause => self.broadcast(WorkerCommand::Pause).await,
            ClientCommand::Resume => self.broadcast(WorkerCommand::Resume).await,
            ClientCommand::Stop => self.broadcast(WorkerCommand::Stop).await,
            ClientCommand::AddAccount {
                chain,
                address,
                label,
                start_block,
            } => {
                let spec = AccountSpec {
                    address,
                    label,
                    start_block,
                };
                self.add_account(&chain, spec).await
            }
            ClientCommand::RemoveAccount { chain, address } => {
                self.remove_account(&chain, &address).await
            }
            ClientCommand::QueryExtrinsics {
                chain,
                address,
                range,
            } => self.query_extrinsics(&chain, &address, range).await,
            ClientCommand::QueryStaking {
                chain,
                address,
                range,
            } => self.query_staking(&chain, &address, range).await,
            ClientCommand::Status => self.status(),
            ClientCommand::ResetHistory { chain, address } => {
                self.reset_history(&chain, address.as_deref()).await
            }
        }
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    async fn attach(
        &mut self,
        chain: &str,
        accounts: Vec<AccountSpec>,
    ) -> SessionResult<Dispatch> {
        if self.accounts.contains_key(chain) {
            return Err(SessionError::BadRequest(format!(
                "session already attached to {chain}"
            )));
        }
        if accounts.is_empty() {
            return Err(SessionError::BadRequest("no accounts given".into()));
        }
        let watched: Vec<WatchedAccount> = accounts
            .into_iter()
            .map(to_watched)
            .collect::<SessionResult<_>>()?;

        // Chain looked up after validation so bad input fails first.
        let chain_id = self
            .controller
            .chain(chain)
            .ok_or_else(|| SessionError::UnknownChain(chain.to_string()))?
            .spec
            .id
            .clone();

        for stream in [StreamKind::Extrinsics, StreamKind::Staking] {
            self.spawn_worker(&chain_id, stream, &watched).await?;
        }
        self.accounts.insert(chain_id, watched);
        Ok(Dispatch::Ack(None))
    }

    async fn add_account(&mut self, chain: &str, spec: AccountSpec) -> SessionResult<Dispatch> {
        let account = to_watched(spec)?;
        let watched = self
            .accounts
            .get_mut(chain)
            .ok_or_else(|| SessionError::BadRequest(format!("not attached to {chain}")))?;
        if watched.iter().any(|w| w.pubkey == account.pubkey) {
            return Err(SessionError::BadRequest(format!(
                "account {} already watched",
                account.pubkey
            )));
        }
        watched.push(account.clone());

        // Running workers pick the account up going forward; a pair of
        // catch-up workers owns its backfill and its checkpoints.
        for entry in self.workers.iter().filter(|e| e.chain == chain) {
            let _ = entry
                .handle
                .commands
                .send(WorkerCommand::AddAccount(account.pubkey.clone()))
                .await;
        }
        for stream in [StreamKind::Extrinsics, StreamKind::Staking] {
            self.spawn_worker(chain, stream, std::slice::from_ref(&account))
                .await?;
        }
        Ok(Dispatch::Ack(None))
    }

    async fn remove_account(&mut self, chain: &str, address: &str) -> SessionResult<Dispatch> {
        let pubkey = parse_pubkey(address)?;
        let watched = self
            .accounts
            .get_mut(chain)
            .ok_or_else(|| SessionError::BadRequest(format!("not attached to {chain}")))?;
        let before = watched.len();
        watched.retain(|w| w.pubkey != pubkey);
        if watched.len() == before {
            return Err(SessionError::BadRequest(format!(
                "account {pubkey} not watched on {chain}"
            )));
        }

        for entry in self.workers.iter().filter(|e| e.chain == chain) {
            let _ = entry
                .handle
                .commands
                .send(WorkerCommand::RemoveAccount(pubkey.clone()))
                .await;
        }
        Ok(Dispatch::Ack(None))
    }

    async fn broadcast(&mut self, command: WorkerCommand) -> SessionResult<Dispatch> {
        for entry in &self.workers {
            let _ = entry.handle.commands.send(command.clone()).await;
        }
        Ok(Dispatch::Ack(None))
    }

    async fn query_extrinsics(
        &mut self,
        chain: &str,
        address: &str,
        range: QueryRange,
    ) -> SessionResult<Dispatch> {
        let pubkey = parse_pubkey(address)?;
        let records = self
            .controller
            .store()
            .extrinsics()
            .get_extrinsics(chain, &pubkey, to_time_range(range))
            .await?;
        let count = records.len();
        self.send(ServerEvent::Records {
            stream: StreamKind::Extrinsics,
            batch: RecordsBatch::Extrinsics(records),
        });
        Ok(Dispatch::Ack(Some(serde_json::json!({ "count": count }))))
    }

    async fn query_staking(
        &mut self,
        chain: &str,
        address: &str,
        range: QueryRange,
    ) -> SessionResult<Dispatch> {
        let pubkey = parse_pubkey(address)?;
        let records = self
            .controller
            .store()
            .staking_events()
            .get_staking_events(chain, &pubkey, to_time_range(range))
            .await?;
        let count = records.len();
        self.send(ServerEvent::Records {
            stream: StreamKind::Staking,
            batch: RecordsBatch::Staking(records),
        });
        Ok(Dispatch::Ack(Some(serde_json::json!({ "count": count }))))
    }

    fn status(&mut self) -> SessionResult<Dispatch> {
        let errors_last_5m = {
            let mut errors = self.errors.lock().unwrap();
            let cutoff = Instant::now() - ERROR_WINDOW;
            while errors.front().is_some_and(|t| *t < cutoff) {
                errors.pop_front();
            }
            errors.len()
        };

        let mut entries = Vec::new();
        for entry in &self.workers {
            let status = entry
                .handle
                .status
                .lock()
                .map(|s| s.clone())
                .unwrap_or_default();
            let still_watched = self.accounts.get(&entry.chain);
            for account in &entry.handle.accounts {
                if !still_watched
                    .is_some_and(|w| w.iter().any(|a| &a.pubkey == account))
                {
                    continue;
                }
                entries.push(StatusEntry {
                    account: account.to_hex(),
                    stream: entry.handle.stream,
                    state: status.state,
                    last_checkpoint: status.last_checkpoint,
                    target_height: status.target_height,
                    rate_blocks_per_sec: status.rate_blocks_per_sec,
                    in_flight: status.in_flight,
                    errors_last_5m,
                });
            }
        }
        Ok(Dispatch::Ack(Some(serde_json::json!(entries))))
    }

    async fn reset_history(
        &mut self,
        chain: &str,
        address: Option<&str>,
    ) -> SessionResult<Dispatch> {
        let pubkey = address.map(parse_pubkey).transpose()?;
        let removed = self
            .controller
            .store()
            .delete_history(chain, pubkey.as_ref())
            .await?;
        Ok(Dispatch::Ack(Some(serde_json::json!({ "removed": removed }))))
    }

    // -------------------------------------------------------------------------
    // Wiring
    // -------------------------------------------------------------------------

    fn ensure_writer(&mut self) {
        if self.writer.is_some() {
            return;
        }
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let handle = DbWriter::spawn(
            self.controller.store().clone(),
            event_tx,
            self.controller.config.writer_channel_capacity,
            self.controller.config.writer_max_buffered,
        );

        let outbound = self.outbound.clone();
        let session_id = self.id.clone();
        let errors = self.errors.clone();
        self.forwarders.push(tokio::spawn(async move {
            while let Some(WriterEvent::Fatal { message }) = event_rx.recv().await {
                errors.lock().unwrap().push_back(Instant::now());
                let _ = outbound.send(ServerEnvelope {
                    session_id: session_id.clone(),
                    event: ServerEvent::Error {
                        code: ErrorCode::Storage,
                        message,
                        fatal: true,
                        context: None,
                    },
                });
            }
        }));

        self.writer = Some(handle);
    }

    async fn spawn_worker(
        &mut self,
        chain: &str,
        stream: StreamKind,
        accounts: &[WatchedAccount],
    ) -> SessionResult<()> {
        self.ensure_writer();
        let writer_input = self
            .writer
            .as_ref()
            .expect("writer initialized above")
            .input
            .clone();

        let chain_handle = self
            .controller
            .chain(chain)
            .ok_or_else(|| SessionError::UnknownChain(chain.to_string()))?;

        let mut planned = Vec::with_capacity(accounts.len());
        for account in accounts {
            let checkpoint = self
                .controller
                .store()
                .checkpoints()
                .get_checkpoint(chain, &account.pubkey, stream)
                .await?
                .map(|c| c.height);
            planned.push(PlannedAccount {
                account: account.clone(),
                checkpoint,
            });
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let config = self
            .controller
            .config
            .worker_config(chain_handle.spec.clone(), stream);

        let handle = IndexerWorker::spawn(
            config,
            chain_handle.client.clone(),
            planned,
            writer_input,
            event_tx,
        );

        debug!(chain, %stream, accounts = handle.accounts.len(), "worker spawned");
        self.forwarders.push(spawn_event_forwarder(
            self.id.clone(),
            handle.accounts.clone(),
            self.outbound.clone(),
            self.errors.clone(),
            event_rx,
        ));
        self.workers.push(WorkerEntry {
            chain: chain.to_string(),
            handle,
        });
        Ok(())
    }

    fn send(&self, event: ServerEvent) {
        let _ = self.outbound.send(ServerEnvelope {
            session_id: self.id.clone(),
            event,
        });
    }

    /// Stop everything this session owns. Workers get the graceful
    /// deadline; past it they are cancelled and left to the runtime.
    pub async fn shutdown(mut self) {
        info!(session = %self.id, workers = self.workers.len(), "session shutdown");
        for entry in &self.workers {
            let _ = entry.handle.commands.try_send(WorkerCommand::Stop);
        }

        let deadline = self.controller.config.shutdown_deadline;
        for entry in self.workers.drain(..) {
            let cancel = entry.handle.cancel.clone();
            if tokio::time::timeout(deadline, entry.handle.join)
                .await
                .is_err()
            {
                warn!("worker exceeded shutdown deadline, cancelling");
                cancel.cancel();
            }
        }

        if let Some(writer) = self.writer.take() {
            drop(writer.input);
            let _ = tokio::time::timeout(deadline, writer.join).await;
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn parse_pubkey(address: &str) -> SessionResult<AccountId> {
    parse_account_address(address).map_err(|e| SessionError::BadRequest(e.to_string()))
}

fn to_watched(spec: AccountSpec) -> SessionResult<WatchedAccount> {
    if spec.start_block == Some(0) {
        return Err(SessionError::BadRequest(
            "start_block must be greater than zero".into(),
        ));
    }
    Ok(WatchedAccount {
        pubkey: parse_pubkey(&spec.address)?,
        label: spec.label,
        start_block: spec.start_block,
    })
}

fn to_time_range(range: QueryRange) -> TimeRange {
    TimeRange {
        from: range
            .from_ms
            .and_then(|ms| chrono::Utc.timestamp_millis_opt(ms).single()),
        to: range
            .to_ms
            .and_then(|ms| chrono::Utc.timestamp_millis_opt(ms).single()),
    }
}

/// Translate one worker's events into client envelopes, fanned out per
/// account the worker covers.
fn spawn_event_forwarder(
    session_id: String,
    accounts: Vec<AccountId>,
    outbound: mpsc::UnboundedSender<ServerEnvelope>,
    errors: Arc<Mutex<VecDeque<Instant>>>,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let send = |event: ServerEvent| {
            let _ = outbound.send(ServerEnvelope {
                session_id: session_id.clone(),
                event,
            });
        };

        while let Some(event) = events.recv().await {
            match event {
                WorkerEvent::Progress {
                    stream,
                    height,
                    target,
                    rate,
                } => {
                    for account in &accounts {
                        send(ServerEvent::Progress {
                            account: account.to_hex(),
                            stream,
                            height,
                            target,
                            rate,
                        });
                    }
                }
                WorkerEvent::CheckpointEmitted { stream, height } => {
                    for account in &accounts {
                        send(ServerEvent::Checkpoint {
                            account: account.to_hex(),
                            stream,
                            height,
                        });
                    }
                }
                WorkerEvent::Recoverable { message } => {
                    errors.lock().unwrap().push_back(Instant::now());
                    send(ServerEvent::Error {
                        code: ErrorCode::RpcTransient,
                        message,
                        fatal: false,
                        context: None,
                    });
                }
                WorkerEvent::Fatal { message, kind } => {
                    errors.lock().unwrap().push_back(Instant::now());
                    let code = match kind {
                        FatalKind::Chain => ErrorCode::RpcProtocol,
                        FatalKind::Storage => ErrorCode::Storage,
                        FatalKind::Internal => ErrorCode::Unknown,
                    };
                    send(ServerEvent::Error {
                        code,
                        message,
                        fatal: true,
                        context: None,
                    });
                }
                WorkerEvent::StateChanged(_) => {}
            }
        }
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use watchtower_core::error::{ChainError, ChainResult};
    use watchtower_core::models::BlockHash;
    use watchtower_core::ports::{RawBlock, RawEvent, RawExtrinsic};
    use watchtower_storage::{Database, SqliteStore};

    const WATCHED_HEX: &str =
        "0x2020202020202020202020202020202020202020202020202020202020202020";

    struct ScriptedChain {
        head: u64,
        transfer_heights: Vec<u64>,
    }

    #[async_trait]
    impl ChainClient for ScriptedChain {
        async fn genesis_hash(&self) -> ChainResult<BlockHash> {
            Ok(BlockHash([0; 32]))
        }

        async fn head_height(&self) -> ChainResult<u64> {
            Ok(self.head)
        }

        async fn hash_at(&self, height: u64) -> ChainResult<BlockHash> {
            Ok(BlockHash([height as u8; 32]))
        }

        async fn block_at(&self, height: u64) -> ChainResult<RawBlock> {
            if height > self.head {
                return Err(ChainError::NotFound(height));
            }
            let mut extrinsics = vec![RawExtrinsic {
                index: 0,
                pallet: "Timestamp".into(),
                call: "set".into(),
                signer: None,
                args: json!({"now": (1_613_727_474_000u64 + height * 6_000).to_string()}),
                success: true,
                tip: None,
            }];
            if self.transfer_heights.contains(&height) {
                extrinsics.push(RawExtrinsic {
                    index: 1,
                    pallet: "Balances".into(),
                    call: "transfer_keep_alive".into(),
                    signer: Some(AccountId([0xaa; 32])),
                    args: json!({"dest": {"Id": WATCHED_HEX}, "value": "200000000000000"}),
                    success: true,
                    tip: Some(0),
                });
            }
            Ok(RawBlock {
                height,
                hash: BlockHash([height as u8; 32]),
                parent_hash: BlockHash([height.saturating_sub(1) as u8; 32]),
                timestamp_ms: Some(1_613_727_474_000 + height * 6_000),
                extrinsics,
            })
        }

        async fn events_at(&self, height: u64) -> ChainResult<Vec<RawEvent>> {
            if height > self.head {
                return Err(ChainError::NotFound(height));
            }
            Ok(Vec::new())
        }

        async fn account_creation_height(
            &self,
            _pubkey: &AccountId,
        ) -> ChainResult<Option<u64>> {
            Ok(None)
        }
    }

    fn fast_config() -> ControllerConfig {
        ControllerConfig {
            heartbeat_blocks: 4,
            heartbeat_interval: Duration::from_millis(50),
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(5),
            poll_interval: Duration::from_millis(20),
            shutdown_deadline: Duration::from_secs(2),
            ..ControllerConfig::default()
        }
    }

    fn test_controller(
        store: Arc<dyn Store>,
        head: u64,
        transfer_heights: Vec<u64>,
    ) -> Arc<SessionController> {
        let mut controller = SessionController::new(store, fast_config());
        let mut spec = ChainSpec::kusama();
        spec.id = "testnet".into();
        spec.genesis_hash = None;
        spec.finality_depth = 0;
        controller.register_chain(ChainHandle {
            spec,
            client: Arc::new(ScriptedChain {
                head,
                transfer_heights,
            }),
        });
        Arc::new(controller)
    }

    fn attach_envelope() -> ClientEnvelope {
        serde_json::from_value(json!({
            "type": "attach",
            "payload": {
                "chain": "testnet",
                "accounts": [{"address": WATCHED_HEX, "start_block": 1}]
            },
            "request_id": "r1"
        }))
        .unwrap()
    }

    async fn wait_for_checkpoint(
        outbound: &mut mpsc::UnboundedReceiver<ServerEnvelope>,
        stream: StreamKind,
        height: u64,
    ) {
        while let Some(envelope) = outbound.recv().await {
            if let ServerEvent::Checkpoint {
                stream: s,
                height: h,
                ..
            } = envelope.event
            {
                if s == stream && h >= height {
                    return;
                }
            }
        }
        panic!("outbound closed before checkpoint {height}");
    }

    #[tokio::test]
    async fn attach_indexes_and_checkpoints() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(Arc::new(
            Database::in_memory().await.unwrap(),
        )));
        let controller = test_controller(store.clone(), 12, vec![5, 9]);

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let mut session = controller.create_session(outbound_tx);

        assert!(session.handle(attach_envelope()).await);
        wait_for_checkpoint(&mut outbound_rx, StreamKind::Extrinsics, 12).await;

        // The checkpoint event fires when the marker is queued; wait
        // for the writer to commit it before querying.
        let pubkey = AccountId::from_hex(WATCHED_HEX).unwrap();
        for _ in 0..100 {
            let committed = store
                .checkpoints()
                .get_checkpoint("testnet", &pubkey, StreamKind::Extrinsics)
                .await
                .unwrap()
                .map(|c| c.height);
            if committed == Some(12) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Query through the session's read path.
        let query: ClientEnvelope = serde_json::from_value(json!({
            "type": "query_extrinsics",
            "payload": {"chain": "testnet", "address": WATCHED_HEX},
            "request_id": "r2"
        }))
        .unwrap();
        assert!(session.handle(query).await);

        let mut record_count = None;
        while let Some(envelope) = outbound_rx.recv().await {
            if let ServerEvent::Records {
                batch: RecordsBatch::Extrinsics(records),
                ..
            } = envelope.event
            {
                record_count = Some(records.len());
                break;
            }
        }
        assert_eq!(record_count, Some(2));

        session.shutdown().await;
    }

    #[tokio::test]
    async fn reconnect_resumes_from_checkpoint_without_duplicates() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(Arc::new(
            Database::in_memory().await.unwrap(),
        )));
        let controller = test_controller(store.clone(), 12, vec![5]);

        // First session indexes to the head.
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let mut session = controller.create_session(outbound_tx);
        assert!(session.handle(attach_envelope()).await);
        wait_for_checkpoint(&mut outbound_rx, StreamKind::Extrinsics, 12).await;
        session.shutdown().await;

        let pubkey = AccountId::from_hex(WATCHED_HEX).unwrap();
        let checkpoint = store
            .checkpoints()
            .get_checkpoint("testnet", &pubkey, StreamKind::Extrinsics)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.height, 12);

        // Second session resumes from storage; the committed state
        // matches a clean run exactly.
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let mut session = controller.create_session(outbound_tx);
        assert!(session.handle(attach_envelope()).await);

        // Head unchanged: the worker has nothing to scan and keeps
        // polling. Give it a moment, then verify no duplicates.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let records = store
            .extrinsics()
            .get_extrinsics("testnet", &pubkey, TimeRange::default())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].block_height, 5);

        session.shutdown().await;
        drop(outbound_rx);
    }

    #[tokio::test]
    async fn unknown_chain_is_rejected() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(Arc::new(
            Database::in_memory().await.unwrap(),
        )));
        let controller = test_controller(store, 5, vec![]);

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let mut session = controller.create_session(outbound_tx);

        let envelope: ClientEnvelope = serde_json::from_value(json!({
            "type": "attach",
            "payload": {"chain": "acala", "accounts": [{"address": WATCHED_HEX}]},
            "request_id": "r1"
        }))
        .unwrap();
        assert!(session.handle(envelope).await);

        let mut saw_error = false;
        let mut ack_failed = false;
        while let Some(envelope) = outbound_rx.recv().await {
            match envelope.event {
                ServerEvent::Error { code, .. } => {
                    assert_eq!(code, ErrorCode::BadRequest);
                    saw_error = true;
                }
                ServerEvent::Ack { ok, .. } => {
                    ack_failed = !ok;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_error);
        assert!(ack_failed);

        session.shutdown().await;
    }

    #[tokio::test]
    async fn remove_account_requires_attachment() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(Arc::new(
            Database::in_memory().await.unwrap(),
        )));
        let controller = test_controller(store, 5, vec![]);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let mut session = controller.create_session(outbound_tx);

        let envelope: ClientEnvelope = serde_json::from_value(json!({
            "type": "remove_account",
            "payload": {"chain": "testnet", "address": WATCHED_HEX},
        }))
        .unwrap();
        assert!(session.handle(envelope).await);

        let mut ok = true;
        while let Some(envelope) = outbound_rx.recv().await {
            if let ServerEvent::Ack { ok: acked, .. } = envelope.event {
                ok = acked;
                break;
            }
        }
        assert!(!ok);
        session.shutdown().await;
    }
}
