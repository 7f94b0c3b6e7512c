//! Indexer worker - the per-(session, chain, stream) scan pipeline.
//!
//! A worker plans a block range from durable checkpoints, fans block
//! fetches out over a bounded pool, re-orders results into strict
//! ascending height, classifies and filters each block, and hands
//! matched records to the writer channel. Heartbeat checkpoint markers
//! are emitted only after every record at or below the marker height is
//! on the writer channel.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::classify::{classify_extrinsic, extract_staking_events};
use crate::error::{ChainError, WorkerError, WorkerResult};
use crate::filter::AddressFilter;
use crate::metrics::{
    record_block_fetched, record_fetch_retry, record_records_matched, record_worker_error,
};
use crate::models::{
    AccountId, ChainSpec, Checkpoint, ExtrinsicRecord, RecordBatch, StakingEventRecord,
    StreamKind, WatchedAccount, KUSAMA_STAKING_EVENTS_START,
};
use crate::ports::{BlockBundle, ChainClient};

// =============================================================================
// Configuration
// =============================================================================

/// Tuning for one worker's pipeline.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Chain this worker scans.
    pub chain: ChainSpec,
    /// Record stream this worker produces.
    pub stream: StreamKind,
    /// Block-height window size for the range slicer.
    pub window_size: u64,
    /// Concurrent block fetches.
    pub fetch_parallelism: usize,
    /// Emit a checkpoint marker after this many processed blocks.
    pub heartbeat_blocks: u64,
    /// Emit a checkpoint marker at least this often while progressing.
    pub heartbeat_interval: Duration,
    /// Transient retries per height.
    pub max_retries: u32,
    /// Backoff base delay.
    pub backoff_base: Duration,
    /// Backoff cap.
    pub backoff_cap: Duration,
    /// End-to-end deadline for fetching one block with its events.
    pub block_timeout: Duration,
    /// Sleep between plans once the target is reached.
    pub poll_interval: Duration,
    /// Log scan position every this many blocks.
    pub log_every: u64,
}

impl WorkerConfig {
    pub fn new(chain: ChainSpec, stream: StreamKind) -> Self {
        Self {
            chain,
            stream,
            window_size: 256,
            fetch_parallelism: 8,
            heartbeat_blocks: 64,
            heartbeat_interval: Duration::from_secs(5),
            max_retries: 5,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            block_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(12),
            log_every: 1000,
        }
    }
}

// =============================================================================
// Worker I/O
// =============================================================================

/// Lifecycle state, driven exclusively by control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Planning,
    Running,
    Paused,
    Stopping,
    Stopped,
}

/// Control commands accepted by a running worker.
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    /// Stop issuing new windows; in-flight work completes and
    /// checkpoints.
    Pause,
    /// Resume a paused worker.
    Resume,
    /// Drain in-flight work, emit a final checkpoint, stop.
    Stop,
    /// Extend the filter set going forward. Checkpoints for the new
    /// account stay owned by its catch-up worker.
    AddAccount(AccountId),
    /// Stop emitting records for this account; history is retained.
    RemoveAccount(AccountId),
}

/// What the worker puts on the writer channel.
#[derive(Debug)]
pub enum WorkerOutput {
    /// Matched records for one block, in ascending order.
    Records(RecordBatch),
    /// All records at heights <= the carried height are already queued.
    Checkpoint(Vec<Checkpoint>),
}

/// Progress and error notifications for the controller.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Progress {
        stream: StreamKind,
        height: u64,
        target: u64,
        rate: f64,
    },
    CheckpointEmitted {
        stream: StreamKind,
        height: u64,
    },
    /// Retries exhausted; the worker paused at its last good
    /// checkpoint and waits for resume.
    Recoverable {
        message: String,
    },
    /// The worker is dead; the session should be told.
    Fatal {
        message: String,
        kind: FatalKind,
    },
    StateChanged(WorkerState),
}

/// Coarse origin of a fatal worker error, for wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    Chain,
    Storage,
    Internal,
}

impl From<&WorkerError> for FatalKind {
    fn from(error: &WorkerError) -> Self {
        match error {
            WorkerError::Chain(_) => FatalKind::Chain,
            WorkerError::Storage(_) => FatalKind::Storage,
            _ => FatalKind::Internal,
        }
    }
}

/// Live status snapshot, shared with the controller.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub last_checkpoint: Option<u64>,
    pub target_height: u64,
    pub rate_blocks_per_sec: f64,
    pub in_flight: usize,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self {
            state: WorkerState::Idle,
            last_checkpoint: None,
            target_height: 0,
            rate_blocks_per_sec: 0.0,
            in_flight: 0,
        }
    }
}

/// One account the worker plans for, with its durable checkpoint as
/// read by the controller at spawn time.
#[derive(Debug, Clone)]
pub struct PlannedAccount {
    pub account: WatchedAccount,
    pub checkpoint: Option<u64>,
}

/// Handle owned by the controller.
pub struct WorkerHandle {
    pub commands: mpsc::Sender<WorkerCommand>,
    pub cancel: CancellationToken,
    pub status: Arc<Mutex<WorkerStatus>>,
    pub stream: StreamKind,
    pub accounts: Vec<AccountId>,
    pub join: JoinHandle<WorkerResult<()>>,
}

// =============================================================================
// Worker
// =============================================================================

struct Plan {
    start: u64,
    target: u64,
}

enum PumpOutcome {
    /// Plan exhausted; re-plan against the new head.
    Completed,
    /// Stop command honoured.
    Stopped,
}

/// The per-(session, chain, stream) scan pipeline.
pub struct IndexerWorker<C: ChainClient + ?Sized> {
    config: WorkerConfig,
    client: Arc<C>,
    planned: Vec<PlannedAccount>,
    filter: AddressFilter,
    output: mpsc::Sender<WorkerOutput>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    commands: mpsc::Receiver<WorkerCommand>,
    cancel: CancellationToken,
    status: Arc<Mutex<WorkerStatus>>,
}

impl<C: ChainClient + ?Sized + 'static> IndexerWorker<C> {
    /// Spawn a worker task and return its handle.
    pub fn spawn(
        config: WorkerConfig,
        client: Arc<C>,
        accounts: Vec<PlannedAccount>,
        output: mpsc::Sender<WorkerOutput>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> WorkerHandle {
        let (command_tx, command_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let status = Arc::new(Mutex::new(WorkerStatus::default()));
        let stream = config.stream;
        let account_ids: Vec<AccountId> =
            accounts.iter().map(|p| p.account.pubkey.clone()).collect();

        let worker = Self {
            filter: AddressFilter::new(account_ids.iter().cloned()),
            config,
            client,
            planned: accounts,
            output,
            events,
            commands: command_rx,
            cancel: cancel.clone(),
            status: status.clone(),
        };

        let join = tokio::spawn(worker.run());

        WorkerHandle {
            commands: command_tx,
            cancel,
            status,
            stream,
            accounts: account_ids,
            join,
        }
    }

    #[instrument(skip_all, fields(chain = %self.config.chain.id, stream = %self.config.stream))]
    async fn run(mut self) -> WorkerResult<()> {
        let result = self.run_inner().await;

        match &result {
            Ok(()) | Err(WorkerError::Cancelled) => {}
            Err(e) => {
                record_worker_error(if e.is_recoverable() { "recoverable" } else { "fatal" });
                let _ = self.events.send(WorkerEvent::Fatal {
                    message: e.to_string(),
                    kind: FatalKind::from(e),
                });
            }
        }

        self.set_state(WorkerState::Stopped);
        result
    }

    async fn run_inner(&mut self) -> WorkerResult<()> {
        loop {
            self.set_state(WorkerState::Planning);
            let plan = match self.plan().await {
                Ok(plan) => plan,
                Err(e) if e.is_recoverable() => {
                    match self.enter_recoverable_pause(e.to_string()).await? {
                        ResumeOutcome::Resumed => continue,
                        ResumeOutcome::Stopped => return Ok(()),
                    }
                }
                Err(e) => return Err(e),
            };

            match plan {
                Some(plan) => {
                    info!(start = plan.start, target = plan.target, "scan planned");
                    self.set_state(WorkerState::Running);
                    match self.pump(plan).await? {
                        PumpOutcome::Completed => continue,
                        PumpOutcome::Stopped => return Ok(()),
                    }
                }
                None => {
                    debug!("nothing to scan, waiting for new blocks");
                    if self.idle_wait().await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Planning
    // -------------------------------------------------------------------------

    /// Compute the `[start, target]` range for the current head.
    ///
    /// `start` is the lowest effective start across planned accounts
    /// (checkpoint + 1 clamped by the account's own start block);
    /// `target` is the head minus the finality depth.
    async fn plan(&mut self) -> WorkerResult<Option<Plan>> {
        if self.planned.is_empty() {
            return Ok(None);
        }

        let head = self.head_with_retry().await?;
        let target = head.saturating_sub(self.config.chain.finality_depth);

        let mut start = u64::MAX;
        for planned in &self.planned {
            let base = match planned.account.start_block {
                Some(height) => height,
                None => self
                    .client
                    .account_creation_height(&planned.account.pubkey)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or(0),
            };
            let mut effective = match planned.checkpoint {
                Some(checkpoint) => (checkpoint + 1).max(base),
                None => base,
            };
            if self.config.stream == StreamKind::Staking && self.config.chain.id == "kusama" {
                effective = effective.max(KUSAMA_STAKING_EVENTS_START);
            }
            start = start.min(effective);
        }

        self.update_status(|s| s.target_height = target);

        if start > target {
            return Ok(None);
        }
        Ok(Some(Plan { start, target }))
    }

    async fn head_with_retry(&self) -> WorkerResult<u64> {
        let mut backoff = self.backoff();
        let mut attempts = 0;
        loop {
            match self.client.head_height().await {
                Ok(head) => return Ok(head),
                Err(e) if e.is_transient() && attempts < self.config.max_retries => {
                    attempts += 1;
                    record_fetch_retry(&self.config.chain.id);
                    let delay = backoff.next().unwrap_or(self.config.backoff_cap);
                    self.cancellable_sleep(delay).await?;
                }
                Err(e) if e.is_transient() => {
                    return Err(WorkerError::RetriesExhausted {
                        height: 0,
                        attempts,
                        last: e.to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Pipeline
    // -------------------------------------------------------------------------

    async fn pump(&mut self, plan: Plan) -> WorkerResult<PumpOutcome> {
        let mut inflight: JoinSet<(u64, WorkerResult<BlockBundle>)> = JoinSet::new();
        let mut pending: BTreeMap<u64, BlockBundle> = BTreeMap::new();
        let mut backlog: VecDeque<u64> = VecDeque::new();

        let mut next_height = plan.start;
        let mut next_emit = plan.start;
        let mut last_marker: Option<u64> = None;

        let mut since_marker = 0u64;
        let mut rate_window = Instant::now();
        let mut rate_blocks = 0u64;

        let mut paused = false;
        let mut stopping = false;

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            // Top up the fetch pool. The backlog (heights whose fetch
            // failed recoverably) goes first, and the slicer never
            // issues heights beyond one window past the emit cursor.
            let window_end = next_emit.saturating_add(self.config.window_size);
            while !paused
                && !stopping
                && inflight.len() < self.config.fetch_parallelism
                && (!backlog.is_empty() || (next_height <= plan.target && next_height < window_end))
            {
                let height = match backlog.pop_front() {
                    Some(height) => height,
                    None => {
                        let height = next_height;
                        next_height += 1;
                        height
                    }
                };
                let client = self.client.clone();
                let chain = self.config.chain.id.clone();
                let retry = RetryPolicy::from(&self.config);
                let cancel = self.cancel.child_token();
                inflight.spawn(async move {
                    let result = fetch_block(client.as_ref(), &chain, height, &retry, &cancel).await;
                    (height, result)
                });
            }
            self.update_status(|s| s.in_flight = inflight.len());

            // Plan exhausted and fully drained.
            if next_emit > plan.target && inflight.is_empty() && backlog.is_empty() {
                self.emit_marker(plan.target, &mut last_marker, &mut since_marker)
                    .await?;
                return Ok(PumpOutcome::Completed);
            }

            // Pause/stop drain barrier: everything in flight landed and
            // everything contiguous was emitted.
            if (paused || stopping) && inflight.is_empty() {
                if next_emit > plan.start {
                    self.emit_marker(next_emit - 1, &mut last_marker, &mut since_marker)
                        .await?;
                }
                if stopping {
                    return Ok(PumpOutcome::Stopped);
                }
                self.set_state(WorkerState::Paused);
                match self.wait_resume().await? {
                    ResumeOutcome::Resumed => {
                        paused = false;
                        self.set_state(WorkerState::Running);
                        rate_window = Instant::now();
                        rate_blocks = 0;
                        continue;
                    }
                    ResumeOutcome::Stopped => return Ok(PumpOutcome::Stopped),
                }
            }

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    inflight.abort_all();
                    if next_emit > plan.start {
                        self.emit_marker(next_emit - 1, &mut last_marker, &mut since_marker)
                            .await?;
                    }
                    return Err(WorkerError::Cancelled);
                }

                command = self.commands.recv() => {
                    match command {
                        Some(WorkerCommand::Pause) => paused = true,
                        Some(WorkerCommand::Resume) => paused = false,
                        Some(WorkerCommand::Stop) => {
                            stopping = true;
                            self.set_state(WorkerState::Stopping);
                        }
                        Some(WorkerCommand::AddAccount(pubkey)) => {
                            self.filter.insert(pubkey);
                        }
                        Some(WorkerCommand::RemoveAccount(pubkey)) => {
                            self.filter.remove(&pubkey);
                            self.planned.retain(|p| p.account.pubkey != pubkey);
                        }
                        // Controller dropped the handle: treat as stop.
                        None => {
                            stopping = true;
                            self.set_state(WorkerState::Stopping);
                        }
                    }
                }

                Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                    let (height, result) = joined
                        .map_err(|e| WorkerError::Fatal(format!("fetch task panicked: {e}")))?;
                    match result {
                        Ok(bundle) => {
                            pending.insert(height, bundle);
                            let processed = self
                                .drain_ready(&mut pending, &mut next_emit, plan.target, &mut since_marker, &mut last_marker)
                                .await?;
                            rate_blocks += processed;
                        }
                        Err(WorkerError::Cancelled) => {}
                        Err(e) if e.is_recoverable() => {
                            warn!(height, error = %e, "fetch failed, pausing at last checkpoint");
                            record_worker_error("recoverable");
                            let _ = self.events.send(WorkerEvent::Recoverable {
                                message: e.to_string(),
                            });
                            backlog.push_back(height);
                            paused = true;
                        }
                        Err(e) => {
                            inflight.abort_all();
                            return Err(e);
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    let elapsed = rate_window.elapsed().as_secs_f64();
                    let rate = if elapsed > 0.0 { rate_blocks as f64 / elapsed } else { 0.0 };
                    rate_window = Instant::now();
                    rate_blocks = 0;
                    self.update_status(|s| s.rate_blocks_per_sec = rate);
                    let _ = self.events.send(WorkerEvent::Progress {
                        stream: self.config.stream,
                        height: next_emit.saturating_sub(1),
                        target: plan.target,
                        rate,
                    });
                    if since_marker > 0 && next_emit > plan.start {
                        self.emit_marker(next_emit - 1, &mut last_marker, &mut since_marker)
                            .await?;
                    }
                }
            }
        }
    }

    /// Emit every block that became contiguous, oldest first.
    async fn drain_ready(
        &mut self,
        pending: &mut BTreeMap<u64, BlockBundle>,
        next_emit: &mut u64,
        target: u64,
        since_marker: &mut u64,
        last_marker: &mut Option<u64>,
    ) -> WorkerResult<u64> {
        let mut processed = 0u64;
        while let Some(bundle) = pending.remove(next_emit) {
            let batch = self.process_block(&bundle);
            if !batch.is_empty() {
                record_records_matched(self.config.stream.as_str(), batch.len() as u64);
                self.output
                    .send(WorkerOutput::Records(batch))
                    .await
                    .map_err(|_| WorkerError::WriterGone)?;
            }

            if *next_emit % self.config.log_every == 0 {
                debug!(height = *next_emit, target, "scan position");
            }

            *next_emit += 1;
            *since_marker += 1;
            processed += 1;

            if *since_marker >= self.config.heartbeat_blocks {
                self.emit_marker(*next_emit - 1, last_marker, since_marker)
                    .await?;
            }
        }
        Ok(processed)
    }

    /// Put a checkpoint marker for every planned account on the writer
    /// channel. All records at heights <= `height` are already queued,
    /// which is what makes the marker safe to commit.
    async fn emit_marker(
        &mut self,
        height: u64,
        last_marker: &mut Option<u64>,
        since_marker: &mut u64,
    ) -> WorkerResult<()> {
        *since_marker = 0;
        if last_marker.is_some_and(|last| height <= last) {
            return Ok(());
        }

        let checkpoints: Vec<Checkpoint> = self
            .planned
            .iter()
            .map(|p| Checkpoint {
                chain: self.config.chain.id.clone(),
                pubkey: p.account.pubkey.clone(),
                stream: self.config.stream,
                height,
            })
            .collect();
        if checkpoints.is_empty() {
            return Ok(());
        }

        self.output
            .send(WorkerOutput::Checkpoint(checkpoints))
            .await
            .map_err(|_| WorkerError::WriterGone)?;

        *last_marker = Some(height);
        for planned in &mut self.planned {
            planned.checkpoint = Some(height);
        }
        self.update_status(|s| s.last_checkpoint = Some(height));
        let _ = self.events.send(WorkerEvent::CheckpointEmitted {
            stream: self.config.stream,
            height,
        });
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Block processing
    // -------------------------------------------------------------------------

    /// Classify and filter one block into a record batch.
    fn process_block(&self, bundle: &BlockBundle) -> RecordBatch {
        let mut batch = RecordBatch::default();
        let block = &bundle.block;
        let timestamp = block
            .timestamp_ms
            .and_then(|ms| chrono::DateTime::from_timestamp_millis(ms as i64));

        for extrinsic in &block.extrinsics {
            let events: Vec<_> = bundle.events_for(extrinsic.index).collect();
            let classified = classify_extrinsic(extrinsic, &events);
            if classified.is_inherent() {
                continue;
            }

            match self.config.stream {
                StreamKind::Extrinsics => {
                    let matched = self.filter.match_extrinsic(extrinsic, &classified, &events);
                    if matched.is_empty() {
                        continue;
                    }
                    batch.extrinsics.push(ExtrinsicRecord {
                        chain: self.config.chain.id.clone(),
                        block_height: block.height,
                        extrinsic_index: extrinsic.index,
                        block_hash: block.hash.clone(),
                        block_timestamp: timestamp,
                        signer: extrinsic.signer.clone(),
                        call_module: extrinsic.pallet.clone(),
                        call_function: extrinsic.call.clone(),
                        success: extrinsic.success,
                        tip: classified.tip,
                        fee: classified.fee,
                        params: extrinsic.args.clone(),
                        matched,
                    });
                }
                StreamKind::Staking => {
                    let payout = classified.payout_context();
                    for event in extract_staking_events(&events) {
                        if !self.filter.contains(&event.beneficiary) {
                            continue;
                        }
                        let (validator_stash, era) = payout.clone().unwrap_or((None, None));
                        batch.staking_events.push(StakingEventRecord {
                            chain: self.config.chain.id.clone(),
                            block_height: block.height,
                            extrinsic_index: extrinsic.index,
                            event_index: event.event_index,
                            module: "Staking".to_string(),
                            event_id: event.event_id,
                            beneficiary: event.beneficiary,
                            amount: event.amount,
                            era,
                            validator_stash,
                        });
                    }
                }
            }
        }

        batch
    }

    // -------------------------------------------------------------------------
    // Waiting states
    // -------------------------------------------------------------------------

    /// Recoverable failure outside the pump: report, pause, wait.
    async fn enter_recoverable_pause(&mut self, message: String) -> WorkerResult<ResumeOutcome> {
        record_worker_error("recoverable");
        let _ = self.events.send(WorkerEvent::Recoverable { message });
        self.set_state(WorkerState::Paused);
        self.wait_resume().await
    }

    /// Block until resume or stop while paused.
    async fn wait_resume(&mut self) -> WorkerResult<ResumeOutcome> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(WorkerError::Cancelled),
                command = self.commands.recv() => match command {
                    Some(WorkerCommand::Resume) => return Ok(ResumeOutcome::Resumed),
                    Some(WorkerCommand::Stop) | None => return Ok(ResumeOutcome::Stopped),
                    Some(WorkerCommand::AddAccount(pubkey)) => {
                        self.filter.insert(pubkey);
                    }
                    Some(WorkerCommand::RemoveAccount(pubkey)) => {
                        self.filter.remove(&pubkey);
                        self.planned.retain(|p| p.account.pubkey != pubkey);
                    }
                    Some(WorkerCommand::Pause) => {}
                },
            }
        }
    }

    /// Caught up with the head: sleep one poll interval, staying
    /// responsive to commands. Returns `true` when stopped.
    async fn idle_wait(&mut self) -> WorkerResult<bool> {
        let deadline = tokio::time::sleep(self.config.poll_interval);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(WorkerError::Cancelled),
                _ = &mut deadline => return Ok(false),
                command = self.commands.recv() => match command {
                    Some(WorkerCommand::Stop) | None => return Ok(true),
                    Some(WorkerCommand::Pause) => {
                        self.set_state(WorkerState::Paused);
                        match self.wait_resume().await? {
                            ResumeOutcome::Resumed => self.set_state(WorkerState::Running),
                            ResumeOutcome::Stopped => return Ok(true),
                        }
                    }
                    Some(WorkerCommand::AddAccount(pubkey)) => {
                        self.filter.insert(pubkey);
                    }
                    Some(WorkerCommand::RemoveAccount(pubkey)) => {
                        self.filter.remove(&pubkey);
                        self.planned.retain(|p| p.account.pubkey != pubkey);
                    }
                    Some(WorkerCommand::Resume) => {}
                },
            }
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn set_state(&self, state: WorkerState) {
        self.update_status(|s| s.state = state);
        let _ = self.events.send(WorkerEvent::StateChanged(state));
    }

    fn update_status(&self, f: impl FnOnce(&mut WorkerStatus)) {
        if let Ok(mut status) = self.status.lock() {
            f(&mut status);
        }
    }

    fn backoff(&self) -> impl Iterator<Item = Duration> {
        ExponentialBuilder::default()
            .with_min_delay(self.config.backoff_base)
            .with_max_delay(self.config.backoff_cap)
            .with_jitter()
            .without_max_times()
            .build()
    }

    async fn cancellable_sleep(&self, delay: Duration) -> WorkerResult<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(WorkerError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

enum ResumeOutcome {
    Resumed,
    Stopped,
}

// =============================================================================
// Fetching
// =============================================================================

#[derive(Debug, Clone)]
struct RetryPolicy {
    max_retries: u32,
    base: Duration,
    cap: Duration,
    block_timeout: Duration,
}

impl From<&WorkerConfig> for RetryPolicy {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base: config.backoff_base,
            cap: config.backoff_cap,
            block_timeout: config.block_timeout,
        }
    }
}

/// Fetch one block with its events, applying the retry policy:
/// transient errors retry with jittered exponential backoff up to the
/// cap, protocol errors get exactly one retry, and a missing block at a
/// finalised height is fatal.
async fn fetch_block<C: ChainClient + ?Sized>(
    client: &C,
    chain: &str,
    height: u64,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> WorkerResult<BlockBundle> {
    let mut backoff = ExponentialBuilder::default()
        .with_min_delay(policy.base)
        .with_max_delay(policy.cap)
        .with_jitter()
        .without_max_times()
        .build();
    let mut transient_attempts = 0u32;
    let mut protocol_attempts = 0u32;

    loop {
        let fetch = async {
            let block = client.block_at(height).await?;
            let events = client.events_at(height).await?;
            Ok::<_, ChainError>(BlockBundle { block, events })
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
            result = tokio::time::timeout(policy.block_timeout, fetch) => {
                result.unwrap_or(Err(ChainError::Timeout(policy.block_timeout)))
            }
        };

        match outcome {
            Ok(bundle) => {
                record_block_fetched(chain);
                return Ok(bundle);
            }
            Err(e) if e.is_transient() && transient_attempts < policy.max_retries => {
                transient_attempts += 1;
                record_fetch_retry(chain);
                debug!(height, attempt = transient_attempts, error = %e, "retrying fetch");
                let delay = backoff.next().unwrap_or(policy.cap);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) if e.is_transient() => {
                return Err(WorkerError::RetriesExhausted {
                    height,
                    attempts: transient_attempts,
                    last: e.to_string(),
                });
            }
            Err(ChainError::Protocol(message)) if protocol_attempts < 1 => {
                protocol_attempts += 1;
                record_fetch_retry(chain);
                debug!(height, error = %message, "retrying after protocol error");
            }
            Err(e) => return Err(e.into()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
