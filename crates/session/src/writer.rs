//! DB writer - the single persistence consumer for one session.
//!
//! Workers put records and checkpoint markers on a bounded channel;
//! this task is the only thing that touches the store on the write
//! path, so writes serialize naturally. Records buffer until a marker
//! arrives, then records and checkpoints commit in one transaction.
//! If the buffer overflows before a marker, records commit alone -
//! checkpoints staying behind the data is always safe, the converse
//! never happens.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument};

use watchtower_core::error::StorageError;
use watchtower_core::metrics::record_checkpoint_advanced;
use watchtower_core::models::RecordBatch;
use watchtower_core::ports::Store;
use watchtower_core::services::WorkerOutput;

/// Notifications from the writer to the session.
#[derive(Debug, Clone)]
pub enum WriterEvent {
    /// A storage error. Always fatal to the session.
    Fatal { message: String },
}

/// Handle owned by the session.
pub struct WriterHandle {
    /// Cloneable sender handed to each worker. Bounded: backpressure
    /// propagates into the fetch pools when the writer falls behind.
    pub input: mpsc::Sender<WorkerOutput>,
    pub join: JoinHandle<Result<(), StorageError>>,
}

/// The writer task.
pub struct DbWriter {
    store: Arc<dyn Store>,
    input: mpsc::Receiver<WorkerOutput>,
    events: mpsc::UnboundedSender<WriterEvent>,
    max_buffered: usize,
}

impl DbWriter {
    /// Spawn the writer with the given channel capacity (records-level
    /// backpressure bound) and buffer cap.
    pub fn spawn(
        store: Arc<dyn Store>,
        events: mpsc::UnboundedSender<WriterEvent>,
        channel_capacity: usize,
        max_buffered: usize,
    ) -> WriterHandle {
        let (input_tx, input_rx) = mpsc::channel(channel_capacity);
        let writer = Self {
            store,
            input: input_rx,
            events,
            max_buffered,
        };
        WriterHandle {
            input: input_tx,
            join: tokio::spawn(writer.run()),
        }
    }

    #[instrument(skip_all)]
    async fn run(mut self) -> Result<(), StorageError> {
        let mut buffer = RecordBatch::default();

        while let Some(message) = self.input.recv().await {
            match message {
                WorkerOutput::Records(batch) => {
                    buffer.extrinsics.extend(batch.extrinsics);
                    buffer.staking_events.extend(batch.staking_events);

                    if buffer.len() >= self.max_buffered {
                        debug!(buffered = buffer.len(), "flushing records without marker");
                        self.commit(&mut buffer, &[]).await?;
                    }
                }
                WorkerOutput::Checkpoint(checkpoints) => {
                    self.commit(&mut buffer, &checkpoints).await?;
                    for checkpoint in &checkpoints {
                        record_checkpoint_advanced(checkpoint.stream.as_str());
                    }
                }
            }
        }

        // Channel closed: flush whatever is left, without advancing
        // any checkpoint.
        self.commit(&mut buffer, &[]).await
    }

    async fn commit(
        &self,
        buffer: &mut RecordBatch,
        checkpoints: &[watchtower_core::models::Checkpoint],
    ) -> Result<(), StorageError> {
        if buffer.is_empty() && checkpoints.is_empty() {
            return Ok(());
        }

        match self.store.commit_batch(buffer, checkpoints).await {
            Ok(()) => {
                debug!(
                    records = buffer.len(),
                    checkpoints = checkpoints.len(),
                    "batch committed"
                );
                *buffer = RecordBatch::default();
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "storage write failed, stopping writer");
                let _ = self.events.send(WriterEvent::Fatal {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use watchtower_core::models::{
        AccountId, BlockHash, Checkpoint, ExtrinsicRecord, StreamKind, TimeRange,
    };
    use watchtower_storage::{Database, SqliteStore};

    async fn store() -> Arc<dyn Store> {
        Arc::new(SqliteStore::new(Arc::new(
            Database::in_memory().await.unwrap(),
        )))
    }

    fn record(height: u64) -> ExtrinsicRecord {
        ExtrinsicRecord {
            chain: "kusama".into(),
            block_height: height,
            extrinsic_index: 1,
            block_hash: BlockHash([height as u8; 32]),
            block_timestamp: None,
            signer: Some(AccountId([0xaa; 32])),
            call_module: "Balances".into(),
            call_function: "transfer".into(),
            success: true,
            tip: 0,
            fee: None,
            params: serde_json::json!({}),
            matched: BTreeSet::from([AccountId([0x20; 32])]),
        }
    }

    fn batch(heights: &[u64]) -> WorkerOutput {
        WorkerOutput::Records(RecordBatch {
            extrinsics: heights.iter().map(|h| record(*h)).collect(),
            staking_events: Vec::new(),
        })
    }

    fn marker(height: u64) -> WorkerOutput {
        WorkerOutput::Checkpoint(vec![Checkpoint {
            chain: "kusama".into(),
            pubkey: AccountId([0x20; 32]),
            stream: StreamKind::Extrinsics,
            height,
        }])
    }

    #[tokio::test]
    async fn commits_records_with_their_marker() {
        let store = store().await;
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let handle = DbWriter::spawn(store.clone(), events_tx, 64, 4096);

        handle.input.send(batch(&[100, 101])).await.unwrap();
        handle.input.send(marker(101)).await.unwrap();
        drop(handle.input);
        handle.join.await.unwrap().unwrap();

        let records = store
            .extrinsics()
            .get_extrinsics("kusama", &AccountId([0x20; 32]), TimeRange::default())
            .await
            .unwrap();
        assert_eq!(records.len(), 2);

        let checkpoint = store
            .checkpoints()
            .get_checkpoint("kusama", &AccountId([0x20; 32]), StreamKind::Extrinsics)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.height, 101);
    }

    #[tokio::test]
    async fn records_without_marker_leave_checkpoint_behind() {
        let store = store().await;
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let handle = DbWriter::spawn(store.clone(), events_tx, 64, 4096);

        handle.input.send(batch(&[100])).await.unwrap();
        drop(handle.input);
        handle.join.await.unwrap().unwrap();

        // The record is durable, the checkpoint never moved.
        let records = store
            .extrinsics()
            .get_extrinsics("kusama", &AccountId([0x20; 32]), TimeRange::default())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);

        let checkpoint = store
            .checkpoints()
            .get_checkpoint("kusama", &AccountId([0x20; 32]), StreamKind::Extrinsics)
            .await
            .unwrap();
        assert!(checkpoint.is_none());
    }

    #[tokio::test]
    async fn buffer_overflow_flushes_records_only() {
        let store = store().await;
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        // Tiny buffer cap so the second batch forces a flush.
        let handle = DbWriter::spawn(store.clone(), events_tx, 64, 2);

        handle.input.send(batch(&[100, 101])).await.unwrap();
        handle.input.send(batch(&[102])).await.unwrap();

        // Give the writer a beat, then confirm records landed without
        // any checkpoint.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let records = store
            .extrinsics()
            .get_extrinsics("kusama", &AccountId([0x20; 32]), TimeRange::default())
            .await
            .unwrap();
        assert!(records.len() >= 2);
        let checkpoint = store
            .checkpoints()
            .get_checkpoint("kusama", &AccountId([0x20; 32]), StreamKind::Extrinsics)
            .await
            .unwrap();
        assert!(checkpoint.is_none());

        handle.input.send(marker(102)).await.unwrap();
        drop(handle.input);
        handle.join.await.unwrap().unwrap();

        let checkpoint = store
            .checkpoints()
            .get_checkpoint("kusama", &AccountId([0x20; 32]), StreamKind::Extrinsics)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.height, 102);
    }
}
