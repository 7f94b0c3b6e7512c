//! Core business logic services.

mod worker;

pub use worker::{
    FatalKind, IndexerWorker, PlannedAccount, WorkerCommand, WorkerConfig, WorkerEvent,
    WorkerHandle, WorkerOutput, WorkerState, WorkerStatus,
};
