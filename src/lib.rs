//! Per-partition processing core for exactly-once Kafka event streaming.
//!
//! Three subsystems cooperate for every assigned topic-partition:
//!
//! 1. A [`PartitionWorker`] that owns the partition's state and serially
//!    drives inbound records, scheduled interjections, and async job
//!    completions in strict offset order.
//! 2. An [`AsyncBatcher`] that groups work items by key into bounded,
//!    concurrently-executing batches while keeping per-key ordering.
//! 3. An async completer that marshals externally-completed work back onto
//!    the worker's own task, so completion marks stay serialized with commit
//!    ordering.
//!
//! The Kafka wire client, the transactional producer pool, and the changelog
//! snapshotting machinery are collaborators behind the traits in [`traits`].

pub mod batcher;
pub mod completer;
pub mod config;
pub mod errors;
pub mod event_context;
pub mod interjection;
pub mod metrics_consts;
pub mod run_status;
pub mod traits;
pub mod types;
pub mod worker;

#[cfg(test)]
pub mod test_utils;

// Public API - what users of the library should reach for.
pub use batcher::{AsyncBatcher, Batch, BatchCallback, BatchExecutor, BatchItem};
pub use completer::{AsyncCompleter, AsyncJob};
pub use config::EosWorkerConfig;
pub use errors::{BatchExecutionError, ProduceError};
pub use event_context::{EventContext, INTERJECTION_OFFSET};
pub use interjection::Interjection;
pub use run_status::RunStatus;
pub use traits::{
    ChangeLogPartition, CommitLog, EosProducerPool, EventProcessor, Interjector, ProducerHandle,
    TransactionalProducer,
};
pub use types::{ExecutionState, TopicPartition, WorkerState};
pub use worker::PartitionWorker;
