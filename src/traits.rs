//! Contracts for the collaborators of the per-partition core.
//!
//! The wire client, the transactional producer pool, and the changelog
//! snapshotting machinery all live outside this crate; the worker talks to
//! them exclusively through these traits.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rdkafka::message::OwnedMessage;

use crate::errors::ProduceError;
use crate::event_context::EventContext;
use crate::types::{ExecutionState, TopicPartition};

/// Handle onto the producer transaction an event context was enrolled in.
/// Delivered through the context's one-shot handoff once the pool has claimed
/// the context into a transaction batch.
pub type ProducerHandle = Arc<dyn TransactionalProducer>;

/// The only operation processors need from a claimed producer: staging output
/// records into the transaction that will commit this context's offset.
#[async_trait]
pub trait TransactionalProducer: Send + Sync {
    async fn produce(&self, record: OwnedMessage) -> Result<(), ProduceError>;
}

/// The transactional producer pool, as seen from a partition worker.
///
/// The pool enrolls contexts into transaction batches and later resolves each
/// context's producer handoff with `Some(handle)`, or `None` if the
/// transaction aborted or the partition was revoked first. A completed
/// context (`EventContext::complete`) tells the pool the context's records
/// can be committed together with offset + 1.
pub trait EosProducerPool<S>: Send + Sync {
    fn add_event_context(&self, ctx: &Arc<EventContext<S>>);
    fn add_interjection(&self, ctx: &Arc<EventContext<S>>);
}

/// Lookup of the progress a previous incarnation of a worker left behind.
#[async_trait]
pub trait CommitLog: Send + Sync {
    /// The highest committed offset + 1 for the partition, or -1 when the
    /// partition has never been processed.
    async fn last_processed(&self, topic_partition: &TopicPartition) -> i64;
}

/// View onto the replicated state store backing one partition.
pub trait ChangeLogPartition<S>: Send + Sync {
    fn changelog_data(&self) -> Arc<S>;
}

/// User-supplied record handler.
#[async_trait]
pub trait EventProcessor<S>: Send + Sync {
    /// Handle one record. Returning [`ExecutionState::Incomplete`] promises a
    /// later resolution through
    /// [`EventContext::async_job_complete`](crate::event_context::EventContext::async_job_complete).
    async fn process(
        &self,
        ctx: &Arc<EventContext<S>>,
        record: &OwnedMessage,
    ) -> Result<ExecutionState>;
}

/// User-supplied handler for timer-driven synthetic events. Same return
/// contract as [`EventProcessor`], without an input record.
#[async_trait]
pub trait Interjector<S>: Send + Sync {
    async fn interject(&self, ctx: &Arc<EventContext<S>>) -> Result<ExecutionState>;
}
