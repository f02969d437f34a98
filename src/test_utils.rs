//! Shared fixtures: controllable collaborators and record builders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use rdkafka::message::{OwnedHeaders, OwnedMessage, Timestamp};

use crate::errors::ProduceError;
use crate::event_context::EventContext;
use crate::traits::{
    ChangeLogPartition, CommitLog, EosProducerPool, EventProcessor, Interjector, ProducerHandle,
    TransactionalProducer,
};
use crate::types::{ExecutionState, TopicPartition};

pub fn test_record(topic: &str, partition: i32, offset: i64) -> OwnedMessage {
    OwnedMessage::new(
        Some(b"payload".to_vec()),
        Some(b"key".to_vec()),
        topic.to_string(),
        Timestamp::now(),
        partition,
        offset,
        Some(OwnedHeaders::new()),
    )
}

pub struct NoopProducer;

#[async_trait]
impl TransactionalProducer for NoopProducer {
    async fn produce(&self, _record: OwnedMessage) -> Result<(), ProduceError> {
        Ok(())
    }
}

pub fn noop_producer() -> ProducerHandle {
    Arc::new(NoopProducer)
}

/// How the test pool resolves producer handoffs.
#[derive(Debug, Clone, Copy)]
pub enum DeliveryMode {
    /// Claim every context immediately with a no-op producer.
    Immediate,
    /// Reject every context, as an aborting pool would.
    Reject,
    /// Leave handoffs unresolved; the test delivers by hand.
    Manual,
}

pub struct TestProducerPool<S> {
    mode: DeliveryMode,
    event_contexts: Mutex<Vec<Arc<EventContext<S>>>>,
    interjection_contexts: Mutex<Vec<Arc<EventContext<S>>>>,
}

impl<S> TestProducerPool<S> {
    pub fn new(mode: DeliveryMode) -> Self {
        Self {
            mode,
            event_contexts: Mutex::new(Vec::new()),
            interjection_contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn event_contexts(&self) -> Vec<Arc<EventContext<S>>> {
        self.event_contexts.lock().unwrap().clone()
    }

    pub fn interjection_contexts(&self) -> Vec<Arc<EventContext<S>>> {
        self.interjection_contexts.lock().unwrap().clone()
    }

    fn resolve(&self, ctx: &Arc<EventContext<S>>)
    where
        S: Send + Sync + 'static,
    {
        match self.mode {
            DeliveryMode::Immediate => ctx.deliver_producer(Some(noop_producer())),
            DeliveryMode::Reject => ctx.deliver_producer(None),
            DeliveryMode::Manual => {}
        }
    }
}

impl<S: Send + Sync + 'static> EosProducerPool<S> for TestProducerPool<S> {
    fn add_event_context(&self, ctx: &Arc<EventContext<S>>) {
        self.event_contexts.lock().unwrap().push(ctx.clone());
        self.resolve(ctx);
    }

    fn add_interjection(&self, ctx: &Arc<EventContext<S>>) {
        self.interjection_contexts.lock().unwrap().push(ctx.clone());
        self.resolve(ctx);
    }
}

pub struct MemoryCommitLog {
    offsets: HashMap<TopicPartition, i64>,
}

impl MemoryCommitLog {
    pub fn with_offset(topic_partition: TopicPartition, offset: i64) -> Self {
        let mut offsets = HashMap::new();
        offsets.insert(topic_partition, offset);
        Self { offsets }
    }
}

#[async_trait]
impl CommitLog for MemoryCommitLog {
    async fn last_processed(&self, topic_partition: &TopicPartition) -> i64 {
        self.offsets.get(topic_partition).copied().unwrap_or(-1)
    }
}

pub struct StaticChangeLog<S> {
    data: Arc<S>,
}

impl<S: Default> Default for StaticChangeLog<S> {
    fn default() -> Self {
        Self {
            data: Arc::new(S::default()),
        }
    }
}

impl<S: Send + Sync> ChangeLogPartition<S> for StaticChangeLog<S> {
    fn changelog_data(&self) -> Arc<S> {
        self.data.clone()
    }
}

/// Records the offsets it sees and returns a fixed execution state.
pub struct RecordingProcessor {
    offsets: Mutex<Vec<i64>>,
    result: ExecutionState,
}

impl RecordingProcessor {
    pub fn new(result: ExecutionState) -> Self {
        Self {
            offsets: Mutex::new(Vec::new()),
            result,
        }
    }

    pub fn offsets(&self) -> Vec<i64> {
        self.offsets.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventProcessor<()> for RecordingProcessor {
    async fn process(
        &self,
        ctx: &Arc<EventContext<()>>,
        _record: &OwnedMessage,
    ) -> Result<ExecutionState> {
        self.offsets.lock().unwrap().push(ctx.offset());
        Ok(self.result)
    }
}

pub struct CountingInterjector {
    invocations: AtomicUsize,
    result: ExecutionState,
}

impl CountingInterjector {
    pub fn new(result: ExecutionState) -> Self {
        Self {
            invocations: AtomicUsize::new(0),
            result,
        }
    }

    pub fn count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Interjector<()> for CountingInterjector {
    async fn interject(&self, _ctx: &Arc<EventContext<()>>) -> Result<ExecutionState> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(self.result)
    }
}
