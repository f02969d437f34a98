//! Per-event state carrier.
//!
//! An [`EventContext`] travels with one record (or one interjection) from the
//! pusher, through the producer pool's transaction enrollment, to the user
//! processor and any async completions. It owns the one-shot producer handoff
//! with the pool and the idempotent completion mark that releases the offset
//! for commit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::Result;
use rdkafka::message::OwnedMessage;
use rdkafka::Message;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

use crate::completer::{AsyncCompleter, AsyncJob};
use crate::traits::ProducerHandle;
use crate::types::{ExecutionState, TopicPartition};
use crate::worker::RevocationWaiter;

/// Offset carried by interjection contexts, which have no input record.
pub const INTERJECTION_OFFSET: i64 = -1;

pub struct EventContext<S> {
    topic_partition: TopicPartition,
    offset: i64,
    record: Option<OwnedMessage>,
    changelog: Arc<S>,
    completer: AsyncCompleter<S>,
    waiter: RevocationWaiter,

    /// Written at most once by the pool; `None` is the abort sentinel.
    producer_tx: Mutex<Option<oneshot::Sender<Option<ProducerHandle>>>>,
    producer_rx: Mutex<Option<oneshot::Receiver<Option<ProducerHandle>>>>,
    producer: Mutex<Option<ProducerHandle>>,

    completed: AtomicBool,
    completion: Notify,
    waiter_resolved: AtomicBool,
    self_ref: Weak<EventContext<S>>,
}

impl<S: Send + Sync + 'static> EventContext<S> {
    pub(crate) fn new_record(
        topic_partition: TopicPartition,
        record: OwnedMessage,
        changelog: Arc<S>,
        completer: AsyncCompleter<S>,
        waiter: RevocationWaiter,
    ) -> Arc<Self> {
        let offset = record.offset();
        Self::build(
            topic_partition,
            offset,
            Some(record),
            changelog,
            completer,
            waiter,
        )
    }

    pub(crate) fn new_interjection(
        topic_partition: TopicPartition,
        changelog: Arc<S>,
        completer: AsyncCompleter<S>,
        waiter: RevocationWaiter,
    ) -> Arc<Self> {
        Self::build(
            topic_partition,
            INTERJECTION_OFFSET,
            None,
            changelog,
            completer,
            waiter,
        )
    }

    fn build(
        topic_partition: TopicPartition,
        offset: i64,
        record: Option<OwnedMessage>,
        changelog: Arc<S>,
        completer: AsyncCompleter<S>,
        waiter: RevocationWaiter,
    ) -> Arc<Self> {
        let (producer_tx, producer_rx) = oneshot::channel();
        Arc::new_cyclic(|self_ref| Self {
            topic_partition,
            offset,
            record,
            changelog,
            completer,
            waiter,
            producer_tx: Mutex::new(Some(producer_tx)),
            producer_rx: Mutex::new(Some(producer_rx)),
            producer: Mutex::new(None),
            completed: AtomicBool::new(false),
            completion: Notify::new(),
            waiter_resolved: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    /// The record's offset, or [`INTERJECTION_OFFSET`] for interjections.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// The input record; absent for interjections.
    pub fn record(&self) -> Option<&OwnedMessage> {
        self.record.as_ref()
    }

    pub fn is_interjection(&self) -> bool {
        self.record.is_none()
    }

    /// Read/write view onto the partition's state store.
    pub fn changelog(&self) -> &Arc<S> {
        &self.changelog
    }

    /// Resolve the producer handoff. Called by the producer pool once this
    /// context is claimed into a transaction batch (`Some`), or when the
    /// transaction aborts or revocation races (`None`). At most one delivery
    /// takes effect; either way the revocation waiter is released.
    pub fn deliver_producer(&self, producer: Option<ProducerHandle>) {
        let tx = self.producer_tx.lock().unwrap().take();
        match tx {
            Some(tx) => {
                // The receiving side may already be gone if the work loop
                // exited; the waiter resolution below is what matters then.
                let _ = tx.send(producer);
                self.resolve_waiter();
            }
            None => warn!(
                topic = self.topic_partition.topic(),
                partition = self.topic_partition.partition(),
                offset = self.offset,
                "producer handoff already resolved"
            ),
        }
    }

    /// Wait for the producer handoff and cache the handle. Returns `None`
    /// when the pool aborted this context (revocation) or dropped the handoff
    /// without resolving it.
    pub async fn producer(&self) -> Option<ProducerHandle> {
        if let Some(handle) = self.producer.lock().unwrap().as_ref() {
            return Some(handle.clone());
        }
        let rx = self.producer_rx.lock().unwrap().take()?;
        match rx.await {
            Ok(Some(handle)) => {
                *self.producer.lock().unwrap() = Some(handle.clone());
                Some(handle)
            }
            Ok(None) => None,
            Err(_) => {
                // The pool dropped the sender without resolving the handoff;
                // treat it as an abort so the revocation drain can finish.
                self.resolve_waiter();
                None
            }
        }
    }

    /// Mark this context committed-pending: the producer pool will commit the
    /// offset together with the context's staged records. Idempotent.
    pub fn complete(&self) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(
            topic = self.topic_partition.topic(),
            partition = self.topic_partition.partition(),
            offset = self.offset,
            "event context complete"
        );
        self.completion.notify_waiters();
    }

    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Resolves once [`complete`](Self::complete) has been called.
    pub async fn wait_complete(&self) {
        loop {
            if self.is_complete() {
                return;
            }
            let notified = self.completion.notified();
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }

    /// Submit a completion job to be finalized on the partition worker's own
    /// task, preserving commit ordering. Blocks only while the async-job
    /// channel is saturated.
    pub async fn async_job_complete<F>(&self, finalize: F)
    where
        F: FnOnce() -> Result<ExecutionState> + Send + 'static,
    {
        let Some(ctx) = self.self_ref.upgrade() else {
            return;
        };
        self.completer.submit(AsyncJob::new(ctx, finalize)).await;
    }

    fn resolve_waiter(&self) {
        if !self.waiter_resolved.swap(true, Ordering::AcqRel) {
            self.waiter.done();
        }
    }
}
