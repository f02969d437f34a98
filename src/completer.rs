//! Bounded fan-in of externally-completed work.
//!
//! Processing that returns [`ExecutionState::Incomplete`] is finished later
//! by some external system. Those completions must not touch worker state
//! from foreign tasks, so they are marshalled through a bounded channel and
//! finalized on the partition worker's own loop, keeping commit ordering
//! intact.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::event_context::EventContext;
use crate::metrics_consts::ASYNC_JOBS_SATURATED_TOTAL;
use crate::types::ExecutionState;

/// A deferred completion: the event context it belongs to plus the
/// finalizer the worker runs to learn the outcome.
pub struct AsyncJob<S> {
    ctx: Arc<EventContext<S>>,
    finalize: Box<dyn FnOnce() -> Result<ExecutionState> + Send>,
}

impl<S> AsyncJob<S> {
    pub(crate) fn new<F>(ctx: Arc<EventContext<S>>, finalize: F) -> Self
    where
        F: FnOnce() -> Result<ExecutionState> + Send + 'static,
    {
        Self {
            ctx,
            finalize: Box::new(finalize),
        }
    }

    /// Run the finalizer, yielding the context and its outcome.
    pub(crate) fn finalize(self) -> (Arc<EventContext<S>>, Result<ExecutionState>) {
        let result = (self.finalize)();
        (self.ctx, result)
    }
}

/// Submission handle onto a worker's async-job channel. Cheap to clone; every
/// event context carries one.
pub struct AsyncCompleter<S> {
    jobs_tx: mpsc::Sender<AsyncJob<S>>,
    full_reply: Arc<Notify>,
}

impl<S> Clone for AsyncCompleter<S> {
    fn clone(&self) -> Self {
        Self {
            jobs_tx: self.jobs_tx.clone(),
            full_reply: self.full_reply.clone(),
        }
    }
}

impl<S> AsyncCompleter<S> {
    pub(crate) fn channel(capacity: usize) -> (Self, AsyncJobQueue<S>) {
        let (jobs_tx, jobs_rx) = mpsc::channel(capacity);
        let full_reply = Arc::new(Notify::new());
        (
            Self {
                jobs_tx,
                full_reply: full_reply.clone(),
            },
            AsyncJobQueue {
                jobs_rx,
                full_reply,
            },
        )
    }

    /// Enqueue a completion job. Fast path is a non-blocking send; when the
    /// channel is full the caller parks on the single-slot reply signal the
    /// worker fires after each drain.
    pub(crate) async fn submit(&self, job: AsyncJob<S>) {
        let mut job = job;
        loop {
            match self.jobs_tx.try_send(job) {
                Ok(()) => return,
                Err(TrySendError::Full(returned)) => {
                    warn!(
                        "async job channel full, incoming events are outpacing async completions"
                    );
                    metrics::counter!(ASYNC_JOBS_SATURATED_TOTAL).increment(1);
                    job = returned;
                    self.full_reply.notified().await;
                }
                Err(TrySendError::Closed(_)) => {
                    // Worker already stopped; the job's offset was never
                    // committed and will be redelivered after reassignment.
                    debug!("async job dropped, worker stopped");
                    return;
                }
            }
        }
    }
}

/// The worker-side end of the async-job channel.
pub(crate) struct AsyncJobQueue<S> {
    jobs_rx: mpsc::Receiver<AsyncJob<S>>,
    full_reply: Arc<Notify>,
}

impl<S> AsyncJobQueue<S> {
    pub(crate) async fn recv(&mut self) -> Option<AsyncJob<S>> {
        self.jobs_rx.recv().await
    }

    /// Offer one slot to a saturated submitter. Coalesced: at most one
    /// permit is stored when nobody is waiting.
    pub(crate) fn drained(&self) {
        self.full_reply.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<AsyncJob<S>> {
        self.jobs_rx.try_recv().ok()
    }
}
