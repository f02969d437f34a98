//! Timer-driven synthetic events.
//!
//! An interjection periodically injects a user callback into a partition
//! worker's serial loop, for work such as flushing aggregates on a schedule.
//! Each assigned partition gets its own instance, bound to that partition and
//! to the worker's one-slot delivery channel. After every firing the worker
//! re-arms the timer, so an interjection is never in flight twice.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::event_context::EventContext;
use crate::traits::Interjector;
use crate::types::{ExecutionState, TopicPartition};

pub struct Interjection<S> {
    interjector: Arc<dyn Interjector<S>>,
    interval: Duration,
    /// Invoked when the interjection is dropped on the floor during
    /// revocation, so one-shot interjections do not leak waiting callers.
    cancel_hook: Option<Box<dyn Fn() + Send + Sync>>,
    topic_partition: Option<TopicPartition>,
    delivery: Option<mpsc::Sender<Arc<Interjection<S>>>>,
    token: CancellationToken,
}

impl<S: Send + Sync + 'static> Interjection<S> {
    pub fn new(interval: Duration, interjector: Arc<dyn Interjector<S>>) -> Self {
        Self {
            interjector,
            interval,
            cancel_hook: None,
            topic_partition: None,
            delivery: None,
            token: CancellationToken::new(),
        }
    }

    pub fn with_cancel_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.cancel_hook = Some(Box::new(hook));
        self
    }

    /// Bind this interjection to its partition and delivery channel. Called
    /// once per partition during worker activation, before the first tick.
    pub(crate) fn init(
        &mut self,
        topic_partition: TopicPartition,
        delivery: mpsc::Sender<Arc<Interjection<S>>>,
    ) {
        self.topic_partition = Some(topic_partition);
        self.delivery = Some(delivery);
    }

    /// Arm the next firing. When the timer elapses the interjection sends
    /// itself onto the worker's channel; cancellation wins the race on stop.
    pub(crate) fn tick(self: Arc<Self>) {
        let interjection = self;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(interjection.interval) => {
                    if let Some(delivery) = &interjection.delivery {
                        let _ = delivery.send(Arc::clone(&interjection)).await;
                    }
                }
                _ = interjection.token.cancelled() => {
                    if let Some(topic_partition) = &interjection.topic_partition {
                        debug!(topic_partition = %topic_partition, "interjection timer cancelled");
                    }
                }
            }
        });
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    /// Run the revocation-time cancel hook, if any.
    pub(crate) fn on_revoked(&self) {
        if let Some(hook) = &self.cancel_hook {
            hook();
        }
    }

    pub(crate) async fn interject(&self, ctx: &Arc<EventContext<S>>) -> Result<ExecutionState> {
        self.interjector.interject(ctx).await
    }
}
