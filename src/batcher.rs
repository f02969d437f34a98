//! Key-sharded batching with bounded concurrent execution.
//!
//! Items are grouped by key into a fixed set of slots. A slot dispatches when
//! it reaches the maximum batch size or when its flush timer elapses,
//! whichever comes first. While a slot executes, its keys stay assigned to
//! it, so a key can never be in two in-flight batches at once; items that
//! cannot be placed park in a FIFO pending queue and drain when a slot
//! frees up. Completions fan back into each item's originating batch, whose
//! terminal action releases the batch's event context.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::BatchExecutionError;
use crate::event_context::EventContext;
use crate::metrics_consts::{
    BATCHER_BATCHES_DISPATCHED_TOTAL, BATCHER_EXECUTING_BATCHES, BATCHER_EXECUTOR_FAILURES_TOTAL,
    BATCHER_PENDING_ITEMS,
};
use crate::types::ExecutionState;

const DEFAULT_BATCH_DELAY: Duration = Duration::from_millis(5);

/// Runs one dispatched batch. Implementations own their error handling; a
/// returned error is forwarded on the batcher's error outlet, never retried.
/// Item completion is the batcher's job, not the executor's.
#[async_trait]
pub trait BatchExecutor<K, V>: Send + Sync {
    async fn execute(&self, items: &[BatchItem<K, V>]) -> Result<()>;
}

/// Completion fan-in seam between an item and the batch it came from. Erased
/// so items carry no state-store type parameter.
#[async_trait]
trait ItemCompletion: Send + Sync {
    async fn complete_item(&self);
}

/// One keyed unit of work inside a batch.
pub struct BatchItem<K, V> {
    key: K,
    value: V,
    parent: Arc<dyn ItemCompletion>,
}

impl<K, V> BatchItem<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub(crate) async fn complete(&self) {
        self.parent.complete_item().await;
    }
}

/// Invoked once when every item of a batch has completed, in place of the
/// default path that marks the batch's event context complete.
pub type BatchCallback<S> = Box<dyn FnOnce(&Arc<EventContext<S>>) + Send>;

struct BatchCore<S> {
    event_context: Arc<EventContext<S>>,
    /// Item count, set when the batch is submitted. Zero means unsubmitted.
    expected: AtomicUsize,
    completed: AtomicUsize,
    callback: Mutex<Option<BatchCallback<S>>>,
}

impl<S: Send + Sync + 'static> BatchCore<S> {
    /// The terminal action: the user callback if one was supplied, otherwise
    /// an async job that resolves the event context as complete. Fires
    /// exactly once per batch.
    async fn finish(&self) {
        let callback = self.callback.lock().unwrap().take();
        match callback {
            Some(callback) => callback(&self.event_context),
            None => {
                self.event_context
                    .async_job_complete(|| Ok(ExecutionState::Complete))
                    .await;
            }
        }
    }
}

#[async_trait]
impl<S: Send + Sync + 'static> ItemCompletion for BatchCore<S> {
    async fn complete_item(&self) {
        let done = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        let expected = self.expected.load(Ordering::Acquire);
        if done == expected {
            self.finish().await;
        } else if done > expected {
            warn!(
                completed = done,
                expected, "batch item completed after terminal action"
            );
        }
    }
}

/// A group of keyed items tied to one event context. Items are added before
/// submission; submitting consumes the batch, so nothing can append to an
/// in-flight batch.
pub struct Batch<S, K, V> {
    core: Arc<BatchCore<S>>,
    items: Vec<BatchItem<K, V>>,
}

impl<S: Send + Sync + 'static, K, V> Batch<S, K, V> {
    pub fn new(event_context: Arc<EventContext<S>>) -> Self {
        Self {
            core: Arc::new(BatchCore {
                event_context,
                expected: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
                callback: Mutex::new(None),
            }),
            items: Vec::new(),
        }
    }

    pub fn with_callback(
        event_context: Arc<EventContext<S>>,
        callback: impl FnOnce(&Arc<EventContext<S>>) + Send + 'static,
    ) -> Self {
        let batch = Self::new(event_context);
        *batch.core.callback.lock().unwrap() = Some(Box::new(callback));
        batch
    }

    /// Append an item, chainable.
    pub fn add(mut self, key: K, value: V) -> Self {
        self.push(key, value);
        self
    }

    pub fn push(&mut self, key: K, value: V) {
        let parent: Arc<dyn ItemCompletion> = self.core.clone();
        self.items.push(BatchItem { key, value, parent });
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn event_context(&self) -> &Arc<EventContext<S>> {
        &self.core.event_context
    }

    fn into_parts(self) -> (Arc<BatchCore<S>>, Vec<BatchItem<K, V>>) {
        (self.core, self.items)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Ready,
    Executing,
}

struct BatchSlot<K, V> {
    items: Vec<BatchItem<K, V>>,
    state: SlotState,
    flush_timer: Option<JoinHandle<()>>,
}

struct BatcherState<K, V> {
    slots: Vec<BatchSlot<K, V>>,
    /// Key -> index of the slot currently holding (or executing) that key.
    assignments: HashMap<K, usize>,
    /// Items that found no placeable slot, in arrival order.
    pending: VecDeque<BatchItem<K, V>>,
    executing: usize,
}

struct BatcherInner<K, V> {
    state: Mutex<BatcherState<K, V>>,
    executor: Arc<dyn BatchExecutor<K, V>>,
    max_batch_size: usize,
    batch_delay: Duration,
    error_tx: mpsc::UnboundedSender<BatchExecutionError>,
}

/// The batching engine. Clones share one set of slots.
pub struct AsyncBatcher<K, V> {
    inner: Arc<BatcherInner<K, V>>,
    error_rx: Mutex<Option<mpsc::UnboundedReceiver<BatchExecutionError>>>,
}

impl<K, V> AsyncBatcher<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// `batch_delay` of zero falls back to 5 ms so an idle slot is flushed
    /// without busy polling.
    pub fn new(
        executor: Arc<dyn BatchExecutor<K, V>>,
        max_batch_size: usize,
        max_concurrent_batches: usize,
        batch_delay: Duration,
    ) -> Self {
        let slots = (0..max_concurrent_batches)
            .map(|_| BatchSlot {
                items: Vec::with_capacity(max_batch_size),
                state: SlotState::Ready,
                flush_timer: None,
            })
            .collect();
        let batch_delay = if batch_delay.is_zero() {
            DEFAULT_BATCH_DELAY
        } else {
            batch_delay
        };
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(BatcherInner {
                state: Mutex::new(BatcherState {
                    slots,
                    assignments: HashMap::new(),
                    pending: VecDeque::new(),
                    executing: 0,
                }),
                executor,
                max_batch_size,
                batch_delay,
                error_tx,
            }),
            error_rx: Mutex::new(Some(error_rx)),
        }
    }

    /// The typed outlet for executor failures. Yields `None` after the first
    /// call.
    pub fn take_error_receiver(&self) -> Option<mpsc::UnboundedReceiver<BatchExecutionError>> {
        self.error_rx.lock().unwrap().take()
    }

    /// Submit every item of a batch for asynchronous execution. Consuming the
    /// batch freezes its item set; the batch's terminal action fires once all
    /// items have executed.
    pub fn add<S: Send + Sync + 'static>(&self, batch: Batch<S, K, V>) {
        let (core, items) = batch.into_parts();
        core.expected.store(items.len(), Ordering::Release);
        if items.is_empty() {
            // The count-based trigger can never fire for zero items.
            tokio::spawn(async move { core.finish().await });
            return;
        }
        for item in items {
            self.submit_item(item);
        }
    }

    fn submit_item(&self, item: BatchItem<K, V>) {
        let mut state = self.inner.state.lock().unwrap();
        match target_slot(&state, &item.key) {
            Some(index) => place(&self.inner, &mut state, index, item),
            None => {
                state.pending.push_back(item);
                metrics::gauge!(BATCHER_PENDING_ITEMS).set(state.pending.len() as f64);
            }
        }
    }
}

/// Admission lookup. A key already assigned to a ready slot must go there to
/// preserve per-key ordering; a key assigned to an executing slot must wait
/// in the pending queue. Fresh keys take the first ready slot.
fn target_slot<K, V>(state: &BatcherState<K, V>, key: &K) -> Option<usize>
where
    K: Eq + Hash,
{
    if let Some(&index) = state.assignments.get(key) {
        return match state.slots[index].state {
            SlotState::Ready => Some(index),
            SlotState::Executing => None,
        };
    }
    state
        .slots
        .iter()
        .position(|slot| slot.state == SlotState::Ready)
}

fn place<K, V>(
    inner: &Arc<BatcherInner<K, V>>,
    state: &mut BatcherState<K, V>,
    index: usize,
    item: BatchItem<K, V>,
) where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    state.assignments.insert(item.key.clone(), index);
    state.slots[index].items.push(item);

    if state.slots[index].items.len() >= inner.max_batch_size {
        execute_slot(inner, state, index);
    } else if state.slots[index].flush_timer.is_none() {
        let timer_inner = Arc::clone(inner);
        state.slots[index].flush_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timer_inner.batch_delay).await;
            // A size-triggered dispatch may have won the race; execute_slot
            // re-checks the slot state under the lock.
            let mut state = timer_inner.state.lock().unwrap();
            execute_slot(&timer_inner, &mut state, index);
        }));
    }
}

/// Dispatch a slot if it is still ready: mark it executing, stop its flush
/// timer, and run the executor on a separate task with the lock released.
fn execute_slot<K, V>(inner: &Arc<BatcherInner<K, V>>, state: &mut BatcherState<K, V>, index: usize)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let slot = &mut state.slots[index];
    if slot.state != SlotState::Ready {
        return;
    }
    slot.state = SlotState::Executing;
    state.executing += 1;
    if let Some(timer) = slot.flush_timer.take() {
        timer.abort();
    }
    let items = std::mem::take(&mut slot.items);

    metrics::gauge!(BATCHER_EXECUTING_BATCHES).set(state.executing as f64);
    metrics::counter!(BATCHER_BATCHES_DISPATCHED_TOTAL).increment(1);
    debug!(slot = index, items = items.len(), "dispatching batch");

    let task_inner = Arc::clone(inner);
    tokio::spawn(async move {
        if let Err(source) = task_inner.executor.execute(&items).await {
            warn!(error = %source, items = items.len(), "batch executor failed");
            metrics::counter!(BATCHER_EXECUTOR_FAILURES_TOTAL).increment(1);
            let _ = task_inner.error_tx.send(BatchExecutionError {
                item_count: items.len(),
                source,
            });
        }
        for item in &items {
            item.complete().await;
        }

        let mut state = task_inner.state.lock().unwrap();
        state.executing -= 1;
        release_slot(&task_inner, &mut state, index, &items);
        metrics::gauge!(BATCHER_EXECUTING_BATCHES).set(state.executing as f64);
    });
}

/// Return a finished slot to service: clear exactly the keys this batch
/// contributed, mark the slot ready, and drain what the pending queue will
/// now admit.
fn release_slot<K, V>(
    inner: &Arc<BatcherInner<K, V>>,
    state: &mut BatcherState<K, V>,
    index: usize,
    finished: &[BatchItem<K, V>],
) where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    for item in finished {
        if state.assignments.get(&item.key).copied() == Some(index) {
            state.assignments.remove(&item.key);
        }
    }
    state.slots[index].state = SlotState::Ready;
    flush_pending(inner, state);
}

/// Walk the pending queue in order, moving each admissible item onto its
/// target slot. Items whose keys are still held by executing slots are left
/// in place. Stops early once every slot is executing.
fn flush_pending<K, V>(inner: &Arc<BatcherInner<K, V>>, state: &mut BatcherState<K, V>)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let mut i = 0;
    while i < state.pending.len() {
        match target_slot(state, &state.pending[i].key) {
            Some(index) => {
                let Some(item) = state.pending.remove(i) else {
                    break;
                };
                place(inner, state, index, item);
                if state.executing == state.slots.len() {
                    break;
                }
            }
            None => i += 1,
        }
    }
    metrics::gauge!(BATCHER_PENDING_ITEMS).set(state.pending.len() as f64);
}
