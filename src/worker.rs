//! Per-partition serial event loop.
//!
//! Each assigned topic-partition gets one worker. A pusher task fans inbound
//! record slices into event contexts (registering each with the producer
//! pool), and a single work task dispatches them to the user processor in
//! strict offset order, interleaved with interjections and async job
//! completions. Revocation drains cooperatively: the worker only reaches its
//! terminal state once every scheduled record has been claimed or rejected by
//! the producer pool.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rdkafka::message::OwnedMessage;
use rdkafka::Message;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::completer::{AsyncCompleter, AsyncJobQueue};
use crate::config::EosWorkerConfig;
use crate::event_context::EventContext;
use crate::interjection::Interjection;
use crate::metrics_consts::{
    WORKER_FATAL_SIGNALS_TOTAL, WORKER_INTERJECTIONS_TOTAL, WORKER_PENDING_EVENTS,
    WORKER_PROCESSED_EVENTS_TOTAL, WORKER_STALE_RECORDS_TOTAL,
};
use crate::run_status::RunStatus;
use crate::traits::{ChangeLogPartition, CommitLog, EosProducerPool, EventProcessor};
use crate::types::{ExecutionState, TopicPartition, WorkerState};

/// Count-down of in-flight records not yet claimed or rejected by the
/// producer pool. The revocation drain blocks on it reaching zero.
#[derive(Clone)]
pub(crate) struct RevocationWaiter {
    inner: Arc<WaiterInner>,
}

struct WaiterInner {
    count: AtomicI64,
    notify: Notify,
}

impl RevocationWaiter {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(WaiterInner {
                count: AtomicI64::new(0),
                notify: Notify::new(),
            }),
        }
    }

    pub(crate) fn add(&self, n: i64) {
        self.inner.count.fetch_add(n, Ordering::SeqCst);
    }

    pub(crate) fn done(&self) {
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) <= 1 {
            self.inner.notify.notify_waiters();
        }
    }

    pub(crate) async fn wait(&self) {
        loop {
            if self.inner.count.load(Ordering::SeqCst) <= 0 {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.inner.count.load(Ordering::SeqCst) <= 0 {
                return;
            }
            notified.await;
        }
    }

    #[cfg(test)]
    pub(crate) fn count(&self) -> i64 {
        self.inner.count.load(Ordering::SeqCst)
    }
}

struct WorkerShared {
    pending: AtomicI64,
    processed: AtomicI64,
    /// Last consumed offset + 1; records below it are stale.
    highest_offset: AtomicI64,
    state: AtomicU8,
    fatal: AtomicBool,
}

/// Everything both worker tasks share. Cheap to clone.
struct WorkerCtx<S> {
    topic_partition: TopicPartition,
    processor: Arc<dyn EventProcessor<S>>,
    pool: Arc<dyn EosProducerPool<S>>,
    changelog: Arc<dyn ChangeLogPartition<S>>,
    completer: AsyncCompleter<S>,
    waiter: RevocationWaiter,
    shared: Arc<WorkerShared>,
    run_status: RunStatus,
}

impl<S> Clone for WorkerCtx<S> {
    fn clone(&self) -> Self {
        Self {
            topic_partition: self.topic_partition.clone(),
            processor: self.processor.clone(),
            pool: self.pool.clone(),
            changelog: self.changelog.clone(),
            completer: self.completer.clone(),
            waiter: self.waiter.clone(),
            shared: self.shared.clone(),
            run_status: self.run_status.clone(),
        }
    }
}

impl<S> WorkerCtx<S> {
    fn set_state(&self, next: WorkerState) {
        let previous = self.shared.state.swap(next.as_u8(), Ordering::SeqCst);
        if previous != next.as_u8() {
            debug!(
                topic_partition = %self.topic_partition,
                from = ?WorkerState::from_u8(previous),
                to = ?next,
                "worker state transition"
            );
        }
    }

    fn publish_pending(&self) {
        metrics::gauge!(
            WORKER_PENDING_EVENTS,
            "topic" => self.topic_partition.topic().to_string(),
            "partition" => self.topic_partition.partition().to_string()
        )
        .set(self.shared.pending.load(Ordering::SeqCst) as f64);
    }
}

struct WorkChannels<S> {
    event_rx: mpsc::Receiver<Arc<EventContext<S>>>,
    event_tx: mpsc::Sender<Arc<EventContext<S>>>,
    jobs: AsyncJobQueue<S>,
    interjection_rx: mpsc::Receiver<Arc<Interjection<S>>>,
    interjection_tx: mpsc::Sender<Arc<Interjection<S>>>,
    partition_rx: mpsc::Receiver<Vec<OwnedMessage>>,
    stop_tx: mpsc::Sender<()>,
    stop_rx: mpsc::Receiver<()>,
    revoked_tx: mpsc::Sender<()>,
    revoked_rx: mpsc::Receiver<()>,
    stopped_tx: oneshot::Sender<()>,
    stopped_rx: oneshot::Receiver<()>,
}

/// Handle onto one partition's processing tasks. Created on assignment, torn
/// down via [`revoke`](Self::revoke)/[`shutdown`](Self::shutdown) on
/// revocation.
pub struct PartitionWorker {
    topic_partition: TopicPartition,
    partition_input: mpsc::Sender<Vec<OwnedMessage>>,
    run_status: RunStatus,
    shared: Arc<WorkerShared>,
    work_handle: Option<JoinHandle<()>>,
}

impl PartitionWorker {
    pub fn new<S: Send + Sync + 'static>(
        topic_partition: TopicPartition,
        processor: Arc<dyn EventProcessor<S>>,
        interjections: Vec<Interjection<S>>,
        pool: Arc<dyn EosProducerPool<S>>,
        commit_log: Arc<dyn CommitLog>,
        changelog: Arc<dyn ChangeLogPartition<S>>,
        changelog_ready: oneshot::Receiver<()>,
        parent: &RunStatus,
        config: &EosWorkerConfig,
    ) -> Self {
        let (partition_input, partition_rx) = mpsc::channel(config.partition_input_capacity);
        let (event_tx, event_rx) = mpsc::channel(config.event_input_capacity);
        let (completer, jobs) = AsyncCompleter::channel(config.async_job_capacity);
        let (interjection_tx, interjection_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (revoked_tx, revoked_rx) = mpsc::channel(1);
        let (stopped_tx, stopped_rx) = oneshot::channel();

        let shared = Arc::new(WorkerShared {
            pending: AtomicI64::new(0),
            processed: AtomicI64::new(0),
            highest_offset: AtomicI64::new(-1),
            state: AtomicU8::new(WorkerState::Initializing.as_u8()),
            fatal: AtomicBool::new(false),
        });

        let ctx = WorkerCtx {
            topic_partition: topic_partition.clone(),
            processor,
            pool,
            changelog,
            completer,
            waiter: RevocationWaiter::new(),
            shared: shared.clone(),
            run_status: parent.fork(),
        };
        let run_status = ctx.run_status.clone();

        let channels = WorkChannels {
            event_rx,
            event_tx,
            jobs,
            interjection_rx,
            interjection_tx,
            partition_rx,
            stop_tx,
            stop_rx,
            revoked_tx,
            revoked_rx,
            stopped_tx,
            stopped_rx,
        };
        let work_handle =
            tokio::spawn(work(ctx, commit_log, changelog_ready, interjections, channels));

        Self {
            topic_partition,
            partition_input,
            run_status,
            shared,
            work_handle: Some(work_handle),
        }
    }

    /// Hand a slice of inbound records to the worker. Blocks once the input
    /// buffer is full, back-pressuring the poller. Dropped silently after
    /// revocation.
    pub async fn add(&self, records: Vec<OwnedMessage>) {
        if !self.run_status.running() {
            return;
        }
        let count = records.len() as i64;
        self.shared.pending.fetch_add(count, Ordering::SeqCst);
        if self.partition_input.send(records).await.is_err() {
            // Pusher already gone; nothing was scheduled.
            self.shared.pending.fetch_sub(count, Ordering::SeqCst);
        }
    }

    /// Begin revocation: stop accepting records and drain in-flight work.
    pub fn revoke(&self) {
        self.run_status.halt();
    }

    /// Revoke and wait for the work loop to reach its terminal state.
    pub async fn shutdown(mut self) {
        self.run_status.halt();
        if let Some(handle) = self.work_handle.take() {
            if let Err(e) = handle.await {
                warn!(
                    topic_partition = %self.topic_partition,
                    error = %e,
                    "worker task panicked during shutdown"
                );
            }
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn pending(&self) -> i64 {
        self.shared.pending.load(Ordering::SeqCst)
    }

    pub fn processed(&self) -> i64 {
        self.shared.processed.load(Ordering::SeqCst)
    }

    pub fn highest_offset(&self) -> i64 {
        self.shared.highest_offset.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    /// Whether any processor or interjector has returned
    /// [`ExecutionState::Fatal`]. Escalation policy belongs to the host.
    pub fn saw_fatal(&self) -> bool {
        self.shared.fatal.load(Ordering::SeqCst)
    }
}

/// The main loop. Initializes progress from the commit log, waits for the
/// changelog to be populated, then serially dispatches events, async job
/// completions, and interjections until revoked.
async fn work<S: Send + Sync + 'static>(
    ctx: WorkerCtx<S>,
    commit_log: Arc<dyn CommitLog>,
    changelog_ready: oneshot::Receiver<()>,
    interjections: Vec<Interjection<S>>,
    channels: WorkChannels<S>,
) {
    let started = Instant::now();
    let last_processed = commit_log.last_processed(&ctx.topic_partition).await;
    ctx.shared
        .highest_offset
        .store(last_processed, Ordering::SeqCst);
    debug!(
        topic_partition = %ctx.topic_partition,
        last_processed,
        elapsed = ?started.elapsed(),
        "partition worker initialized"
    );

    // Consumption must not start until the partition's changelog is fully
    // populated.
    let _ = changelog_ready.await;
    ctx.set_state(WorkerState::Active);

    let WorkChannels {
        mut event_rx,
        event_tx,
        mut jobs,
        mut interjection_rx,
        interjection_tx,
        partition_rx,
        stop_tx,
        mut stop_rx,
        revoked_tx,
        mut revoked_rx,
        stopped_tx,
        stopped_rx,
    } = channels;

    tokio::spawn(push_records(
        ctx.clone(),
        partition_rx,
        event_tx,
        stop_tx,
        stopped_rx,
    ));

    let interjections: Vec<Arc<Interjection<S>>> = interjections
        .into_iter()
        .map(|mut interjection| {
            interjection.init(ctx.topic_partition.clone(), interjection_tx.clone());
            let interjection = Arc::new(interjection);
            Arc::clone(&interjection).tick();
            interjection
        })
        .collect();

    debug!(
        topic_partition = %ctx.topic_partition,
        interjections = interjections.len(),
        elapsed = ?started.elapsed(),
        "partition worker activated"
    );

    let mut stopped_tx = Some(stopped_tx);
    loop {
        tokio::select! {
            Some(event_ctx) = event_rx.recv() => {
                handle_event(&ctx, event_ctx).await;
            }
            Some(job) = jobs.recv() => {
                let (job_ctx, result) = job.finalize();
                match result {
                    Ok(ExecutionState::Complete) => job_ctx.complete(),
                    Ok(_) => {}
                    Err(e) => error!(
                        topic_partition = %ctx.topic_partition,
                        offset = job_ctx.offset(),
                        error = %e,
                        "async job finalization failed"
                    ),
                }
                jobs.drained();
            }
            Some(interjection) = interjection_rx.recv() => {
                handle_interjection(&ctx, &interjection).await;
                interjection.tick();
            }
            Some(()) = stop_rx.recv() => {
                ctx.set_state(WorkerState::Stopping);
                for interjection in &interjections {
                    interjection.cancel();
                }
                ctx.set_state(WorkerState::RevocationDraining);
                let waiter = ctx.waiter.clone();
                let revoked = revoked_tx.clone();
                tokio::spawn(async move {
                    // Wait until every scheduled record has been claimed by a
                    // producer or rejected.
                    waiter.wait().await;
                    let _ = revoked.send(()).await;
                });
            }
            Some(()) = revoked_rx.recv() => {
                ctx.set_state(WorkerState::Stopped);
                if let Some(stopped) = stopped_tx.take() {
                    let _ = stopped.send(());
                }
                return;
            }
        }
    }
}

/// Fans inbound record slices into scheduled event contexts until halted,
/// then runs the stop handshake with the work loop.
async fn push_records<S: Send + Sync + 'static>(
    ctx: WorkerCtx<S>,
    mut partition_rx: mpsc::Receiver<Vec<OwnedMessage>>,
    event_tx: mpsc::Sender<Arc<EventContext<S>>>,
    stop_tx: mpsc::Sender<()>,
    stopped_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            maybe_records = partition_rx.recv() => match maybe_records {
                Some(records) => {
                    if ctx.run_status.running() {
                        schedule_txn_and_execution(&ctx, records, &event_tx).await;
                    }
                }
                None => {
                    // The worker handle was dropped without an explicit
                    // revoke; treat it as one.
                    ctx.run_status.halt();
                }
            },
            _ = ctx.run_status.done() => {
                debug!(topic_partition = %ctx.topic_partition, "closing partition worker");
                let _ = stop_tx.send(()).await;
                let _ = stopped_rx.await;
                partition_rx.close();
                debug!(topic_partition = %ctx.topic_partition, "closed partition worker");
                return;
            }
        }
    }
}

/// Enroll each in-order record with the producer pool and queue it for the
/// work loop. The revocation waiter is bulk-incremented up front; stale
/// records give their count straight back.
async fn schedule_txn_and_execution<S: Send + Sync + 'static>(
    ctx: &WorkerCtx<S>,
    records: Vec<OwnedMessage>,
    event_tx: &mpsc::Sender<Arc<EventContext<S>>>,
) {
    ctx.waiter.add(records.len() as i64);
    let mut records = records.into_iter();
    while let Some(record) = records.next() {
        if record.offset() >= ctx.shared.highest_offset.load(Ordering::SeqCst) {
            let event_ctx = EventContext::new_record(
                ctx.topic_partition.clone(),
                record,
                ctx.changelog.changelog_data(),
                ctx.completer.clone(),
                ctx.waiter.clone(),
            );
            ctx.pool.add_event_context(&event_ctx);
            if event_tx.send(event_ctx).await.is_err() {
                // Work loop already exited. The context above still resolves
                // its waiter count through the pool, but it will never be
                // dispatched, and the rest were never scheduled at all.
                ctx.shared.pending.fetch_sub(1, Ordering::SeqCst);
                for _ in records.by_ref() {
                    ctx.waiter.done();
                    ctx.shared.pending.fetch_sub(1, Ordering::SeqCst);
                }
                return;
            }
        } else {
            ctx.waiter.done();
            ctx.shared.pending.fetch_sub(1, Ordering::SeqCst);
            metrics::counter!(
                WORKER_STALE_RECORDS_TOTAL,
                "topic" => ctx.topic_partition.topic().to_string(),
                "partition" => ctx.topic_partition.partition().to_string()
            )
            .increment(1);
        }
    }
}

async fn handle_event<S: Send + Sync + 'static>(ctx: &WorkerCtx<S>, event_ctx: Arc<EventContext<S>>) {
    let offset = event_ctx.offset();
    ctx.shared.pending.fetch_sub(1, Ordering::SeqCst);
    forward_to_processor(ctx, &event_ctx).await;
    ctx.shared.highest_offset.store(offset + 1, Ordering::SeqCst);
    ctx.shared.processed.fetch_add(1, Ordering::SeqCst);
    ctx.publish_pending();
    metrics::counter!(
        WORKER_PROCESSED_EVENTS_TOTAL,
        "topic" => ctx.topic_partition.topic().to_string(),
        "partition" => ctx.topic_partition.partition().to_string()
    )
    .increment(1);
}

async fn forward_to_processor<S: Send + Sync + 'static>(
    ctx: &WorkerCtx<S>,
    event_ctx: &Arc<EventContext<S>>,
) {
    let Some(_producer) = event_ctx.producer().await else {
        // Revoked while queued; skip user invocation entirely.
        return;
    };
    let Some(record) = event_ctx.record() else {
        return;
    };
    match ctx.processor.process(event_ctx, record).await {
        Ok(ExecutionState::Complete) => event_ctx.complete(),
        Ok(ExecutionState::Incomplete) => {}
        Ok(ExecutionState::Fatal) => {
            ctx.shared.fatal.store(true, Ordering::SeqCst);
            error!(
                topic_partition = %ctx.topic_partition,
                offset = event_ctx.offset(),
                "processor signalled a fatal error"
            );
            metrics::counter!(WORKER_FATAL_SIGNALS_TOTAL).increment(1);
        }
        Err(e) => error!(
            topic_partition = %ctx.topic_partition,
            offset = event_ctx.offset(),
            error = %e,
            "event processor failed"
        ),
    }
}

async fn handle_interjection<S: Send + Sync + 'static>(
    ctx: &WorkerCtx<S>,
    interjection: &Arc<Interjection<S>>,
) {
    if !ctx.run_status.running() {
        // One-shot interjections must be closed off so callers waiting on
        // them do not hang through a revocation.
        interjection.on_revoked();
        return;
    }
    ctx.waiter.add(1);
    let event_ctx = EventContext::new_interjection(
        ctx.topic_partition.clone(),
        ctx.changelog.changelog_data(),
        ctx.completer.clone(),
        ctx.waiter.clone(),
    );
    ctx.pool.add_interjection(&event_ctx);
    match event_ctx.producer().await {
        None => interjection.on_revoked(),
        Some(_) => match interjection.interject(&event_ctx).await {
            Ok(ExecutionState::Complete) => event_ctx.complete(),
            Ok(ExecutionState::Incomplete) => {}
            Ok(ExecutionState::Fatal) => {
                ctx.shared.fatal.store(true, Ordering::SeqCst);
                error!(
                    topic_partition = %ctx.topic_partition,
                    "interjector signalled a fatal error"
                );
                metrics::counter!(WORKER_FATAL_SIGNALS_TOTAL).increment(1);
            }
            Err(e) => error!(
                topic_partition = %ctx.topic_partition,
                error = %e,
                "interjector failed"
            ),
        },
    }
    metrics::counter!(
        WORKER_INTERJECTIONS_TOTAL,
        "topic" => ctx.topic_partition.topic().to_string(),
        "partition" => ctx.topic_partition.partition().to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        test_record, CountingInterjector, DeliveryMode, MemoryCommitLog, RecordingProcessor,
        StaticChangeLog, TestProducerPool,
    };
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    struct Harness {
        worker: PartitionWorker,
        pool: Arc<TestProducerPool<()>>,
        processor: Arc<RecordingProcessor>,
    }

    fn start_worker(
        mode: DeliveryMode,
        last_processed: i64,
        result: ExecutionState,
        interjections: Vec<Interjection<()>>,
    ) -> Harness {
        let topic_partition = TopicPartition::new("orders", 0);
        let pool = Arc::new(TestProducerPool::new(mode));
        let processor = Arc::new(RecordingProcessor::new(result));
        let commit_log = Arc::new(MemoryCommitLog::with_offset(
            topic_partition.clone(),
            last_processed,
        ));
        let (ready_tx, ready_rx) = oneshot::channel();
        ready_tx.send(()).unwrap();

        let worker = PartitionWorker::new(
            topic_partition,
            processor.clone(),
            interjections,
            pool.clone(),
            commit_log,
            Arc::new(StaticChangeLog::<()>::default()),
            ready_rx,
            &RunStatus::new(),
            &EosWorkerConfig::new(100),
        );
        Harness {
            worker,
            pool,
            processor,
        }
    }

    async fn wait_for(what: &str, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn test_straight_line_processing() {
        let h = start_worker(DeliveryMode::Immediate, 10, ExecutionState::Complete, vec![]);

        h.worker
            .add(vec![
                test_record("orders", 0, 10),
                test_record("orders", 0, 11),
                test_record("orders", 0, 12),
            ])
            .await;

        wait_for("three processed events", || h.worker.processed() == 3).await;
        assert_eq!(h.processor.offsets(), vec![10, 11, 12]);
        assert_eq!(h.worker.highest_offset(), 13);
        assert_eq!(h.worker.pending(), 0);
        assert_eq!(h.worker.state(), WorkerState::Active);

        // Every context was marked committed-pending.
        for ctx in h.pool.event_contexts() {
            assert!(ctx.is_complete());
        }

        timeout(Duration::from_secs(5), h.worker.shutdown())
            .await
            .expect("clean shutdown");
    }

    #[tokio::test]
    async fn test_stale_records_are_dropped() {
        let h = start_worker(DeliveryMode::Immediate, 10, ExecutionState::Complete, vec![]);

        h.worker
            .add(vec![
                test_record("orders", 0, 8),
                test_record("orders", 0, 9),
                test_record("orders", 0, 10),
                test_record("orders", 0, 11),
            ])
            .await;

        wait_for("two processed events", || h.worker.processed() == 2).await;
        assert_eq!(h.processor.offsets(), vec![10, 11]);
        assert_eq!(h.worker.highest_offset(), 12);
        assert_eq!(h.worker.pending(), 0);
        // Only the live records ever reached the pool.
        assert_eq!(h.pool.event_contexts().len(), 2);

        timeout(Duration::from_secs(5), h.worker.shutdown())
            .await
            .expect("clean shutdown");
    }

    #[tokio::test]
    async fn test_incomplete_resolves_through_async_job() {
        let h = start_worker(
            DeliveryMode::Immediate,
            -1,
            ExecutionState::Incomplete,
            vec![],
        );

        h.worker.add(vec![test_record("orders", 0, 5)]).await;
        wait_for("event dispatched", || h.worker.processed() == 1).await;

        let ctx = h.pool.event_contexts().pop().unwrap();
        assert!(!ctx.is_complete());

        ctx.async_job_complete(|| Ok(ExecutionState::Complete)).await;
        timeout(Duration::from_secs(5), ctx.wait_complete())
            .await
            .expect("async job resolves the context");

        timeout(Duration::from_secs(5), h.worker.shutdown())
            .await
            .expect("clean shutdown");
    }

    #[tokio::test]
    async fn test_revocation_drains_all_scheduled_records() {
        let h = start_worker(DeliveryMode::Manual, -1, ExecutionState::Complete, vec![]);

        let records = (0..100).map(|i| test_record("orders", 0, i)).collect();
        h.worker.add(records).await;
        wait_for("all contexts registered", || {
            h.pool.event_contexts().len() == 100
        })
        .await;

        // Claim 60 contexts into transactions, reject the other 40.
        for (i, ctx) in h.pool.event_contexts().iter().enumerate() {
            ctx.deliver_producer(if i < 60 {
                Some(crate::test_utils::noop_producer())
            } else {
                None
            });
        }

        wait_for("every event dispatched", || h.worker.processed() == 100).await;
        // Rejected contexts short-circuited without reaching the processor.
        assert_eq!(h.processor.offsets().len(), 60);
        let completed = h
            .pool
            .event_contexts()
            .iter()
            .filter(|ctx| ctx.is_complete())
            .count();
        assert_eq!(completed, 60);

        h.worker.revoke();
        timeout(Duration::from_secs(5), h.worker.shutdown())
            .await
            .expect("drain completes once every record resolved");
    }

    #[tokio::test]
    async fn test_stop_waits_for_unresolved_handoffs() {
        let h = start_worker(DeliveryMode::Manual, -1, ExecutionState::Complete, vec![]);

        let records = (0..5).map(|i| test_record("orders", 0, i)).collect();
        h.worker.add(records).await;
        wait_for("contexts registered", || h.pool.event_contexts().len() == 5).await;

        let pool = h.pool.clone();
        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_flag = stopped.clone();
        let worker = h.worker;
        tokio::spawn(async move {
            worker.shutdown().await;
            stopped_flag.store(true, Ordering::SeqCst);
        });

        sleep(Duration::from_millis(50)).await;
        assert!(
            !stopped.load(Ordering::SeqCst),
            "shutdown must wait for unresolved producer handoffs"
        );

        for ctx in pool.event_contexts() {
            ctx.deliver_producer(None);
        }
        wait_for("drain finishes after resolutions", || {
            stopped.load(Ordering::SeqCst)
        })
        .await;
    }

    #[tokio::test]
    async fn test_records_after_revoke_are_dropped() {
        let h = start_worker(DeliveryMode::Immediate, -1, ExecutionState::Complete, vec![]);

        h.worker.revoke();
        h.worker.add(vec![test_record("orders", 0, 1)]).await;

        sleep(Duration::from_millis(30)).await;
        assert_eq!(h.worker.pending(), 0);
        assert!(h.processor.offsets().is_empty());

        timeout(Duration::from_secs(5), h.worker.shutdown())
            .await
            .expect("clean shutdown");
    }

    #[tokio::test]
    async fn test_interjections_fire_and_complete() {
        let interjector = Arc::new(CountingInterjector::new(ExecutionState::Complete));
        let interjections = vec![Interjection::new(
            Duration::from_millis(10),
            interjector.clone(),
        )];
        let h = start_worker(
            DeliveryMode::Immediate,
            -1,
            ExecutionState::Complete,
            interjections,
        );

        wait_for("repeated interjections", || interjector.count() >= 2).await;
        for ctx in h.pool.interjection_contexts() {
            assert!(ctx.is_interjection());
            timeout(Duration::from_secs(5), ctx.wait_complete())
                .await
                .expect("interjection context completes");
        }

        timeout(Duration::from_secs(5), h.worker.shutdown())
            .await
            .expect("clean shutdown");
    }

    #[tokio::test]
    async fn test_rejected_interjection_runs_cancel_hook() {
        let hook_fired = Arc::new(AtomicBool::new(false));
        let fired = hook_fired.clone();
        let interjector = Arc::new(CountingInterjector::new(ExecutionState::Complete));
        let interjections =
            vec![
                Interjection::new(Duration::from_millis(5), interjector.clone())
                    .with_cancel_hook(move || fired.store(true, Ordering::SeqCst)),
            ];
        let h = start_worker(
            DeliveryMode::Reject,
            -1,
            ExecutionState::Complete,
            interjections,
        );

        wait_for("cancel hook after rejected handoff", || {
            hook_fired.load(Ordering::SeqCst)
        })
        .await;
        assert_eq!(interjector.count(), 0);

        timeout(Duration::from_secs(5), h.worker.shutdown())
            .await
            .expect("clean shutdown");
    }

    #[tokio::test]
    async fn test_fatal_is_latched_not_escalated() {
        let h = start_worker(DeliveryMode::Immediate, -1, ExecutionState::Fatal, vec![]);

        h.worker.add(vec![test_record("orders", 0, 0)]).await;
        wait_for("fatal latched", || h.worker.saw_fatal()).await;

        // The worker keeps running; teardown stays with the host.
        assert_eq!(h.worker.state(), WorkerState::Active);
        timeout(Duration::from_secs(5), h.worker.shutdown())
            .await
            .expect("clean shutdown");
    }
}
