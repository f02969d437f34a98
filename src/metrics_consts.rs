// ==== Partition worker metrics ====
/// Gauge for events accepted but not yet dispatched to the processor
pub const WORKER_PENDING_EVENTS: &str = "eos_worker_pending_events";

/// Counter for events dispatched through the work loop
pub const WORKER_PROCESSED_EVENTS_TOTAL: &str = "eos_worker_processed_events_total";

/// Counter for records dropped because their offset was below the high-water mark
pub const WORKER_STALE_RECORDS_TOTAL: &str = "eos_worker_stale_records_total";

/// Counter for Fatal results returned by processors or interjectors
pub const WORKER_FATAL_SIGNALS_TOTAL: &str = "eos_worker_fatal_signals_total";

/// Counter for interjections handled by the work loop
pub const WORKER_INTERJECTIONS_TOTAL: &str = "eos_worker_interjections_total";

// ==== Async completer metrics ====
/// Counter for submissions that found the async-job channel full and had to wait
pub const ASYNC_JOBS_SATURATED_TOTAL: &str = "eos_async_jobs_saturated_total";

// ==== Async batcher metrics ====
/// Gauge for items parked in the pending queue awaiting a slot
pub const BATCHER_PENDING_ITEMS: &str = "eos_batcher_pending_items";

/// Gauge for slots currently executing
pub const BATCHER_EXECUTING_BATCHES: &str = "eos_batcher_executing_batches";

/// Counter for dispatched batches
pub const BATCHER_BATCHES_DISPATCHED_TOTAL: &str = "eos_batcher_batches_dispatched_total";

/// Counter for executor failures forwarded on the error outlet
pub const BATCHER_EXECUTOR_FAILURES_TOTAL: &str = "eos_batcher_executor_failures_total";
