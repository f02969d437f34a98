/// Sizing knobs for a partition worker.
///
/// The event-input and async-job capacities are derived from the maximum
/// transaction batch size: the event channel holds a tenth of it (floored at
/// 10k) so the pusher back-pressures well before the producer pool does, and
/// the async-job channel holds four times that to absorb completion bursts
/// from external systems.
#[derive(Debug, Clone)]
pub struct EosWorkerConfig {
    /// Upper bound on records the producer pool packs into one transaction.
    pub max_batch_size: usize,
    /// Buffer of inbound record slices, ahead of event-context creation.
    pub partition_input_capacity: usize,
    /// Buffer of event contexts between the pusher and the work loop.
    pub event_input_capacity: usize,
    /// Buffer of externally-completed async jobs.
    pub async_job_capacity: usize,
}

impl EosWorkerConfig {
    pub fn new(max_batch_size: usize) -> Self {
        let event_input_capacity = (max_batch_size / 10).max(10_000);
        Self {
            max_batch_size,
            partition_input_capacity: 128,
            event_input_capacity,
            async_job_capacity: event_input_capacity * 4,
        }
    }

    pub fn with_partition_input_capacity(mut self, capacity: usize) -> Self {
        self.partition_input_capacity = capacity;
        self
    }

    pub fn with_event_input_capacity(mut self, capacity: usize) -> Self {
        self.event_input_capacity = capacity;
        self
    }

    pub fn with_async_job_capacity(mut self, capacity: usize) -> Self {
        self.async_job_capacity = capacity;
        self
    }
}

impl Default for EosWorkerConfig {
    fn default() -> Self {
        Self::new(10_000)
    }
}
