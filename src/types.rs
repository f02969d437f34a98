use std::fmt;

/// A topic name plus partition index. Identifies the unit of ordering and
/// ownership for a partition worker; immutable for the worker's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartition {
    topic: String,
    partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Returned by an [`EventProcessor`](crate::traits::EventProcessor) or
/// [`Interjector`](crate::traits::Interjector) in response to an event
/// context. Not to be conflated with success/failure: an error is reported
/// separately through the `Result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// The event is fully processed; the offset for the associated event
    /// context will be committed.
    Complete,
    /// Processing is still ongoing and the application promises to fulfill
    /// the event context later via an async job. No offset commit yet.
    Incomplete,
    /// Unrecoverable application-level failure. Escalation policy belongs to
    /// the host; the worker records and reports it.
    Fatal,
}

/// Lifecycle of a partition worker, from construction to the terminal state
/// reached once the revocation drain finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Commit-log lookup and changelog population in progress.
    Initializing,
    /// Consuming records and interjections.
    Active,
    /// Stop signal received; interjections cancelled.
    Stopping,
    /// Waiting for every in-flight record to be claimed or rejected by the
    /// producer pool.
    RevocationDraining,
    /// Terminal. The work loop has exited.
    Stopped,
}

impl WorkerState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            WorkerState::Initializing => 0,
            WorkerState::Active => 1,
            WorkerState::Stopping => 2,
            WorkerState::RevocationDraining => 3,
            WorkerState::Stopped => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Initializing,
            1 => WorkerState::Active,
            2 => WorkerState::Stopping,
            3 => WorkerState::RevocationDraining,
            _ => WorkerState::Stopped,
        }
    }
}
