use thiserror::Error;

use crate::types::TopicPartition;

/// Errors surfaced by a transactional producer handle when staging records.
#[derive(Debug, Error)]
pub enum ProduceError {
    /// The transaction this context was enrolled in was aborted, typically
    /// because the partition was revoked mid-flight.
    #[error("transaction for {topic_partition} was aborted")]
    TransactionAborted { topic_partition: TopicPartition },

    /// The producer's local queue is full; the record was not staged.
    #[error("producer queue is full")]
    QueueFull,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A batch executor failure, forwarded on the batcher's error outlet. The
/// batcher does not retry; item completions still fan in so event contexts
/// never hang on a failed batch.
#[derive(Debug, Error)]
#[error("batch executor failed for {item_count} items")]
pub struct BatchExecutionError {
    pub item_count: usize,
    #[source]
    pub source: anyhow::Error,
}
