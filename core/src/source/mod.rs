pub mod kafka;

use std::collections::HashMap;

use crate::errors::SourceError;

pub use kafka::KafkaSource;

/// A message received from a source, independent of the broker behind it.
#[derive(Debug, Clone)]
pub struct SourceMessage {
    /// raw payload, e.g. the kafka message body
    pub payload: Vec<u8>,
    pub topic: String,
    /// partition or shard ID
    pub partition: usize,
    pub headers: HashMap<String, Vec<u8>>,
}

/// Messages from one poll plus the handles that acknowledge them.
#[derive(Debug, Default)]
pub struct MessageBatch {
    pub messages: Vec<SourceMessage>,
    pub handles: Vec<CheckpointHandle>,
}

impl MessageBatch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }
}

/// An opaque handle used to commit a message's progress.
/// For Kafka it encodes topic, partition and offset.
pub type CheckpointHandle = Vec<u8>;

#[allow(async_fn_in_trait)]
pub trait Source {
    /// Receives a batch of messages from the source.
    ///
    /// Waits until messages are available or the poll times out.
    /// An empty `MessageBatch` means the poll timed out without new messages.
    async fn next_batch(&self) -> Result<MessageBatch, SourceError>;

    /// Commits the progress for a set of messages.
    async fn commit(&self, handles: &[CheckpointHandle]) -> Result<(), SourceError>;

    /// Closes the connection to the source. Called during graceful shutdown.
    async fn shutdown(&self) -> Result<(), SourceError>;
}
