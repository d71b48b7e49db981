//! Provider calls that acknowledge messages

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::AcknowledgementError;
use crate::message::Message;
use crate::provider::{QueueClient, StreamClient};

/// Acknowledges a chunk of messages with the provider
#[async_trait]
pub trait AcknowledgementExecutor: Send + Sync {
    /// Acknowledge the messages, all from the same endpoint
    async fn execute(&self, messages: &[Message]) -> Result<(), AcknowledgementError>;
}

/// Deletes queue messages by receipt handle
pub struct QueueAcknowledgementExecutor {
    client: Arc<dyn QueueClient>,
    queue: String,
}

impl QueueAcknowledgementExecutor {
    /// Create an executor for a queue
    pub fn new(client: Arc<dyn QueueClient>, queue: impl Into<String>) -> Self {
        Self {
            client,
            queue: queue.into(),
        }
    }
}

#[async_trait]
impl AcknowledgementExecutor for QueueAcknowledgementExecutor {
    async fn execute(&self, messages: &[Message]) -> Result<(), AcknowledgementError> {
        if messages.is_empty() {
            return Ok(());
        }
        let handles: Vec<String> = messages.iter().map(|m| m.receipt_handle.clone()).collect();
        self.client.delete_messages(&self.queue, &handles).await?;
        debug!(queue = %self.queue, count = handles.len(), "Deleted messages");
        Ok(())
    }
}

/// Checkpoints stream shards at the highest acknowledged sequence number
pub struct StreamCheckpointExecutor {
    client: Arc<dyn StreamClient>,
    stream: String,
}

impl StreamCheckpointExecutor {
    /// Create an executor for a stream
    pub fn new(client: Arc<dyn StreamClient>, stream: impl Into<String>) -> Self {
        Self {
            client,
            stream: stream.into(),
        }
    }
}

/// Compare numeric sequence numbers of arbitrary length
fn compare_sequence_numbers(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

#[async_trait]
impl AcknowledgementExecutor for StreamCheckpointExecutor {
    async fn execute(&self, messages: &[Message]) -> Result<(), AcknowledgementError> {
        let mut highest: BTreeMap<&str, &str> = BTreeMap::new();
        for message in messages {
            let (Some(shard), Some(sequence)) =
                (message.group_id.as_deref(), message.sequence_number.as_deref())
            else {
                return Err(AcknowledgementError::NotAcknowledgeable(message.id.clone()));
            };
            highest
                .entry(shard)
                .and_modify(|current| {
                    if compare_sequence_numbers(sequence, current) == Ordering::Greater {
                        *current = sequence;
                    }
                })
                .or_insert(sequence);
        }

        for (shard, sequence) in highest {
            self.client.checkpoint(&self.stream, shard, sequence).await?;
            debug!(stream = %self.stream, shard, sequence, "Checkpointed shard");
        }
        Ok(())
    }
}
