//! Provider client abstractions
//!
//! The container never talks to a queue or stream service directly. It goes
//! through [`QueueClient`] and [`StreamClient`], which SDK-backed crates
//! implement. [`InMemoryQueueClient`] and [`InMemoryStreamClient`] are
//! provided for tests and local runs.

mod memory;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use memory::{InMemoryQueueClient, InMemoryStreamClient, VisibilityChange};

/// Provider errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The service throttled the request
    #[error("request throttled: {0}")]
    Throttled(String),

    /// Network or service hiccup worth retrying
    #[error("transient provider error: {0}")]
    Transient(String),

    /// The queue or shard does not exist
    #[error("endpoint not found: {0}")]
    NotFound(String),

    /// Anything else reported by the provider
    #[error("provider error: {0}")]
    Other(String),
}

impl ProviderError {
    /// Whether the error ends polling for the endpoint
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

/// A message as returned by a queue service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Service-assigned message id
    pub message_id: String,
    /// Message body
    pub body: String,
    /// Token identifying this receipt, used to delete or change visibility
    pub receipt_handle: String,
    /// Message group id (FIFO queues)
    pub group_id: Option<String>,
    /// Sequence number (FIFO queues)
    pub sequence_number: Option<String>,
    /// How many times the message has been received
    pub receive_count: u32,
    /// When the message was sent
    pub sent_at: Option<DateTime<Utc>>,
    /// Message attributes
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// A record as returned by a stream shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    /// Position of the record within its shard
    pub sequence_number: String,
    /// Partition key the record was written with
    pub partition_key: String,
    /// Record payload
    pub data: String,
    /// When the record arrived in the stream
    pub arrived_at: Option<DateTime<Utc>>,
}

/// Queue service operations used by the container
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Receive up to `max_messages`, long-polling for at most `wait`
    async fn receive_messages(
        &self,
        queue: &str,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<RawMessage>, ProviderError>;

    /// Delete messages by receipt handle. Unknown handles are ignored.
    async fn delete_messages(
        &self,
        queue: &str,
        receipt_handles: &[String],
    ) -> Result<(), ProviderError>;

    /// Hide messages from other consumers for `timeout` from now
    async fn change_visibility(
        &self,
        queue: &str,
        receipt_handles: &[String],
        timeout: Duration,
    ) -> Result<(), ProviderError>;
}

/// Stream service operations used by the container
///
/// Shard iterators are managed by the implementation: each call continues
/// where the previous one for the same shard stopped.
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Fetch up to `max_records` from a shard, waiting at most `wait`
    async fn get_records(
        &self,
        stream: &str,
        shard: &str,
        max_records: usize,
        wait: Duration,
    ) -> Result<Vec<StreamRecord>, ProviderError>;

    /// Record that everything up to `sequence_number` was processed
    async fn checkpoint(
        &self,
        stream: &str,
        shard: &str,
        sequence_number: &str,
    ) -> Result<(), ProviderError>;
}

/// Whether a queue name designates a FIFO queue
pub fn is_fifo_queue(queue: &str) -> bool {
    queue.ends_with(".fifo")
}
