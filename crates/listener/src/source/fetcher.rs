use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::acknowledgement::AcknowledgementCallback;
use crate::message::Message;
use crate::provider::{ProviderError, QueueClient, StreamClient};

/// Fetches messages of a single endpoint
#[async_trait]
pub trait MessageFetcher: Send + Sync {
    /// Endpoint name used in logs and message envelopes
    fn endpoint(&self) -> &str;

    /// Fetch at most `max` messages, waiting up to `wait` for any to arrive
    async fn fetch(&self, max: usize, wait: Duration) -> Result<Vec<Message>, ProviderError>;
}

/// Receives messages from a queue
pub struct QueueMessageFetcher {
    client: Arc<dyn QueueClient>,
    queue: String,
    acknowledgement: Arc<dyn AcknowledgementCallback>,
}

impl QueueMessageFetcher {
    pub fn new(
        client: Arc<dyn QueueClient>,
        queue: impl Into<String>,
        acknowledgement: Arc<dyn AcknowledgementCallback>,
    ) -> Self {
        Self {
            client,
            queue: queue.into(),
            acknowledgement,
        }
    }
}

#[async_trait]
impl MessageFetcher for QueueMessageFetcher {
    fn endpoint(&self) -> &str {
        &self.queue
    }

    async fn fetch(&self, max: usize, wait: Duration) -> Result<Vec<Message>, ProviderError> {
        let raw = self.client.receive_messages(&self.queue, max, wait).await?;
        trace!(queue = %self.queue, count = raw.len(), "received messages");
        Ok(raw
            .into_iter()
            .map(|raw| {
                Message::from_queue(
                    raw,
                    &self.queue,
                    Arc::clone(&self.client),
                    Arc::clone(&self.acknowledgement),
                )
            })
            .collect())
    }
}

/// Reads records from one stream shard
pub struct ShardMessageFetcher {
    client: Arc<dyn StreamClient>,
    stream: String,
    shard: String,
    endpoint: String,
    acknowledgement: Arc<dyn AcknowledgementCallback>,
}

impl ShardMessageFetcher {
    pub fn new(
        client: Arc<dyn StreamClient>,
        stream: impl Into<String>,
        shard: impl Into<String>,
        acknowledgement: Arc<dyn AcknowledgementCallback>,
    ) -> Self {
        let stream = stream.into();
        let shard = shard.into();
        Self {
            endpoint: format!("{}/{}", stream, shard),
            client,
            stream,
            shard,
            acknowledgement,
        }
    }
}

#[async_trait]
impl MessageFetcher for ShardMessageFetcher {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn fetch(&self, max: usize, wait: Duration) -> Result<Vec<Message>, ProviderError> {
        let records = self
            .client
            .get_records(&self.stream, &self.shard, max, wait)
            .await?;
        trace!(endpoint = %self.endpoint, count = records.len(), "read records");
        Ok(records
            .into_iter()
            .map(|record| {
                Message::from_stream_record(
                    record,
                    &self.stream,
                    &self.shard,
                    Arc::clone(&self.acknowledgement),
                )
            })
            .collect())
    }
}
