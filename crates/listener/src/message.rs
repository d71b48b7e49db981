//! Message envelope
//!
//! A [`Message`] wraps a provider payload together with everything needed to
//! acknowledge it later (endpoint, receipt handle, sequence number) without
//! going back to the provider.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::warn;

use crate::acknowledgement::{Acknowledgement, AcknowledgementCallback, AcknowledgementError};
use crate::provider::{ProviderError, QueueClient, RawMessage, StreamRecord};

/// Attribute holding a stream record's partition key
pub const PARTITION_KEY_ATTRIBUTE: &str = "partition_key";

/// A received message
#[derive(Clone)]
pub struct Message {
    /// Provider message id (the sequence number for stream records)
    pub id: String,
    /// Message body
    pub body: String,
    /// Queue name, or `stream/shard` for stream records
    pub endpoint: String,
    /// Token used to delete or change visibility (the sequence number for stream records)
    pub receipt_handle: String,
    /// FIFO sequence number or stream sequence number
    pub sequence_number: Option<String>,
    /// FIFO message group, or the shard id for stream records
    pub group_id: Option<String>,
    /// How many times the provider delivered this message
    pub receive_count: u32,
    /// When the provider accepted the message
    pub sent_at: Option<DateTime<Utc>>,
    /// When this consumer received it
    pub received_at: Instant,
    /// Provider attributes
    pub attributes: HashMap<String, String>,
    acknowledgement: Option<Acknowledgement>,
    visibility: Option<Visibility>,
}

impl Message {
    /// Create a detached message, mostly useful in tests
    pub fn new(
        id: impl Into<String>,
        endpoint: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            receipt_handle: id.clone(),
            id,
            body: body.into(),
            endpoint: endpoint.into(),
            sequence_number: None,
            group_id: None,
            receive_count: 1,
            sent_at: None,
            received_at: Instant::now(),
            attributes: HashMap::new(),
            acknowledgement: None,
            visibility: None,
        }
    }

    /// Envelope for a queue message
    pub fn from_queue(
        raw: RawMessage,
        queue: &str,
        client: Arc<dyn QueueClient>,
        callback: Arc<dyn AcknowledgementCallback>,
    ) -> Self {
        let visibility = Visibility {
            client,
            queue: queue.to_string(),
            receipt_handle: raw.receipt_handle.clone(),
        };
        Self {
            id: raw.message_id,
            body: raw.body,
            endpoint: queue.to_string(),
            receipt_handle: raw.receipt_handle,
            sequence_number: raw.sequence_number,
            group_id: raw.group_id,
            receive_count: raw.receive_count,
            sent_at: raw.sent_at,
            received_at: Instant::now(),
            attributes: raw.attributes,
            acknowledgement: Some(Acknowledgement::new(callback)),
            visibility: Some(visibility),
        }
    }

    /// Envelope for a stream record
    pub fn from_stream_record(
        record: StreamRecord,
        stream: &str,
        shard: &str,
        callback: Arc<dyn AcknowledgementCallback>,
    ) -> Self {
        let mut attributes = HashMap::new();
        attributes.insert(PARTITION_KEY_ATTRIBUTE.to_string(), record.partition_key);
        Self {
            id: record.sequence_number.clone(),
            body: record.data,
            endpoint: format!("{}/{}", stream, shard),
            receipt_handle: record.sequence_number.clone(),
            sequence_number: Some(record.sequence_number),
            group_id: Some(shard.to_string()),
            receive_count: 1,
            sent_at: record.arrived_at,
            received_at: Instant::now(),
            attributes,
            acknowledgement: Some(Acknowledgement::new(callback)),
            visibility: None,
        }
    }

    /// Attach an acknowledgement callback
    pub fn with_acknowledgement(mut self, callback: Arc<dyn AcknowledgementCallback>) -> Self {
        self.acknowledgement = Some(Acknowledgement::new(callback));
        self
    }

    /// Set the message group
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Set the receive count
    pub fn with_receive_count(mut self, receive_count: u32) -> Self {
        self.receive_count = receive_count;
        self
    }

    /// Deserialize the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }

    /// Key used for per-group ordering
    pub fn group_key(&self) -> &str {
        self.group_id.as_deref().unwrap_or_default()
    }

    /// Acknowledgement handle, absent for detached messages
    pub fn acknowledgement(&self) -> Option<&Acknowledgement> {
        self.acknowledgement.as_ref()
    }

    /// Visibility handle, present for queue messages
    pub fn visibility(&self) -> Option<&Visibility> {
        self.visibility.as_ref()
    }

    /// Whether the message was acknowledged through any path
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledgement
            .as_ref()
            .is_some_and(|ack| ack.is_acknowledged())
    }

    /// Acknowledge this message
    ///
    /// Acknowledging twice is a no-op. Needed with
    /// [`AcknowledgementMode::Never`](crate::acknowledgement::AcknowledgementMode::Never).
    pub async fn acknowledge(&self) -> Result<(), AcknowledgementError> {
        match &self.acknowledgement {
            Some(ack) => ack.acknowledge(self).await,
            None => Err(AcknowledgementError::NotAcknowledgeable(self.id.clone())),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("group_id", &self.group_id)
            .field("sequence_number", &self.sequence_number)
            .field("receive_count", &self.receive_count)
            .field("acknowledged", &self.is_acknowledged())
            .finish_non_exhaustive()
    }
}

/// Handle for changing a queue message's visibility
#[derive(Clone)]
pub struct Visibility {
    client: Arc<dyn QueueClient>,
    queue: String,
    receipt_handle: String,
}

impl Visibility {
    /// Hide the message for `timeout` from now
    pub async fn change_to(&self, timeout: Duration) -> Result<(), ProviderError> {
        self.client
            .change_visibility(&self.queue, std::slice::from_ref(&self.receipt_handle), timeout)
            .await
    }

    /// Change visibility of many messages with one call per queue
    ///
    /// Messages without a visibility handle are skipped.
    pub async fn change_batch(
        messages: &[Message],
        timeout: Duration,
    ) -> Result<(), ProviderError> {
        let mut by_queue: BTreeMap<&str, (Arc<dyn QueueClient>, Vec<String>)> = BTreeMap::new();
        for visibility in messages.iter().filter_map(|m| m.visibility.as_ref()) {
            by_queue
                .entry(visibility.queue.as_str())
                .or_insert_with(|| (Arc::clone(&visibility.client), Vec::new()))
                .1
                .push(visibility.receipt_handle.clone());
        }

        let mut result = Ok(());
        for (queue, (client, handles)) in by_queue {
            if let Err(e) = client.change_visibility(queue, &handles, timeout).await {
                warn!(queue, count = handles.len(), error = %e, "Failed to change visibility");
                result = Err(e);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::InMemoryQueueClient;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Order {
        id: u32,
    }

    #[test]
    fn test_json_body() {
        let message = Message::new("1", "orders", r#"{"id": 7}"#);
        assert_eq!(message.json::<Order>().unwrap(), Order { id: 7 });
        assert!(Message::new("2", "orders", "nope").json::<Order>().is_err());
    }

    #[test]
    fn test_group_key_defaults_to_empty() {
        let message = Message::new("1", "orders", "x");
        assert_eq!(message.group_key(), "");
        assert_eq!(message.with_group_id("g").group_key(), "g");
    }

    #[tokio::test]
    async fn test_detached_message_cannot_be_acknowledged() {
        let message = Message::new("1", "orders", "x");
        assert!(matches!(
            message.acknowledge().await,
            Err(AcknowledgementError::NotAcknowledgeable(_))
        ));
    }

    #[test]
    fn test_stream_record_envelope() {
        struct Noop;
        #[async_trait::async_trait]
        impl AcknowledgementCallback for Noop {
            async fn on_acknowledge(&self, _: Vec<Message>) -> Result<(), AcknowledgementError> {
                Ok(())
            }
        }

        let record = StreamRecord {
            sequence_number: "0042".into(),
            partition_key: "user-1".into(),
            data: "payload".into(),
            arrived_at: None,
        };
        let message = Message::from_stream_record(record, "events", "shard-0", Arc::new(Noop));
        assert_eq!(message.endpoint, "events/shard-0");
        assert_eq!(message.group_key(), "shard-0");
        assert_eq!(message.sequence_number.as_deref(), Some("0042"));
        assert_eq!(message.attributes[PARTITION_KEY_ATTRIBUTE], "user-1");
        assert!(message.visibility().is_none());
    }

    #[tokio::test]
    async fn test_change_batch_groups_by_queue() {
        struct Noop;
        #[async_trait::async_trait]
        impl AcknowledgementCallback for Noop {
            async fn on_acknowledge(&self, _: Vec<Message>) -> Result<(), AcknowledgementError> {
                Ok(())
            }
        }

        let client = Arc::new(InMemoryQueueClient::new());
        client.send_message("q", "a");
        client.send_message("q", "b");
        let raw = client.receive_messages("q", 10, Duration::ZERO).await.unwrap();
        let messages: Vec<Message> = raw
            .into_iter()
            .map(|m| Message::from_queue(m, "q", client.clone(), Arc::new(Noop)))
            .collect();

        Visibility::change_batch(&messages, Duration::from_secs(60))
            .await
            .unwrap();
        let changes = client.visibility_changes();
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.timeout == Duration::from_secs(60)));
    }
}
