//! In-memory provider clients for testing

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::{is_fifo_queue, ProviderError, QueueClient, RawMessage, StreamClient, StreamRecord};

/// How often an empty long poll re-checks for messages whose visibility expired
const EMPTY_POLL_RECHECK: Duration = Duration::from_millis(20);

struct StoredMessage {
    id: String,
    body: String,
    group_id: Option<String>,
    sequence_number: Option<String>,
    attributes: HashMap<String, String>,
    sent_at: DateTime<Utc>,
    receive_count: u32,
    receipt_handle: Option<String>,
    invisible_until: Option<Instant>,
}

impl StoredMessage {
    fn is_in_flight(&self, now: Instant) -> bool {
        self.invisible_until.is_some_and(|until| until > now)
    }
}

#[derive(Default)]
struct QueueState {
    messages: Vec<StoredMessage>,
    sequence: u64,
}

/// A recorded visibility change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibilityChange {
    /// Queue the change was issued against
    pub queue: String,
    /// Receipt handle of the message
    pub receipt_handle: String,
    /// New visibility timeout
    pub timeout: Duration,
}

/// In-memory queue service
///
/// Mimics the parts of a queue service the container relies on: visibility
/// timeouts, receive counts, long polling and, for `.fifo` queues, at most one
/// in-flight batch per message group. Every delete and visibility change is
/// recorded for assertions.
///
/// # Example
///
/// ```
/// use message_listener::provider::InMemoryQueueClient;
///
/// let client = InMemoryQueueClient::new();
/// client.create_queue("orders");
/// client.send_message("orders", "hello");
/// assert_eq!(client.visible_count("orders"), 1);
/// ```
pub struct InMemoryQueueClient {
    queues: RwLock<HashMap<String, QueueState>>,
    visibility_timeout: Duration,
    deletes: Mutex<Vec<(String, String)>>,
    visibility_changes: Mutex<Vec<VisibilityChange>>,
    injected_failures: Mutex<VecDeque<ProviderError>>,
    receive_calls: AtomicUsize,
    arrivals: Notify,
}

impl Default for InMemoryQueueClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueueClient {
    /// Create a client with a 30 second visibility timeout
    pub fn new() -> Self {
        Self::with_visibility_timeout(Duration::from_secs(30))
    }

    /// Create a client with a custom visibility timeout
    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            visibility_timeout,
            deletes: Mutex::new(Vec::new()),
            visibility_changes: Mutex::new(Vec::new()),
            injected_failures: Mutex::new(VecDeque::new()),
            receive_calls: AtomicUsize::new(0),
            arrivals: Notify::new(),
        }
    }

    /// Create an empty queue (no-op if it exists)
    pub fn create_queue(&self, queue: &str) {
        self.queues.write().entry(queue.to_string()).or_default();
    }

    /// Send a message, returning its id
    pub fn send_message(&self, queue: &str, body: impl Into<String>) -> String {
        self.send(queue, body.into(), None, HashMap::new())
    }

    /// Send a message to a FIFO message group, returning its id
    pub fn send_message_to_group(
        &self,
        queue: &str,
        group_id: &str,
        body: impl Into<String>,
    ) -> String {
        self.send(queue, body.into(), Some(group_id.to_string()), HashMap::new())
    }

    /// Send a message with attributes, returning its id
    pub fn send_message_with_attributes(
        &self,
        queue: &str,
        body: impl Into<String>,
        attributes: HashMap<String, String>,
    ) -> String {
        self.send(queue, body.into(), None, attributes)
    }

    fn send(
        &self,
        queue: &str,
        body: String,
        group_id: Option<String>,
        attributes: HashMap<String, String>,
    ) -> String {
        let id = Uuid::now_v7().to_string();
        {
            let mut queues = self.queues.write();
            let state = queues.entry(queue.to_string()).or_default();
            state.sequence += 1;
            let sequence_number = is_fifo_queue(queue).then(|| format!("{:020}", state.sequence));
            state.messages.push(StoredMessage {
                id: id.clone(),
                body,
                group_id,
                sequence_number,
                attributes,
                sent_at: Utc::now(),
                receive_count: 0,
                receipt_handle: None,
                invisible_until: None,
            });
        }
        self.arrivals.notify_waiters();
        id
    }

    /// Make the next receive fail with `error`
    pub fn fail_next_receive(&self, error: ProviderError) {
        self.injected_failures.lock().push_back(error);
    }

    /// Messages that can currently be received
    pub fn visible_count(&self, queue: &str) -> usize {
        let now = Instant::now();
        self.queues
            .read()
            .get(queue)
            .map(|state| state.messages.iter().filter(|m| !m.is_in_flight(now)).count())
            .unwrap_or(0)
    }

    /// Messages received and neither deleted nor expired
    pub fn in_flight_count(&self, queue: &str) -> usize {
        let now = Instant::now();
        self.queues
            .read()
            .get(queue)
            .map(|state| state.messages.iter().filter(|m| m.is_in_flight(now)).count())
            .unwrap_or(0)
    }

    /// Messages not yet deleted, visible or not
    pub fn message_count(&self, queue: &str) -> usize {
        self.queues
            .read()
            .get(queue)
            .map(|state| state.messages.len())
            .unwrap_or(0)
    }

    /// Receipt handles passed to `delete_messages` for a queue, in call order
    pub fn deleted_receipt_handles(&self, queue: &str) -> Vec<String> {
        self.deletes
            .lock()
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, handle)| handle.clone())
            .collect()
    }

    /// Number of receipt handles passed to `delete_messages`, across queues
    pub fn delete_count(&self) -> usize {
        self.deletes.lock().len()
    }

    /// Every visibility change issued so far
    pub fn visibility_changes(&self) -> Vec<VisibilityChange> {
        self.visibility_changes.lock().clone()
    }

    /// Number of receive calls, including failed ones
    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    fn take_visible(&self, queue: &str, max: usize) -> Result<Vec<RawMessage>, ProviderError> {
        let now = Instant::now();
        let fifo = is_fifo_queue(queue);
        let mut queues = self.queues.write();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| ProviderError::NotFound(queue.to_string()))?;

        let mut blocked_groups: HashSet<String> = HashSet::new();
        if fifo {
            for message in state.messages.iter().filter(|m| m.is_in_flight(now)) {
                if let Some(group) = &message.group_id {
                    blocked_groups.insert(group.clone());
                }
            }
        }

        let mut received = Vec::new();
        for message in state.messages.iter_mut() {
            if received.len() >= max {
                break;
            }
            if message.is_in_flight(now) {
                continue;
            }
            if let Some(group) = &message.group_id {
                if blocked_groups.contains(group) {
                    continue;
                }
            }

            let handle = Uuid::now_v7().to_string();
            message.receive_count += 1;
            message.receipt_handle = Some(handle.clone());
            message.invisible_until = Some(now + self.visibility_timeout);
            received.push(RawMessage {
                message_id: message.id.clone(),
                body: message.body.clone(),
                receipt_handle: handle,
                group_id: message.group_id.clone(),
                sequence_number: message.sequence_number.clone(),
                receive_count: message.receive_count,
                sent_at: Some(message.sent_at),
                attributes: message.attributes.clone(),
            });
        }
        Ok(received)
    }
}

#[async_trait]
impl QueueClient for InMemoryQueueClient {
    async fn receive_messages(
        &self,
        queue: &str,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<RawMessage>, ProviderError> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.injected_failures.lock().pop_front() {
            return Err(error);
        }

        let deadline = Instant::now() + wait;
        loop {
            let arrived = self.arrivals.notified();
            let received = self.take_visible(queue, max_messages)?;
            if !received.is_empty() {
                return Ok(received);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(received);
            }
            let recheck = (deadline - now).min(EMPTY_POLL_RECHECK);
            tokio::select! {
                _ = arrived => {}
                _ = tokio::time::sleep(recheck) => {}
            }
        }
    }

    async fn delete_messages(
        &self,
        queue: &str,
        receipt_handles: &[String],
    ) -> Result<(), ProviderError> {
        {
            let mut deletes = self.deletes.lock();
            for handle in receipt_handles {
                deletes.push((queue.to_string(), handle.clone()));
            }
        }

        let mut queues = self.queues.write();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| ProviderError::NotFound(queue.to_string()))?;
        state.messages.retain(|m| match &m.receipt_handle {
            Some(handle) => !receipt_handles.contains(handle),
            None => true,
        });
        Ok(())
    }

    async fn change_visibility(
        &self,
        queue: &str,
        receipt_handles: &[String],
        timeout: Duration,
    ) -> Result<(), ProviderError> {
        let now = Instant::now();
        {
            let mut queues = self.queues.write();
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| ProviderError::NotFound(queue.to_string()))?;
            for message in state.messages.iter_mut() {
                let matches = message
                    .receipt_handle
                    .as_ref()
                    .is_some_and(|h| receipt_handles.contains(h));
                if matches {
                    message.invisible_until = Some(now + timeout);
                }
            }
        }

        let mut changes = self.visibility_changes.lock();
        for handle in receipt_handles {
            changes.push(VisibilityChange {
                queue: queue.to_string(),
                receipt_handle: handle.clone(),
                timeout,
            });
        }
        if timeout.is_zero() {
            self.arrivals.notify_waiters();
        }
        Ok(())
    }
}

#[derive(Default)]
struct ShardState {
    records: Vec<StreamRecord>,
    position: usize,
    checkpoints: Vec<String>,
}

/// In-memory stream service
///
/// Each shard keeps an iterator position that advances on every
/// `get_records` call. Checkpoints are recorded per shard.
pub struct InMemoryStreamClient {
    shards: RwLock<HashMap<(String, String), ShardState>>,
    injected_failures: Mutex<VecDeque<ProviderError>>,
    sequence: AtomicUsize,
    arrivals: Notify,
}

impl Default for InMemoryStreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStreamClient {
    /// Create an empty stream client
    pub fn new() -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
            injected_failures: Mutex::new(VecDeque::new()),
            sequence: AtomicUsize::new(0),
            arrivals: Notify::new(),
        }
    }

    /// Create an empty shard (no-op if it exists)
    pub fn create_shard(&self, stream: &str, shard: &str) {
        self.shards
            .write()
            .entry((stream.to_string(), shard.to_string()))
            .or_default();
    }

    /// Append a record to a shard, returning its sequence number
    pub fn put_record(
        &self,
        stream: &str,
        shard: &str,
        partition_key: &str,
        data: impl Into<String>,
    ) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let sequence_number = format!("{:024}", sequence);
        self.shards
            .write()
            .entry((stream.to_string(), shard.to_string()))
            .or_default()
            .records
            .push(StreamRecord {
                sequence_number: sequence_number.clone(),
                partition_key: partition_key.to_string(),
                data: data.into(),
                arrived_at: Some(Utc::now()),
            });
        self.arrivals.notify_waiters();
        sequence_number
    }

    /// Make the next `get_records` fail with `error`
    pub fn fail_next_get_records(&self, error: ProviderError) {
        self.injected_failures.lock().push_back(error);
    }

    /// Checkpoints recorded for a shard, in call order
    pub fn checkpoints(&self, stream: &str, shard: &str) -> Vec<String> {
        self.shards
            .read()
            .get(&(stream.to_string(), shard.to_string()))
            .map(|state| state.checkpoints.clone())
            .unwrap_or_default()
    }

    /// Latest checkpoint of a shard
    pub fn last_checkpoint(&self, stream: &str, shard: &str) -> Option<String> {
        self.checkpoints(stream, shard).pop()
    }

    fn take_records(
        &self,
        stream: &str,
        shard: &str,
        max: usize,
    ) -> Result<Vec<StreamRecord>, ProviderError> {
        let mut shards = self.shards.write();
        let state = shards
            .get_mut(&(stream.to_string(), shard.to_string()))
            .ok_or_else(|| ProviderError::NotFound(format!("{}/{}", stream, shard)))?;
        let end = (state.position + max).min(state.records.len());
        let records = state.records[state.position..end].to_vec();
        state.position = end;
        Ok(records)
    }
}

#[async_trait]
impl StreamClient for InMemoryStreamClient {
    async fn get_records(
        &self,
        stream: &str,
        shard: &str,
        max_records: usize,
        wait: Duration,
    ) -> Result<Vec<StreamRecord>, ProviderError> {
        if let Some(error) = self.injected_failures.lock().pop_front() {
            return Err(error);
        }

        let deadline = Instant::now() + wait;
        loop {
            let arrived = self.arrivals.notified();
            let records = self.take_records(stream, shard, max_records)?;
            if !records.is_empty() || Instant::now() >= deadline {
                return Ok(records);
            }
            tokio::select! {
                _ = arrived => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    async fn checkpoint(
        &self,
        stream: &str,
        shard: &str,
        sequence_number: &str,
    ) -> Result<(), ProviderError> {
        let mut shards = self.shards.write();
        let state = shards
            .get_mut(&(stream.to_string(), shard.to_string()))
            .ok_or_else(|| ProviderError::NotFound(format!("{}/{}", stream, shard)))?;
        state.checkpoints.push(sequence_number.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receive_hides_messages_until_deleted() {
        let client = InMemoryQueueClient::new();
        client.send_message("q", "a");
        client.send_message("q", "b");

        let received = client
            .receive_messages("q", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].receive_count, 1);
        assert_eq!(client.in_flight_count("q"), 2);
        assert_eq!(client.visible_count("q"), 0);

        client
            .delete_messages("q", &[received[0].receipt_handle.clone()])
            .await
            .unwrap();
        assert_eq!(client.message_count("q"), 1);
        assert_eq!(
            client.deleted_receipt_handles("q"),
            vec![received[0].receipt_handle.clone()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_reappears_after_visibility_timeout() {
        let client = InMemoryQueueClient::with_visibility_timeout(Duration::from_secs(5));
        client.send_message("q", "a");

        let first = client.receive_messages("q", 1, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        let second = client.receive_messages("q", 1, Duration::ZERO).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].receive_count, 2);
        assert_ne!(first[0].receipt_handle, second[0].receipt_handle);
    }

    #[tokio::test]
    async fn test_change_visibility_zero_makes_message_visible() {
        let client = InMemoryQueueClient::new();
        client.send_message("q", "a");
        let received = client.receive_messages("q", 1, Duration::ZERO).await.unwrap();

        client
            .change_visibility("q", &[received[0].receipt_handle.clone()], Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(client.visible_count("q"), 1);
        assert_eq!(client.visibility_changes().len(), 1);
    }

    #[tokio::test]
    async fn test_fifo_blocks_groups_with_messages_in_flight() {
        let client = InMemoryQueueClient::new();
        client.send_message_to_group("q.fifo", "g1", "a1");
        client.send_message_to_group("q.fifo", "g1", "a2");
        client.send_message_to_group("q.fifo", "g2", "b1");

        let first = client.receive_messages("q.fifo", 1, Duration::ZERO).await.unwrap();
        assert_eq!(first[0].body, "a1");
        assert!(first[0].sequence_number.is_some());

        let second = client
            .receive_messages("q.fifo", 10, Duration::ZERO)
            .await
            .unwrap();
        let bodies: Vec<_> = second.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["b1"]);
    }

    #[tokio::test]
    async fn test_unknown_queue_is_not_found() {
        let client = InMemoryQueueClient::new();
        let result = client.receive_messages("missing", 1, Duration::ZERO).await;
        assert!(matches!(result, Err(ProviderError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let client = InMemoryQueueClient::new();
        client.create_queue("q");
        client.fail_next_receive(ProviderError::Throttled("slow down".into()));

        let result = client.receive_messages("q", 1, Duration::ZERO).await;
        assert!(matches!(result, Err(ProviderError::Throttled(_))));
        assert!(client.receive_messages("q", 1, Duration::ZERO).await.is_ok());
        assert_eq!(client.receive_calls(), 2);
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_send() {
        let client = std::sync::Arc::new(InMemoryQueueClient::new());
        client.create_queue("q");

        let receiver = {
            let client = std::sync::Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .receive_messages("q", 1, Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        client.send_message("q", "late");

        let received = receiver.await.unwrap();
        assert_eq!(received.len(), 1);
    }

    #[tokio::test]
    async fn test_stream_iterates_and_checkpoints() {
        let client = InMemoryStreamClient::new();
        let s1 = client.put_record("events", "shard-0", "k", "one");
        let s2 = client.put_record("events", "shard-0", "k", "two");

        let batch = client
            .get_records("events", "shard-0", 1, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(batch[0].sequence_number, s1);
        let batch = client
            .get_records("events", "shard-0", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(batch[0].sequence_number, s2);

        client.checkpoint("events", "shard-0", &s2).await.unwrap();
        assert_eq!(client.last_checkpoint("events", "shard-0"), Some(s2));
    }
}
