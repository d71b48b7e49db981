use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{MessageSink, SinkCompletion};
use crate::message::{Message, Visibility};
use crate::pipeline::{BoxError, ListenerExecutionFailed, MessageInterceptor, ProcessingContext};

/// Visibility applied when none is configured
pub const DEFAULT_MESSAGE_VISIBILITY: Duration = Duration::from_secs(30);

/// Keeps the messages of a batch hidden while they wait for their turn
///
/// Messages processed one after another (FIFO groups) would otherwise become
/// visible again before the listener reaches them.
pub struct MessageVisibilityExtendingSinkAdapter {
    delegate: Arc<dyn MessageSink>,
    visibility: Duration,
}

impl MessageVisibilityExtendingSinkAdapter {
    pub fn new(delegate: Arc<dyn MessageSink>, visibility: Duration) -> Self {
        Self {
            delegate,
            visibility,
        }
    }

    /// Visibility set on each extension
    pub fn visibility(&self) -> Duration {
        self.visibility
    }
}

struct PendingBatch {
    messages: Vec<Message>,
    last_extended_at: Instant,
}

/// Context interceptor tracking the unprocessed messages of one emit
struct VisibilityExtendingInterceptor {
    visibility: Duration,
    pending: Mutex<PendingBatch>,
}

impl VisibilityExtendingInterceptor {
    fn new(messages: &[Message], visibility: Duration) -> Self {
        let received_at = messages
            .iter()
            .map(|m| m.received_at)
            .min()
            .unwrap_or_else(Instant::now);
        Self {
            visibility,
            pending: Mutex::new(PendingBatch {
                messages: messages.to_vec(),
                last_extended_at: received_at,
            }),
        }
    }

    /// Messages to extend, if half the visibility passed since the last extension
    fn due(&self) -> Option<Vec<Message>> {
        let mut pending = self.pending.lock();
        if pending.messages.is_empty() || pending.last_extended_at.elapsed() < self.visibility / 2 {
            return None;
        }
        pending.last_extended_at = Instant::now();
        Some(pending.messages.clone())
    }

    async fn extend_if_due(&self) {
        let Some(messages) = self.due() else {
            return;
        };
        match Visibility::change_batch(&messages, self.visibility).await {
            Ok(()) => debug!(
                count = messages.len(),
                visibility_secs = self.visibility.as_secs(),
                "Extended visibility of waiting messages"
            ),
            Err(e) => warn!(count = messages.len(), error = %e, "Failed to extend visibility"),
        }
    }
}

#[async_trait]
impl MessageInterceptor for VisibilityExtendingInterceptor {
    async fn intercept(&self, message: Message) -> Result<Option<Message>, BoxError> {
        self.extend_if_due().await;
        Ok(Some(message))
    }

    async fn intercept_batch(&self, messages: Vec<Message>) -> Result<Vec<Message>, BoxError> {
        self.extend_if_due().await;
        Ok(messages)
    }

    async fn after_processing(
        &self,
        messages: &[Message],
        _error: Option<&ListenerExecutionFailed>,
    ) {
        let done: HashSet<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        self.pending
            .lock()
            .messages
            .retain(|m| !done.contains(m.id.as_str()));
    }
}

impl MessageSink for MessageVisibilityExtendingSinkAdapter {
    fn emit(&self, messages: Vec<Message>, context: ProcessingContext) -> SinkCompletion {
        let interceptor = Arc::new(VisibilityExtendingInterceptor::new(&messages, self.visibility));
        self.delegate
            .emit(messages, context.with_interceptor(interceptor))
    }

    fn start(&self) {
        self.delegate.start();
    }

    fn stop(&self) {
        self.delegate.stop();
    }

    fn is_running(&self) -> bool {
        self.delegate.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acknowledgement::test_support::RecordingCallback;
    use crate::executor::TaskExecutor;
    use crate::provider::{InMemoryQueueClient, QueueClient};
    use crate::sink::test_support::{counting_context, recording_pipeline};
    use crate::sink::OrderedMessageSink;

    async fn received(client: &Arc<InMemoryQueueClient>, count: usize) -> Vec<Message> {
        for i in 0..count {
            client.send_message("q", format!("m{}", i));
        }
        let callback = Arc::new(RecordingCallback::default());
        client
            .receive_messages("q", count, Duration::ZERO)
            .await
            .unwrap()
            .into_iter()
            .map(|raw| Message::from_queue(raw, "q", client.clone(), callback.clone()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_extends_waiting_messages() {
        let client = Arc::new(InMemoryQueueClient::new());
        let messages = received(&client, 3).await;

        let processed = Arc::new(Mutex::new(Vec::new()));
        let delegate = Arc::new(OrderedMessageSink::new(
            recording_pipeline(Arc::clone(&processed), Duration::from_secs(6)),
            TaskExecutor::new("test", 10).unwrap(),
        ));
        let adapter = MessageVisibilityExtendingSinkAdapter::new(delegate, Duration::from_secs(10));
        adapter.start();

        let (context, released) = counting_context();
        adapter.emit(messages, context).await;

        assert_eq!(processed.lock().len(), 3);
        assert_eq!(released.load(std::sync::atomic::Ordering::SeqCst), 3);
        // 6s per message against a 5s threshold: extended before the 2nd and 3rd.
        let changes = client.visibility_changes();
        assert_eq!(changes.len(), 3);
        assert!(changes.iter().all(|c| c.timeout == Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_no_extension_for_fast_batches() {
        let client = Arc::new(InMemoryQueueClient::new());
        let messages = received(&client, 3).await;

        let processed = Arc::new(Mutex::new(Vec::new()));
        let delegate = Arc::new(OrderedMessageSink::new(
            recording_pipeline(Arc::clone(&processed), Duration::ZERO),
            TaskExecutor::new("test", 10).unwrap(),
        ));
        let adapter =
            MessageVisibilityExtendingSinkAdapter::new(delegate, DEFAULT_MESSAGE_VISIBILITY);
        adapter.start();

        let (context, _) = counting_context();
        adapter.emit(messages, context).await;
        assert!(client.visibility_changes().is_empty());
    }
}
