use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::BoxError;
use crate::message::Message;

/// Receives messages one at a time
#[async_trait]
pub trait MessageListener: Send + Sync {
    /// Process a message
    async fn on_message(&self, message: Message) -> Result<(), BoxError>;
}

/// Receives whole batches
#[async_trait]
pub trait BatchMessageListener: Send + Sync {
    /// Process a batch
    async fn on_messages(&self, messages: Vec<Message>) -> Result<(), BoxError>;
}

/// The listener a pipeline invokes
#[derive(Clone)]
pub enum ListenerInvoker {
    /// One invocation per message
    Single(Arc<dyn MessageListener>),
    /// One invocation per batch
    Batch(Arc<dyn BatchMessageListener>),
}

impl ListenerInvoker {
    /// Whether this invokes a batch listener
    pub fn is_batch(&self) -> bool {
        matches!(self, ListenerInvoker::Batch(_))
    }
}

struct FnListener<F>(F);

#[async_trait]
impl<F, Fut> MessageListener for FnListener<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    async fn on_message(&self, message: Message) -> Result<(), BoxError> {
        (self.0)(message).await
    }
}

struct FnBatchListener<F>(F);

#[async_trait]
impl<F, Fut> BatchMessageListener for FnBatchListener<F>
where
    F: Fn(Vec<Message>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    async fn on_messages(&self, messages: Vec<Message>) -> Result<(), BoxError> {
        (self.0)(messages).await
    }
}

/// Adapt an async closure into a [`MessageListener`]
///
/// ```
/// use message_listener::pipeline::{listener_fn, BoxError};
/// use message_listener::Message;
///
/// let listener = listener_fn(|message: Message| async move {
///     println!("received {}", message.body);
///     Ok::<_, BoxError>(())
/// });
/// # let _ = listener;
/// ```
pub fn listener_fn<F, Fut>(f: F) -> Arc<dyn MessageListener>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(FnListener(f))
}

/// Adapt an async closure into a [`BatchMessageListener`]
pub fn batch_listener_fn<F, Fut>(f: F) -> Arc<dyn BatchMessageListener>
where
    F: Fn(Vec<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(FnBatchListener(f))
}
