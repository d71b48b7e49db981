//! Message sinks
//!
//! A [`MessageSink`] takes the batches produced by a message source and runs
//! them through the [`MessageProcessingPipeline`] on the shared
//! [`TaskExecutor`]. After every pipeline invocation the sink returns one
//! backpressure permit per message through the [`ProcessingContext`].
//!
//! | Sink | Invocation | Ordering |
//! |------|------------|----------|
//! | [`FanOutMessageSink`] | one per message | none |
//! | [`BatchMessageSink`] | one per batch | n/a |
//! | [`OrderedMessageSink`] | one per message | sequential within the batch |
//!
//! Adapters wrap another sink: [`MessageGroupingSinkAdapter`] keeps message
//! groups sequential across polls, [`MessageVisibilityExtendingSinkAdapter`]
//! keeps waiting FIFO messages hidden.

mod batch;
mod fan_out;
mod grouping;
mod ordered;
mod visibility;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::executor::TaskExecutor;
use crate::message::Message;
use crate::pipeline::{panic_message, MessageProcessingPipeline, ProcessingContext};

pub use batch::BatchMessageSink;
pub use fan_out::FanOutMessageSink;
pub use grouping::MessageGroupingSinkAdapter;
pub use ordered::OrderedMessageSink;
pub use visibility::MessageVisibilityExtendingSinkAdapter;

/// Completes when every pipeline invocation of an emit has finished
pub type SinkCompletion = BoxFuture<'static, ()>;

/// Receives polled batches
pub trait MessageSink: Send + Sync {
    /// Dispatch messages; processing starts without awaiting the completion
    fn emit(&self, messages: Vec<Message>, context: ProcessingContext) -> SinkCompletion;

    /// Accept messages
    fn start(&self) {}

    /// Stop accepting messages; later emits only return their permits
    fn stop(&self) {}

    /// Whether the sink accepts messages
    fn is_running(&self) -> bool;
}

/// Pipeline, executor and lifecycle shared by the concrete sinks
pub(crate) struct SinkRuntime {
    name: &'static str,
    pipeline: Arc<MessageProcessingPipeline>,
    executor: TaskExecutor,
    running: AtomicBool,
}

impl SinkRuntime {
    pub(crate) fn new(
        name: &'static str,
        pipeline: Arc<MessageProcessingPipeline>,
        executor: TaskExecutor,
    ) -> Self {
        Self {
            name,
            pipeline,
            executor,
            running: AtomicBool::new(false),
        }
    }

    pub(crate) fn start(&self) {
        debug!(sink = self.name, "Starting sink");
        self.running.store(true, Ordering::SeqCst);
    }

    pub(crate) fn stop(&self) {
        debug!(sink = self.name, "Stopping sink");
        self.running.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    /// Return the permits of messages emitted to a stopped sink
    pub(crate) fn reject_if_stopped(
        &self,
        messages: &[Message],
        context: &ProcessingContext,
    ) -> Option<SinkCompletion> {
        if messages.is_empty() {
            return Some(futures::future::ready(()).boxed());
        }
        if self.is_running() {
            return None;
        }
        warn!(
            sink = self.name,
            count = messages.len(),
            "Sink not running, returning permits without processing"
        );
        context.release_back_pressure(messages.len());
        Some(futures::future::ready(()).boxed())
    }

    /// One pipeline invocation followed by the permit release
    pub(crate) async fn run(
        pipeline: Arc<MessageProcessingPipeline>,
        messages: Vec<Message>,
        context: ProcessingContext,
    ) {
        let count = messages.len();
        if let Err(payload) = AssertUnwindSafe(pipeline.process(messages, &context))
            .catch_unwind()
            .await
        {
            let detail = panic_message(payload.as_ref());
            error!(count, panic = %detail, "Pipeline invocation panicked");
        }
        context.release_back_pressure(count);
    }

    pub(crate) fn pipeline(&self) -> Arc<MessageProcessingPipeline> {
        Arc::clone(&self.pipeline)
    }
}

/// Await every handle, ignoring task errors already logged by the runner
pub(crate) fn join_handles(handles: Vec<tokio::task::JoinHandle<()>>) -> SinkCompletion {
    async move {
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Sink task failed");
            }
        }
    }
    .boxed()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::pipeline::{listener_fn, BoxError, ListenerInvoker};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Pipeline recording processed ids, sleeping `delay` per message
    pub fn recording_pipeline(
        processed: Arc<Mutex<Vec<String>>>,
        delay: Duration,
    ) -> Arc<MessageProcessingPipeline> {
        Arc::new(
            MessageProcessingPipeline::builder(ListenerInvoker::Single(listener_fn(
                move |message: Message| {
                    let processed = Arc::clone(&processed);
                    async move {
                        tokio::time::sleep(delay).await;
                        processed.lock().push(message.id.clone());
                        Ok::<_, BoxError>(())
                    }
                },
            )))
            .build(),
        )
    }

    /// Context counting released permits
    pub fn counting_context() -> (ProcessingContext, Arc<AtomicUsize>) {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let context = ProcessingContext::new().with_back_pressure_release(move |n| {
            counter.fetch_add(n, Ordering::SeqCst);
        });
        (context, released)
    }

    pub fn messages(ids: &[&str]) -> Vec<Message> {
        ids.iter().map(|id| Message::new(*id, "q", *id)).collect()
    }
}
