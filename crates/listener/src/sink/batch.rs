use std::sync::Arc;

use super::{join_handles, MessageSink, SinkCompletion, SinkRuntime};
use crate::executor::TaskExecutor;
use crate::message::Message;
use crate::pipeline::{MessageProcessingPipeline, ProcessingContext};

/// Processes a whole batch in a single pipeline invocation
pub struct BatchMessageSink {
    runtime: SinkRuntime,
}

impl BatchMessageSink {
    pub fn new(pipeline: Arc<MessageProcessingPipeline>, executor: TaskExecutor) -> Self {
        Self {
            runtime: SinkRuntime::new("batch", pipeline, executor),
        }
    }
}

impl MessageSink for BatchMessageSink {
    fn emit(&self, messages: Vec<Message>, context: ProcessingContext) -> SinkCompletion {
        if let Some(rejected) = self.runtime.reject_if_stopped(&messages, &context) {
            return rejected;
        }
        let handle = self
            .runtime
            .executor()
            .spawn(SinkRuntime::run(self.runtime.pipeline(), messages, context));
        join_handles(vec![handle])
    }

    fn start(&self) {
        self.runtime.start();
    }

    fn stop(&self) {
        self.runtime.stop();
    }

    fn is_running(&self) -> bool {
        self.runtime.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{batch_listener_fn, BoxError, ListenerInvoker};
    use crate::sink::test_support::{counting_context, messages};
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_single_invocation_for_whole_batch() {
        let batches: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&batches);
        let pipeline = Arc::new(
            MessageProcessingPipeline::builder(ListenerInvoker::Batch(batch_listener_fn(
                move |messages: Vec<Message>| {
                    recorded.lock().push(messages.len());
                    async { Ok::<_, BoxError>(()) }
                },
            )))
            .build(),
        );
        let sink = BatchMessageSink::new(pipeline, TaskExecutor::new("test", 10).unwrap());
        sink.start();

        let (context, released) = counting_context();
        sink.emit(messages(&["a", "b", "c", "d"]), context).await;

        assert_eq!(*batches.lock(), vec![4]);
        assert_eq!(released.load(Ordering::SeqCst), 4);
    }
}
