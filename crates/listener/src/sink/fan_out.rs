use std::sync::Arc;

use tracing::trace;

use super::{join_handles, MessageSink, SinkCompletion, SinkRuntime};
use crate::executor::TaskExecutor;
use crate::message::Message;
use crate::pipeline::{MessageProcessingPipeline, ProcessingContext};

/// Processes every message of a batch independently and in parallel
pub struct FanOutMessageSink {
    runtime: SinkRuntime,
}

impl FanOutMessageSink {
    pub fn new(pipeline: Arc<MessageProcessingPipeline>, executor: TaskExecutor) -> Self {
        Self {
            runtime: SinkRuntime::new("fan_out", pipeline, executor),
        }
    }
}

impl MessageSink for FanOutMessageSink {
    fn emit(&self, messages: Vec<Message>, context: ProcessingContext) -> SinkCompletion {
        if let Some(rejected) = self.runtime.reject_if_stopped(&messages, &context) {
            return rejected;
        }
        trace!(count = messages.len(), "fanning out messages");
        let handles = messages
            .into_iter()
            .map(|message| {
                self.runtime.executor().spawn(SinkRuntime::run(
                    self.runtime.pipeline(),
                    vec![message],
                    context.clone(),
                ))
            })
            .collect();
        join_handles(handles)
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
    use crate::pipeline::{listener_fn, BoxError, ListenerInvoker, MessageInterceptor};
    use crate::sink::test_support::{counting_context, messages, recording_pipeline};
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[tokio::test]
    async fn test_processes_all_and_releases_each_permit() {
        let processed = Arc::new(Mutex::new(Vec::new()));
        let sink = FanOutMessageSink::new(
            recording_pipeline(Arc::clone(&processed), Duration::from_millis(5)),
            TaskExecutor::new("test", 10).unwrap(),
        );
        sink.start();

        let (context, released) = counting_context();
        sink.emit(messages(&["a", "b", "c"]), context).await;

        let mut ids = processed.lock().clone();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(released.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_runs_in_parallel() {
        let processed = Arc::new(Mutex::new(Vec::new()));
        let sink = FanOutMessageSink::new(
            recording_pipeline(Arc::clone(&processed), Duration::from_millis(100)),
            TaskExecutor::new("test", 10).unwrap(),
        );
        sink.start();

        let started = tokio::time::Instant::now();
        let (context, _) = counting_context();
        sink.emit(messages(&["a", "b", "c", "d"]), context).await;
        assert!(started.elapsed() < Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_stopped_sink_returns_permits() {
        let processed = Arc::new(Mutex::new(Vec::new()));
        let sink = FanOutMessageSink::new(
            recording_pipeline(Arc::clone(&processed), Duration::ZERO),
            TaskExecutor::new("test", 10).unwrap(),
        );

        let (context, released) = counting_context();
        sink.emit(messages(&["a", "b"]), context).await;
        assert!(processed.lock().is_empty());
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    struct PanickingInterceptor;

    #[async_trait::async_trait]
    impl MessageInterceptor for PanickingInterceptor {
        async fn intercept(&self, message: Message) -> Result<Option<Message>, BoxError> {
            panic!("cannot intercept {}", message.id);
        }
    }

    #[tokio::test]
    async fn test_panicking_pipeline_still_releases_permits() {
        let pipeline = MessageProcessingPipeline::builder(ListenerInvoker::Single(listener_fn(
            |_message: Message| async { Ok::<_, BoxError>(()) },
        )))
        .interceptor(Arc::new(PanickingInterceptor))
        .build();
        let sink =
            FanOutMessageSink::new(Arc::new(pipeline), TaskExecutor::new("test", 10).unwrap());
        sink.start();

        let (context, released) = counting_context();
        sink.emit(messages(&["a", "b"]), context).await;
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }
}
