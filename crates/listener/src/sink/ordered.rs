use std::sync::Arc;

use super::{join_handles, MessageSink, SinkCompletion, SinkRuntime};
use crate::executor::TaskExecutor;
use crate::message::Message;
use crate::pipeline::{MessageProcessingPipeline, ProcessingContext};

/// Processes the messages of a batch one after another
///
/// Each message's permit is returned as soon as its own invocation completes.
pub struct OrderedMessageSink {
    runtime: SinkRuntime,
}

impl OrderedMessageSink {
    pub fn new(pipeline: Arc<MessageProcessingPipeline>, executor: TaskExecutor) -> Self {
        Self {
            runtime: SinkRuntime::new("ordered", pipeline, executor),
        }
    }
}

impl MessageSink for OrderedMessageSink {
    fn emit(&self, messages: Vec<Message>, context: ProcessingContext) -> SinkCompletion {
        if let Some(rejected) = self.runtime.reject_if_stopped(&messages, &context) {
            return rejected;
        }
        let pipeline = self.runtime.pipeline();
        let handle = self.runtime.executor().spawn(async move {
            for message in messages {
                SinkRuntime::run(Arc::clone(&pipeline), vec![message], context.clone()).await;
            }
        });
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
