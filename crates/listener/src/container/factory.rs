//! Sink and acknowledgement assembly per endpoint kind

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{ContainerError, MessageProvider};
use crate::acknowledgement::{
    AcknowledgementOrdering, AcknowledgementProcessor, AcknowledgementResultCallback,
    BatchingAcknowledgementProcessor, ImmediateAcknowledgementProcessor,
    QueueAcknowledgementExecutor, StreamCheckpointExecutor,
};
use crate::executor::TaskExecutor;
use crate::options::{ContainerOptions, FifoBatchGroupingStrategy, ListenerMode};
use crate::pipeline::MessageProcessingPipeline;
use crate::provider::is_fifo_queue;
use crate::sink::{
    BatchMessageSink, FanOutMessageSink, MessageGroupingSinkAdapter,
    MessageVisibilityExtendingSinkAdapter, MessageSink, OrderedMessageSink,
};

/// Default flush interval of batched queue acknowledgements
pub const DEFAULT_ACKNOWLEDGEMENT_INTERVAL: Duration = Duration::from_secs(1);

/// Default flush threshold of batched queue acknowledgements
pub const DEFAULT_ACKNOWLEDGEMENT_THRESHOLD: usize = 10;

/// Builds the per-endpoint components that depend on the endpoint kind
pub trait ComponentFactory: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Sink delivering the messages of one endpoint
    fn create_sink(
        &self,
        options: &ContainerOptions,
        pipeline: Arc<MessageProcessingPipeline>,
        executor: TaskExecutor,
    ) -> Arc<dyn MessageSink>;

    /// Acknowledgement processor of one endpoint
    fn create_acknowledgement_processor(
        &self,
        endpoint: &str,
        provider: &MessageProvider,
        options: &ContainerOptions,
        result_callback: Option<Arc<dyn AcknowledgementResultCallback>>,
    ) -> Result<Arc<dyn AcknowledgementProcessor>, ContainerError>;
}

/// Pick the factory matching the provider and endpoint names
///
/// Queue endpoints must be either all FIFO (`.fifo` suffix) or all standard.
pub fn select_component_factory(
    provider: &MessageProvider,
    endpoints: &[String],
) -> Result<Arc<dyn ComponentFactory>, ContainerError> {
    if endpoints.is_empty() {
        return Err(ContainerError::NoEndpoints);
    }
    match provider {
        MessageProvider::Stream { .. } => Ok(Arc::new(StreamComponentFactory)),
        MessageProvider::Queue(_) => {
            let fifo = endpoints.iter().filter(|e| is_fifo_queue(e)).count();
            match fifo {
                0 => Ok(Arc::new(StandardQueueComponentFactory)),
                n if n == endpoints.len() => Ok(Arc::new(FifoQueueComponentFactory)),
                _ => Err(ContainerError::MixedQueueTypes(endpoints.to_vec())),
            }
        }
    }
}

fn queue_executor(
    endpoint: &str,
    provider: &MessageProvider,
) -> Result<QueueAcknowledgementExecutor, ContainerError> {
    match provider {
        MessageProvider::Queue(client) => Ok(QueueAcknowledgementExecutor::new(
            Arc::clone(client),
            endpoint,
        )),
        MessageProvider::Stream { .. } => Err(ContainerError::MissingComponent("queue client")),
    }
}

/// Standard queues: parallel delivery, batched parallel acknowledgements
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardQueueComponentFactory;

impl ComponentFactory for StandardQueueComponentFactory {
    fn name(&self) -> &'static str {
        "standard"
    }

    fn create_sink(
        &self,
        options: &ContainerOptions,
        pipeline: Arc<MessageProcessingPipeline>,
        executor: TaskExecutor,
    ) -> Arc<dyn MessageSink> {
        match options.listener_mode {
            ListenerMode::SingleMessage => Arc::new(FanOutMessageSink::new(pipeline, executor)),
            ListenerMode::Batch => Arc::new(BatchMessageSink::new(pipeline, executor)),
        }
    }

    fn create_acknowledgement_processor(
        &self,
        endpoint: &str,
        provider: &MessageProvider,
        options: &ContainerOptions,
        result_callback: Option<Arc<dyn AcknowledgementResultCallback>>,
    ) -> Result<Arc<dyn AcknowledgementProcessor>, ContainerError> {
        let executor = Arc::new(queue_executor(endpoint, provider)?);
        let ordering = options
            .acknowledgement_ordering
            .unwrap_or(AcknowledgementOrdering::Parallel);
        let interval = options
            .acknowledgement_interval
            .unwrap_or(DEFAULT_ACKNOWLEDGEMENT_INTERVAL);
        let threshold = options
            .acknowledgement_threshold
            .unwrap_or(DEFAULT_ACKNOWLEDGEMENT_THRESHOLD);

        if interval.is_zero() && threshold == 0 {
            debug!(endpoint, ?ordering, "Using immediate acknowledgement");
            let mut processor =
                ImmediateAcknowledgementProcessor::new(endpoint, executor, ordering);
            if let Some(callback) = result_callback {
                processor = processor.with_result_callback(callback);
            }
            return Ok(Arc::new(processor));
        }

        Ok(Arc::new(BatchingAcknowledgementProcessor::new(
            endpoint,
            executor,
            ordering,
            Some(interval),
            Some(threshold),
            result_callback,
        )?))
    }
}

/// FIFO queues: ordered delivery per message group
#[derive(Debug, Default, Clone, Copy)]
pub struct FifoQueueComponentFactory;

impl ComponentFactory for FifoQueueComponentFactory {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn create_sink(
        &self,
        options: &ContainerOptions,
        pipeline: Arc<MessageProcessingPipeline>,
        executor: TaskExecutor,
    ) -> Arc<dyn MessageSink> {
        let mut sink: Arc<dyn MessageSink> = match options.listener_mode {
            ListenerMode::SingleMessage => Arc::new(OrderedMessageSink::new(pipeline, executor)),
            ListenerMode::Batch => Arc::new(BatchMessageSink::new(pipeline, executor)),
        };

        if let Some(visibility) = options.message_visibility {
            sink = Arc::new(MessageVisibilityExtendingSinkAdapter::new(sink, visibility));
        }

        let mixed_groups = options.listener_mode == ListenerMode::Batch
            && options.fifo_batch_grouping_strategy
                == FifoBatchGroupingStrategy::ProcessMultipleGroupsInSameBatch;
        if mixed_groups {
            sink
        } else {
            Arc::new(MessageGroupingSinkAdapter::new(sink))
        }
    }

    fn create_acknowledgement_processor(
        &self,
        endpoint: &str,
        provider: &MessageProvider,
        options: &ContainerOptions,
        result_callback: Option<Arc<dyn AcknowledgementResultCallback>>,
    ) -> Result<Arc<dyn AcknowledgementProcessor>, ContainerError> {
        let executor = Arc::new(queue_executor(endpoint, provider)?);
        let interval = options.acknowledgement_interval.filter(|i| !i.is_zero());
        let threshold = options.acknowledgement_threshold.filter(|t| *t > 0);

        if interval.is_none() && threshold.is_none() {
            let ordering = options
                .acknowledgement_ordering
                .unwrap_or(AcknowledgementOrdering::Parallel);
            let mut processor =
                ImmediateAcknowledgementProcessor::new(endpoint, executor, ordering);
            if let Some(callback) = result_callback {
                processor = processor.with_result_callback(callback);
            }
            return Ok(Arc::new(processor));
        }

        let ordering = options
            .acknowledgement_ordering
            .unwrap_or(AcknowledgementOrdering::Ordered);
        Ok(Arc::new(BatchingAcknowledgementProcessor::new(
            endpoint,
            executor,
            ordering,
            interval,
            threshold,
            result_callback,
        )?))
    }
}

/// Stream shards: ordered delivery per shard, ordered checkpoints
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamComponentFactory;

impl ComponentFactory for StreamComponentFactory {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn create_sink(
        &self,
        options: &ContainerOptions,
        pipeline: Arc<MessageProcessingPipeline>,
        executor: TaskExecutor,
    ) -> Arc<dyn MessageSink> {
        let sink: Arc<dyn MessageSink> = match options.listener_mode {
            ListenerMode::SingleMessage => Arc::new(OrderedMessageSink::new(pipeline, executor)),
            ListenerMode::Batch => Arc::new(BatchMessageSink::new(pipeline, executor)),
        };
        Arc::new(MessageGroupingSinkAdapter::new(sink))
    }

    fn create_acknowledgement_processor(
        &self,
        endpoint: &str,
        provider: &MessageProvider,
        options: &ContainerOptions,
        result_callback: Option<Arc<dyn AcknowledgementResultCallback>>,
    ) -> Result<Arc<dyn AcknowledgementProcessor>, ContainerError> {
        let MessageProvider::Stream { client, stream } = provider else {
            return Err(ContainerError::MissingComponent("stream client"));
        };
        let ordering = options
            .acknowledgement_ordering
            .unwrap_or(AcknowledgementOrdering::Ordered);
        let executor = Arc::new(StreamCheckpointExecutor::new(Arc::clone(client), stream.clone()));
        let mut processor = ImmediateAcknowledgementProcessor::new(endpoint, executor, ordering);
        if let Some(callback) = result_callback {
            processor = processor.with_result_callback(callback);
        }
        Ok(Arc::new(processor))
    }
}
