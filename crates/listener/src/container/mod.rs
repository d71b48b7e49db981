//! Message listener container
//!
//! [`MessageListenerContainer`] owns the lifecycle of everything that
//! consumes a set of endpoints (queues or stream shards). `start()` reads the
//! current [`ContainerOptions`] and builds, per endpoint:
//!
//! ```text
//!  backpressure handler ◀── permits ──┐
//!          │                          │
//!          ▼                          │
//!  PollingMessageSource ─▶ sink ─▶ pipeline (shared) on TaskExecutor (shared)
//!                                     │
//!                                     ▼
//!                          acknowledgement processor ─▶ delete / checkpoint
//! ```
//!
//! `stop()` drains every source within `listener_shutdown_timeout`, then
//! flushes acknowledgements within `acknowledgement_shutdown_timeout`. Options
//! replaced while stopped take effect on the next `start()`.

mod factory;

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::acknowledgement::{
    acknowledgement_handler, AcknowledgementError, AcknowledgementProcessor,
    AcknowledgementResultCallback,
};
use crate::backpressure::{adaptive_back_pressure_handler, BackPressureError};
use crate::executor::{ExecutorError, TaskExecutor};
use crate::options::{ContainerOptions, ContainerOptionsError, ListenerMode};
use crate::pipeline::{
    BatchMessageListener, ErrorHandler, ListenerInvoker, MessageInterceptor, MessageListener,
    MessageProcessingPipeline,
};
use crate::provider::{QueueClient, StreamClient};
use crate::sink::MessageSink;
use crate::source::{
    MessageFetcher, MessageSource, PollingMessageSource, QueueMessageFetcher, ShardMessageFetcher,
};

pub use factory::{
    select_component_factory, ComponentFactory, FifoQueueComponentFactory,
    StandardQueueComponentFactory, StreamComponentFactory, DEFAULT_ACKNOWLEDGEMENT_INTERVAL,
    DEFAULT_ACKNOWLEDGEMENT_THRESHOLD,
};

/// Container errors
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// `start()` on a running container, or options replaced while running
    #[error("container {0} is already running")]
    AlreadyRunning(String),

    /// Invalid options
    #[error(transparent)]
    Options(#[from] ContainerOptionsError),

    /// Backpressure handler could not be built
    #[error(transparent)]
    BackPressure(#[from] BackPressureError),

    /// Acknowledgement processor could not be built
    #[error(transparent)]
    Acknowledgement(#[from] AcknowledgementError),

    /// Pipeline executor could not be built
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// A required component was not provided
    #[error("missing component: {0}")]
    MissingComponent(&'static str),

    /// The listener kind does not match the configured listener mode
    #[error("listener mode {mode:?} needs a {expected} listener")]
    ListenerModeMismatch {
        mode: ListenerMode,
        expected: &'static str,
    },

    /// `max_concurrent_messages × endpoints` does not fit the executor
    #[error("executor size overflows: {max_concurrent_messages} x {endpoints} endpoints")]
    ExecutorSizeOverflow {
        max_concurrent_messages: usize,
        endpoints: usize,
    },

    /// No queue or shard to consume
    #[error("no endpoints configured")]
    NoEndpoints,

    /// FIFO and standard queues in the same container
    #[error("cannot mix FIFO and standard queues: {0:?}")]
    MixedQueueTypes(Vec<String>),
}

/// Service the container consumes from
#[derive(Clone)]
pub enum MessageProvider {
    /// Queue endpoints, one per queue name
    Queue(Arc<dyn QueueClient>),
    /// Shard endpoints of a single stream
    Stream {
        client: Arc<dyn StreamClient>,
        stream: String,
    },
}

impl fmt::Debug for MessageProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageProvider::Queue(_) => f.write_str("Queue"),
            MessageProvider::Stream { stream, .. } => {
                f.debug_struct("Stream").field("stream", stream).finish()
            }
        }
    }
}

/// Container lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerStatus::Stopped => write!(f, "stopped"),
            ContainerStatus::Starting => write!(f, "starting"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Stopping => write!(f, "stopping"),
        }
    }
}

/// Components of one endpoint
struct EndpointComponents {
    endpoint: String,
    source: Arc<PollingMessageSource>,
    sink: Arc<dyn MessageSink>,
    processor: Arc<dyn AcknowledgementProcessor>,
}

/// Everything built by `start()`
struct RunningComponents {
    endpoints: Vec<EndpointComponents>,
    executor: TaskExecutor,
}

/// Consumes a set of endpoints with a listener
///
/// # Example
///
/// ```ignore
/// use message_listener::container::{MessageListenerContainer, MessageProvider};
/// use message_listener::pipeline::listener_fn;
///
/// let container = MessageListenerContainer::builder()
///     .id("orders")
///     .provider(MessageProvider::Queue(client))
///     .endpoint("orders")
///     .listener(listener_fn(|message: Message| async move {
///         println!("{}", message.body);
///         Ok(())
///     }))
///     .build()?;
///
/// container.start().await?;
/// // ...
/// container.stop().await?;
/// ```
pub struct MessageListenerContainer {
    id: String,
    provider: MessageProvider,
    endpoints: Vec<String>,
    listener: ListenerInvoker,
    interceptors: Vec<Arc<dyn MessageInterceptor>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    result_callback: Option<Arc<dyn AcknowledgementResultCallback>>,
    component_factory: Arc<dyn ComponentFactory>,
    options: RwLock<ContainerOptions>,
    status: RwLock<ContainerStatus>,
    components: RwLock<Option<Arc<RunningComponents>>>,
    lifecycle: Mutex<()>,
}

impl MessageListenerContainer {
    /// Start building a container
    pub fn builder() -> MessageListenerContainerBuilder {
        MessageListenerContainerBuilder::default()
    }

    /// Container id used in logs and executor names
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Consumed endpoints
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Copy of the current options
    pub fn options(&self) -> ContainerOptions {
        self.options.read().clone()
    }

    /// Replace the options used by the next `start()`
    pub fn set_options(&self, options: ContainerOptions) -> Result<(), ContainerError> {
        if self.status() != ContainerStatus::Stopped {
            return Err(ContainerError::AlreadyRunning(self.id.clone()));
        }
        options.validate()?;
        *self.options.write() = options;
        Ok(())
    }

    /// Current status
    pub fn status(&self) -> ContainerStatus {
        *self.status.read()
    }

    /// Whether the container is running
    pub fn is_running(&self) -> bool {
        self.status() == ContainerStatus::Running
    }

    /// Backpressure permits currently available for an endpoint
    ///
    /// Once stopped, reports the state the last run ended with.
    pub fn available_permits(&self, endpoint: &str) -> Option<usize> {
        let components = self.components.read().clone()?;
        components
            .endpoints
            .iter()
            .find(|c| c.endpoint == endpoint)
            .and_then(|c| c.source.back_pressure_handler().available_permits())
    }

    /// Whether the source of an endpoint is still polling
    pub fn is_endpoint_running(&self, endpoint: &str) -> bool {
        self.components.read().as_ref().is_some_and(|components| {
            components
                .endpoints
                .iter()
                .any(|c| c.endpoint == endpoint && c.source.is_running())
        })
    }

    fn set_status(&self, status: ContainerStatus) {
        debug!(container = %self.id, %status, "Container status");
        *self.status.write() = status;
    }

    fn check_listener_mode(&self, options: &ContainerOptions) -> Result<(), ContainerError> {
        match (options.listener_mode, self.listener.is_batch()) {
            (ListenerMode::SingleMessage, true) => Err(ContainerError::ListenerModeMismatch {
                mode: options.listener_mode,
                expected: "single message",
            }),
            (ListenerMode::Batch, false) => Err(ContainerError::ListenerModeMismatch {
                mode: options.listener_mode,
                expected: "batch",
            }),
            _ => Ok(()),
        }
    }

    fn build_fetcher(
        &self,
        endpoint: &str,
        processor: &Arc<dyn AcknowledgementProcessor>,
    ) -> Arc<dyn MessageFetcher> {
        let callback = Arc::clone(processor).as_callback();
        match &self.provider {
            MessageProvider::Queue(client) => Arc::new(QueueMessageFetcher::new(
                Arc::clone(client),
                endpoint,
                callback,
            )),
            MessageProvider::Stream { client, stream } => Arc::new(ShardMessageFetcher::new(
                Arc::clone(client),
                stream.clone(),
                endpoint,
                callback,
            )),
        }
    }

    fn build(&self, options: &ContainerOptions) -> Result<RunningComponents, ContainerError> {
        options.validate()?;
        self.check_listener_mode(options)?;

        let concurrency = options
            .max_concurrent_messages
            .checked_mul(self.endpoints.len())
            .ok_or(ContainerError::ExecutorSizeOverflow {
                max_concurrent_messages: options.max_concurrent_messages,
                endpoints: self.endpoints.len(),
            })?;
        let executor = TaskExecutor::new(format!("{}-pipeline", self.id), concurrency)?;

        let mut pipeline = MessageProcessingPipeline::builder(self.listener.clone())
            .interceptors(self.interceptors.iter().cloned())
            .acknowledgement_handler(acknowledgement_handler(options.acknowledgement_mode));
        if let Some(handler) = &self.error_handler {
            pipeline = pipeline.error_handler(Arc::clone(handler));
        }
        let pipeline = Arc::new(pipeline.build());

        let mut endpoints = Vec::with_capacity(self.endpoints.len());
        for endpoint in &self.endpoints {
            let handler = match &options.back_pressure_handler_factory {
                Some(factory) => factory.create(options)?,
                None => adaptive_back_pressure_handler(options)?,
            };
            let processor = self.component_factory.create_acknowledgement_processor(
                endpoint,
                &self.provider,
                options,
                self.result_callback.clone(),
            )?;
            let sink = self.component_factory.create_sink(
                options,
                Arc::clone(&pipeline),
                executor.clone(),
            );
            let fetcher = self.build_fetcher(endpoint, &processor);
            let source = Arc::new(PollingMessageSource::new(
                fetcher,
                handler,
                Arc::clone(&sink),
                options,
            ));
            endpoints.push(EndpointComponents {
                endpoint: endpoint.clone(),
                source,
                sink,
                processor,
            });
        }

        Ok(RunningComponents {
            endpoints,
            executor,
        })
    }

    /// Build and start every endpoint
    #[instrument(skip(self), fields(container = %self.id))]
    pub async fn start(&self) -> Result<(), ContainerError> {
        let _guard = self.lifecycle.lock().await;
        if self.status() != ContainerStatus::Stopped {
            return Err(ContainerError::AlreadyRunning(self.id.clone()));
        }

        self.set_status(ContainerStatus::Starting);
        let options = self.options();
        let components = match self.build(&options) {
            Ok(components) => components,
            Err(e) => {
                self.set_status(ContainerStatus::Stopped);
                return Err(e);
            }
        };

        for endpoint in &components.endpoints {
            endpoint.processor.start();
            endpoint.sink.start();
        }
        for endpoint in &components.endpoints {
            endpoint.source.start();
        }

        *self.components.write() = Some(Arc::new(components));
        self.set_status(ContainerStatus::Running);
        info!(
            container = %self.id,
            factory = self.component_factory.name(),
            endpoints = ?self.endpoints,
            max_concurrent_messages = options.max_concurrent_messages,
            listener_mode = ?options.listener_mode,
            acknowledgement_mode = ?options.acknowledgement_mode,
            "Container started"
        );
        Ok(())
    }

    /// Stop polling, drain in-flight messages and flush acknowledgements
    ///
    /// Stopping a stopped container is a no-op. Drain and flush timeouts are
    /// logged, not returned.
    #[instrument(skip(self), fields(container = %self.id))]
    pub async fn stop(&self) -> Result<(), ContainerError> {
        let _guard = self.lifecycle.lock().await;
        if self.status() != ContainerStatus::Running {
            return Ok(());
        }
        let Some(components) = self.components.read().clone() else {
            return Ok(());
        };

        info!(container = %self.id, "Stopping container");
        self.set_status(ContainerStatus::Stopping);
        let options = self.options();

        let drained = join_all(components.endpoints.iter().map(|c| c.source.stop())).await;
        for (endpoint, drained) in components.endpoints.iter().zip(&drained) {
            if !drained {
                warn!(
                    container = %self.id,
                    endpoint = %endpoint.endpoint,
                    timeout_ms = options.listener_shutdown_timeout.as_millis() as u64,
                    "Endpoint did not drain in time"
                );
            }
        }

        for endpoint in &components.endpoints {
            endpoint.sink.stop();
        }

        let flushed = join_all(
            components
                .endpoints
                .iter()
                .map(|c| c.processor.stop(options.acknowledgement_shutdown_timeout)),
        )
        .await;
        if flushed.iter().any(|f| !f) {
            warn!(
                container = %self.id,
                timeout_ms = options.acknowledgement_shutdown_timeout.as_millis() as u64,
                "Acknowledgements did not finish in time, remaining ones are discarded"
            );
        }

        self.set_status(ContainerStatus::Stopped);
        info!(
            container = %self.id,
            drained = drained.iter().all(|d| *d),
            active_tasks = components.executor.active_tasks(),
            "Container stopped"
        );
        Ok(())
    }
}

impl fmt::Debug for MessageListenerContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageListenerContainer")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("endpoints", &self.endpoints)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Builder for [`MessageListenerContainer`]
#[derive(Default)]
pub struct MessageListenerContainerBuilder {
    id: Option<String>,
    provider: Option<MessageProvider>,
    endpoints: Vec<String>,
    listener: Option<ListenerInvoker>,
    interceptors: Vec<Arc<dyn MessageInterceptor>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    result_callback: Option<Arc<dyn AcknowledgementResultCallback>>,
    component_factory: Option<Arc<dyn ComponentFactory>>,
    options: Option<ContainerOptions>,
}

impl MessageListenerContainerBuilder {
    /// Container id, a generated one when unset
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn provider(mut self, provider: MessageProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Consume from a queue client
    pub fn queue_client(self, client: Arc<dyn QueueClient>) -> Self {
        self.provider(MessageProvider::Queue(client))
    }

    /// Consume the shards of a stream
    pub fn stream_client(self, client: Arc<dyn StreamClient>, stream: impl Into<String>) -> Self {
        self.provider(MessageProvider::Stream {
            client,
            stream: stream.into(),
        })
    }

    /// Add an endpoint: a queue name or a shard id
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    pub fn endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoints.extend(endpoints.into_iter().map(Into::into));
        self
    }

    /// Listener invoked once per message
    pub fn listener(mut self, listener: Arc<dyn MessageListener>) -> Self {
        self.listener = Some(ListenerInvoker::Single(listener));
        self
    }

    /// Listener invoked once per batch, needs [`ListenerMode::Batch`]
    pub fn batch_listener(mut self, listener: Arc<dyn BatchMessageListener>) -> Self {
        self.listener = Some(ListenerInvoker::Batch(listener));
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn MessageInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Observe provider acknowledgement results
    pub fn acknowledgement_result_callback(
        mut self,
        callback: Arc<dyn AcknowledgementResultCallback>,
    ) -> Self {
        self.result_callback = Some(callback);
        self
    }

    /// Replace the factory picked from the endpoint kind
    pub fn component_factory(mut self, factory: Arc<dyn ComponentFactory>) -> Self {
        self.component_factory = Some(factory);
        self
    }

    pub fn options(mut self, options: ContainerOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn build(self) -> Result<MessageListenerContainer, ContainerError> {
        let provider = self
            .provider
            .ok_or(ContainerError::MissingComponent("provider"))?;
        let listener = self
            .listener
            .ok_or(ContainerError::MissingComponent("listener"))?;
        let component_factory = match self.component_factory {
            Some(factory) => factory,
            None => select_component_factory(&provider, &self.endpoints)?,
        };
        if self.endpoints.is_empty() {
            return Err(ContainerError::NoEndpoints);
        }

        let options = self.options.unwrap_or_default();
        options.validate()?;

        let id = self
            .id
            .unwrap_or_else(|| format!("container-{}", uuid::Uuid::now_v7()));
        let container = MessageListenerContainer {
            id,
            provider,
            endpoints: self.endpoints,
            listener,
            interceptors: self.interceptors,
            error_handler: self.error_handler,
            result_callback: self.result_callback,
            component_factory,
            options: RwLock::new(options),
            status: RwLock::new(ContainerStatus::Stopped),
            components: RwLock::new(None),
            lifecycle: Mutex::new(()),
        };
        container.check_listener_mode(&container.options())?;
        Ok(container)
    }
}
