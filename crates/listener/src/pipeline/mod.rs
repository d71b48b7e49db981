//! Message processing pipeline
//!
//! Every sink invocation runs a [`MessageProcessingPipeline`]: an ordered list
//! of [`ProcessingStage`]s threading a [`ProcessingUnit`] through
//!
//! ```text
//! context interceptors ─▶ interceptors ─▶ listener ─▶ error handler
//!        ─▶ after interceptors ─▶ after context interceptors ─▶ acknowledgement
//! ```
//!
//! The unit carries a [`ProcessingOutcome`], so a listener failure still
//! reaches the error handler, the after-processing interceptors and the
//! acknowledgement stage. A rejection by an interceptor skips the listener and
//! the acknowledgement.

mod error_handler;
mod interceptor;
mod listener;
mod stage;

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::acknowledgement::{AcknowledgementHandler, OnSuccessAcknowledgementHandler};
use crate::message::Message;

pub use error_handler::{
    BackoffJitter, ErrorHandler, ExponentialBackoffErrorHandler, LinearBackoffErrorHandler,
    LoggingErrorHandler,
};
pub use interceptor::MessageInterceptor;
pub use listener::{
    batch_listener_fn, listener_fn, BatchMessageListener, ListenerInvoker, MessageListener,
};
pub(crate) use stage::panic_message;
pub use stage::{
    AcknowledgementStage, AfterProcessingContextInterceptorStage, AfterProcessingInterceptorStage,
    BeforeProcessingContextInterceptorStage, BeforeProcessingInterceptorStage, ErrorHandlerStage,
    ListenerStage, ProcessingStage,
};

/// Error type returned by user code
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A listener invocation failed for some messages
#[derive(Debug, thiserror::Error)]
#[error("listener failed for {} message(s): {source}", messages.len())]
pub struct ListenerExecutionFailed {
    messages: Vec<Message>,
    #[source]
    source: BoxError,
}

impl ListenerExecutionFailed {
    /// Wrap a listener error
    pub fn new(messages: Vec<Message>, source: BoxError) -> Self {
        Self { messages, source }
    }

    /// Messages whose processing failed
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The listener's error
    pub fn cause(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.source.as_ref()
    }
}

/// State of one pipeline invocation
#[derive(Debug)]
pub enum ProcessingOutcome {
    /// The listener has not run yet
    Pending,
    /// The listener (or the error handler) completed successfully
    Succeeded,
    /// Processing failed and was not recovered
    Failed(ListenerExecutionFailed),
    /// An interceptor filtered the messages out
    Rejected,
}

impl ProcessingOutcome {
    /// Whether processing completed successfully
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessingOutcome::Succeeded)
    }

    /// The failure, if processing failed
    pub fn failure(&self) -> Option<&ListenerExecutionFailed> {
        match self {
            ProcessingOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Messages flowing through the pipeline together with their outcome
#[derive(Debug)]
pub struct ProcessingUnit {
    /// Messages of this invocation, after interception
    pub messages: Vec<Message>,
    /// Current outcome
    pub outcome: ProcessingOutcome,
}

impl ProcessingUnit {
    fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            outcome: ProcessingOutcome::Pending,
        }
    }
}

type BackPressureRelease = Arc<dyn Fn(usize) + Send + Sync>;

/// Per-emit context handed from the source to the sink and the pipeline
///
/// Carries context interceptors registered by sink adapters and the callback
/// returning permits to the source's backpressure handler.
#[derive(Clone, Default)]
pub struct ProcessingContext {
    interceptors: Vec<Arc<dyn MessageInterceptor>>,
    release: Option<BackPressureRelease>,
}

impl ProcessingContext {
    /// Empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a context interceptor
    pub fn with_interceptor(mut self, interceptor: Arc<dyn MessageInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Set the callback used to return permits
    pub fn with_back_pressure_release<F>(mut self, release: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.release = Some(Arc::new(release));
        self
    }

    /// Context interceptors in registration order
    pub fn interceptors(&self) -> &[Arc<dyn MessageInterceptor>] {
        &self.interceptors
    }

    /// Return `permits` to the backpressure handler
    pub fn release_back_pressure(&self, permits: usize) {
        if permits == 0 {
            return;
        }
        if let Some(release) = &self.release {
            release(permits);
        }
    }
}

impl fmt::Debug for ProcessingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingContext")
            .field("interceptors", &self.interceptors.len())
            .field("release", &self.release.is_some())
            .finish()
    }
}

/// Ordered chain of processing stages
pub struct MessageProcessingPipeline {
    stages: Vec<Box<dyn ProcessingStage>>,
}

impl MessageProcessingPipeline {
    /// Start building a pipeline around a listener
    pub fn builder(listener: ListenerInvoker) -> MessageProcessingPipelineBuilder {
        MessageProcessingPipelineBuilder {
            listener,
            interceptors: Vec::new(),
            error_handler: Arc::new(LoggingErrorHandler),
            acknowledgement_handler: Arc::new(OnSuccessAcknowledgementHandler),
        }
    }

    /// Stage names in execution order
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run the messages through every stage
    pub async fn process(
        &self,
        messages: Vec<Message>,
        context: &ProcessingContext,
    ) -> ProcessingUnit {
        let mut unit = ProcessingUnit::new(messages);
        for stage in &self.stages {
            unit = stage.process(unit, context).await;
        }
        trace!(
            count = unit.messages.len(),
            outcome = outcome_label(&unit.outcome),
            "pipeline finished"
        );
        unit
    }
}

fn outcome_label(outcome: &ProcessingOutcome) -> &'static str {
    match outcome {
        ProcessingOutcome::Pending => "pending",
        ProcessingOutcome::Succeeded => "succeeded",
        ProcessingOutcome::Failed(_) => "failed",
        ProcessingOutcome::Rejected => "rejected",
    }
}

/// Builder for [`MessageProcessingPipeline`]
pub struct MessageProcessingPipelineBuilder {
    listener: ListenerInvoker,
    interceptors: Vec<Arc<dyn MessageInterceptor>>,
    error_handler: Arc<dyn ErrorHandler>,
    acknowledgement_handler: Arc<dyn AcknowledgementHandler>,
}

impl MessageProcessingPipelineBuilder {
    /// Add an interceptor
    pub fn interceptor(mut self, interceptor: Arc<dyn MessageInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Add several interceptors
    pub fn interceptors(
        mut self,
        interceptors: impl IntoIterator<Item = Arc<dyn MessageInterceptor>>,
    ) -> Self {
        self.interceptors.extend(interceptors);
        self
    }

    /// Replace the default [`LoggingErrorHandler`]
    pub fn error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    /// Replace the default on-success acknowledgement handler
    pub fn acknowledgement_handler(mut self, handler: Arc<dyn AcknowledgementHandler>) -> Self {
        self.acknowledgement_handler = handler;
        self
    }

    /// Assemble the stages
    pub fn build(self) -> MessageProcessingPipeline {
        let interceptors: Arc<[Arc<dyn MessageInterceptor>]> = self.interceptors.into();
        let stages: Vec<Box<dyn ProcessingStage>> = vec![
            Box::new(BeforeProcessingContextInterceptorStage),
            Box::new(BeforeProcessingInterceptorStage::new(Arc::clone(&interceptors))),
            Box::new(ListenerStage::new(self.listener)),
            Box::new(ErrorHandlerStage::new(self.error_handler)),
            Box::new(AfterProcessingInterceptorStage::new(interceptors)),
            Box::new(AfterProcessingContextInterceptorStage),
            Box::new(AcknowledgementStage::new(self.acknowledgement_handler)),
        ];
        MessageProcessingPipeline { stages }
    }
}
