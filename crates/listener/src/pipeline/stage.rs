//! Pipeline stages

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error};

use super::{
    BoxError, ErrorHandler, ListenerExecutionFailed, ListenerInvoker, MessageInterceptor,
    ProcessingContext, ProcessingOutcome, ProcessingUnit,
};
use crate::acknowledgement::AcknowledgementHandler;
use crate::message::Message;

/// One step of the pipeline
#[async_trait]
pub trait ProcessingStage: Send + Sync {
    /// Stage name for logs
    fn name(&self) -> &'static str;

    /// Process the unit and hand it to the next stage
    async fn process(&self, unit: ProcessingUnit, context: &ProcessingContext) -> ProcessingUnit;
}

async fn intercept_before(
    interceptors: &[Arc<dyn MessageInterceptor>],
    mut unit: ProcessingUnit,
) -> ProcessingUnit {
    if !matches!(unit.outcome, ProcessingOutcome::Pending) {
        return unit;
    }
    for interceptor in interceptors {
        let messages = unit.messages.clone();
        let result = if messages.len() == 1 {
            let mut messages = messages;
            interceptor
                .intercept(messages.remove(0))
                .await
                .map(|m| m.into_iter().collect::<Vec<_>>())
        } else {
            interceptor.intercept_batch(messages).await
        };

        match result {
            Ok(intercepted) if intercepted.is_empty() => {
                debug!(count = unit.messages.len(), "Messages rejected by interceptor");
                unit.outcome = ProcessingOutcome::Rejected;
                return unit;
            }
            Ok(intercepted) => unit.messages = intercepted,
            Err(e) => {
                let failure = ListenerExecutionFailed::new(unit.messages.clone(), e);
                unit.outcome = ProcessingOutcome::Failed(failure);
                return unit;
            }
        }
    }
    unit
}

async fn intercept_after(interceptors: &[Arc<dyn MessageInterceptor>], unit: &ProcessingUnit) {
    if matches!(unit.outcome, ProcessingOutcome::Pending) {
        return;
    }
    for interceptor in interceptors {
        interceptor
            .after_processing(&unit.messages, unit.outcome.failure())
            .await;
    }
}

/// Runs the context interceptors registered by sink adapters
#[derive(Debug, Default, Clone, Copy)]
pub struct BeforeProcessingContextInterceptorStage;

#[async_trait]
impl ProcessingStage for BeforeProcessingContextInterceptorStage {
    fn name(&self) -> &'static str {
        "before_processing_context_interceptors"
    }

    async fn process(&self, unit: ProcessingUnit, context: &ProcessingContext) -> ProcessingUnit {
        intercept_before(context.interceptors(), unit).await
    }
}

/// Runs the container's interceptors
pub struct BeforeProcessingInterceptorStage {
    interceptors: Arc<[Arc<dyn MessageInterceptor>]>,
}

impl BeforeProcessingInterceptorStage {
    pub fn new(interceptors: Arc<[Arc<dyn MessageInterceptor>]>) -> Self {
        Self { interceptors }
    }
}

#[async_trait]
impl ProcessingStage for BeforeProcessingInterceptorStage {
    fn name(&self) -> &'static str {
        "before_processing_interceptors"
    }

    async fn process(&self, unit: ProcessingUnit, _context: &ProcessingContext) -> ProcessingUnit {
        intercept_before(&self.interceptors, unit).await
    }
}

/// Text of a panic payload, for `panic!("literal")` and formatted panics alike
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn panic_error(payload: Box<dyn Any + Send>) -> BoxError {
    format!("listener panicked: {}", panic_message(payload.as_ref())).into()
}

/// Invokes the listener, capturing errors and panics
pub struct ListenerStage {
    listener: ListenerInvoker,
}

impl ListenerStage {
    pub fn new(listener: ListenerInvoker) -> Self {
        Self { listener }
    }

    async fn invoke_single(&self, messages: &[Message]) -> ProcessingOutcome {
        let ListenerInvoker::Single(listener) = &self.listener else {
            return ProcessingOutcome::Pending;
        };
        let mut failed = Vec::new();
        let mut first_error: Option<BoxError> = None;
        for message in messages {
            let result = AssertUnwindSafe(listener.on_message(message.clone()))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(panic_error(payload)));
            if let Err(e) = result {
                debug!(message_id = %message.id, error = %e, "Listener returned an error");
                failed.push(message.clone());
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => ProcessingOutcome::Succeeded,
            Some(e) => ProcessingOutcome::Failed(ListenerExecutionFailed::new(failed, e)),
        }
    }

    async fn invoke_batch(&self, messages: &[Message]) -> ProcessingOutcome {
        let ListenerInvoker::Batch(listener) = &self.listener else {
            return ProcessingOutcome::Pending;
        };
        let result = AssertUnwindSafe(listener.on_messages(messages.to_vec()))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(panic_error(payload)));
        match result {
            Ok(()) => ProcessingOutcome::Succeeded,
            Err(e) => ProcessingOutcome::Failed(ListenerExecutionFailed::new(messages.to_vec(), e)),
        }
    }
}

#[async_trait]
impl ProcessingStage for ListenerStage {
    fn name(&self) -> &'static str {
        "listener"
    }

    async fn process(
        &self,
        mut unit: ProcessingUnit,
        _context: &ProcessingContext,
    ) -> ProcessingUnit {
        if !matches!(unit.outcome, ProcessingOutcome::Pending) {
            return unit;
        }
        unit.outcome = match &self.listener {
            ListenerInvoker::Single(_) => self.invoke_single(&unit.messages).await,
            ListenerInvoker::Batch(_) => self.invoke_batch(&unit.messages).await,
        };
        unit
    }
}

/// Gives failures to the error handler
pub struct ErrorHandlerStage {
    handler: Arc<dyn ErrorHandler>,
}

impl ErrorHandlerStage {
    pub fn new(handler: Arc<dyn ErrorHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl ProcessingStage for ErrorHandlerStage {
    fn name(&self) -> &'static str {
        "error_handler"
    }

    async fn process(
        &self,
        mut unit: ProcessingUnit,
        _context: &ProcessingContext,
    ) -> ProcessingUnit {
        let outcome = std::mem::replace(&mut unit.outcome, ProcessingOutcome::Pending);
        unit.outcome = match outcome {
            ProcessingOutcome::Failed(failure) => {
                let handled = AssertUnwindSafe(self.handler.handle(failure))
                    .catch_unwind()
                    .await;
                match handled {
                    Ok(Ok(())) => {
                        debug!(count = unit.messages.len(), "Error handler recovered failure");
                        ProcessingOutcome::Succeeded
                    }
                    Ok(Err(failure)) => ProcessingOutcome::Failed(failure),
                    Err(payload) => {
                        let e = panic_error(payload);
                        error!(error = %e, "Error handler panicked");
                        ProcessingOutcome::Failed(ListenerExecutionFailed::new(
                            unit.messages.clone(),
                            e,
                        ))
                    }
                }
            }
            other => other,
        };
        unit
    }
}

/// Runs the container's after-processing hooks
pub struct AfterProcessingInterceptorStage {
    interceptors: Arc<[Arc<dyn MessageInterceptor>]>,
}

impl AfterProcessingInterceptorStage {
    pub fn new(interceptors: Arc<[Arc<dyn MessageInterceptor>]>) -> Self {
        Self { interceptors }
    }
}

#[async_trait]
impl ProcessingStage for AfterProcessingInterceptorStage {
    fn name(&self) -> &'static str {
        "after_processing_interceptors"
    }

    async fn process(&self, unit: ProcessingUnit, _context: &ProcessingContext) -> ProcessingUnit {
        intercept_after(&self.interceptors, &unit).await;
        unit
    }
}

/// Runs the after-processing hooks of context interceptors
#[derive(Debug, Default, Clone, Copy)]
pub struct AfterProcessingContextInterceptorStage;

#[async_trait]
impl ProcessingStage for AfterProcessingContextInterceptorStage {
    fn name(&self) -> &'static str {
        "after_processing_context_interceptors"
    }

    async fn process(&self, unit: ProcessingUnit, context: &ProcessingContext) -> ProcessingUnit {
        intercept_after(context.interceptors(), &unit).await;
        unit
    }
}

/// Hands the outcome to the acknowledgement handler
///
/// On a partial failure the messages that did not fail count as successes.
pub struct AcknowledgementStage {
    handler: Arc<dyn AcknowledgementHandler>,
}

impl AcknowledgementStage {
    pub fn new(handler: Arc<dyn AcknowledgementHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl ProcessingStage for AcknowledgementStage {
    fn name(&self) -> &'static str {
        "acknowledgement"
    }

    async fn process(&self, unit: ProcessingUnit, _context: &ProcessingContext) -> ProcessingUnit {
        match &unit.outcome {
            ProcessingOutcome::Succeeded => self.handler.on_success(&unit.messages).await,
            ProcessingOutcome::Failed(failure) => {
                let failed: HashSet<&str> =
                    failure.messages().iter().map(|m| m.id.as_str()).collect();
                let succeeded: Vec<Message> = unit
                    .messages
                    .iter()
                    .filter(|m| !failed.contains(m.id.as_str()))
                    .cloned()
                    .collect();
                if !succeeded.is_empty() {
                    self.handler.on_success(&succeeded).await;
                }
                self.handler.on_error(failure.messages(), failure).await;
            }
            ProcessingOutcome::Rejected | ProcessingOutcome::Pending => {}
        }
        unit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_reads_str_and_string_payloads() {
        let literal: Box<dyn Any + Send> = Box::new("listener exploded");
        let formatted: Box<dyn Any + Send> = Box::new(format!("bad message {}", 7));
        let other: Box<dyn Any + Send> = Box::new(42_u32);

        assert_eq!(panic_message(literal.as_ref()), "listener exploded");
        assert_eq!(panic_message(formatted.as_ref()), "bad message 7");
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }
}
