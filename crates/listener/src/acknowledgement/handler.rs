//! Acknowledgement handlers, one per [`AcknowledgementMode`]

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{trace, warn};

use super::{acknowledge_all, AcknowledgementMode};
use crate::message::Message;
use crate::pipeline::ListenerExecutionFailed;

/// Decides whether a processed message is acknowledged
#[async_trait]
pub trait AcknowledgementHandler: Send + Sync {
    /// The pipeline completed successfully
    async fn on_success(&self, _messages: &[Message]) {}

    /// The pipeline completed with an error
    async fn on_error(&self, _messages: &[Message], _error: &ListenerExecutionFailed) {}
}

async fn acknowledge(messages: &[Message]) {
    if let Err(e) = acknowledge_all(messages).await {
        warn!(count = messages.len(), error = %e, "Failed to acknowledge messages");
    }
}

/// Acknowledges only successfully processed messages
#[derive(Debug, Default, Clone, Copy)]
pub struct OnSuccessAcknowledgementHandler;

#[async_trait]
impl AcknowledgementHandler for OnSuccessAcknowledgementHandler {
    async fn on_success(&self, messages: &[Message]) {
        trace!(count = messages.len(), "acknowledging processed messages");
        acknowledge(messages).await;
    }
}

/// Acknowledges messages whatever the outcome
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAcknowledgementHandler;

#[async_trait]
impl AcknowledgementHandler for AlwaysAcknowledgementHandler {
    async fn on_success(&self, messages: &[Message]) {
        acknowledge(messages).await;
    }

    async fn on_error(&self, messages: &[Message], _error: &ListenerExecutionFailed) {
        trace!(count = messages.len(), "acknowledging failed messages");
        acknowledge(messages).await;
    }
}

/// Leaves acknowledgement to the listener
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverAcknowledgementHandler;

#[async_trait]
impl AcknowledgementHandler for NeverAcknowledgementHandler {}

/// Handler for a mode
pub fn acknowledgement_handler(mode: AcknowledgementMode) -> Arc<dyn AcknowledgementHandler> {
    match mode {
        AcknowledgementMode::OnSuccess => Arc::new(OnSuccessAcknowledgementHandler),
        AcknowledgementMode::Always => Arc::new(AlwaysAcknowledgementHandler),
        AcknowledgementMode::Never => Arc::new(NeverAcknowledgementHandler),
    }
}
