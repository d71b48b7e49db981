//! Acknowledgement of processed messages
//!
//! This module provides:
//! - [`AcknowledgementHandler`] - decides from the pipeline outcome whether to acknowledge
//! - [`AcknowledgementProcessor`] - immediate or batched delivery of acknowledgements
//! - [`AcknowledgementExecutor`] - the provider call (queue delete, stream checkpoint)
//! - [`Acknowledgement`] - per-message handle used for explicit acknowledgement
//!
//! # Flow
//!
//! ```text
//! pipeline outcome ─▶ AcknowledgementHandler (OnSuccess / Always / Never)
//!                            │
//!                            ▼ Message::acknowledge
//!                  AcknowledgementProcessor (immediate | batching)
//!                            │  ordering: Parallel / Ordered / OrderedByGroup
//!                            ▼
//!                  AcknowledgementExecutor ─▶ delete_messages / checkpoint
//!                            │
//!                            ▼
//!                  AcknowledgementResultCallback
//! ```

mod executor;
mod handler;
mod processor;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::options::ContainerOptionsError;
use crate::provider::ProviderError;

pub use executor::{
    AcknowledgementExecutor, QueueAcknowledgementExecutor, StreamCheckpointExecutor,
};
pub use handler::{
    acknowledgement_handler, AcknowledgementHandler, AlwaysAcknowledgementHandler,
    NeverAcknowledgementHandler, OnSuccessAcknowledgementHandler,
};
pub use processor::{
    AcknowledgementProcessor, BatchingAcknowledgementProcessor, ImmediateAcknowledgementProcessor,
    DEFAULT_MAX_ACKNOWLEDGEMENTS_PER_BATCH,
};

/// When processed messages are acknowledged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcknowledgementMode {
    /// Acknowledge when the pipeline completed without error
    #[default]
    OnSuccess,
    /// Acknowledge regardless of the outcome
    Always,
    /// Never acknowledge automatically
    Never,
}

impl std::str::FromStr for AcknowledgementMode {
    type Err = ContainerOptionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "on_success" | "on-success" | "" => Ok(AcknowledgementMode::OnSuccess),
            "always" => Ok(AcknowledgementMode::Always),
            "never" | "manual" => Ok(AcknowledgementMode::Never),
            _ => Err(ContainerOptionsError::Parse {
                name: "acknowledgement_mode",
                value: s.to_string(),
            }),
        }
    }
}

/// Order in which acknowledgements reach the provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcknowledgementOrdering {
    /// Concurrent provider calls, no ordering
    #[default]
    Parallel,
    /// One call at a time per endpoint, in arrival order
    Ordered,
    /// One call at a time per message group, in arrival order
    OrderedByGroup,
}

/// Acknowledgement errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AcknowledgementError {
    /// The provider rejected the acknowledgement
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// The message carries no acknowledgement handle
    #[error("message {0} cannot be acknowledged")]
    NotAcknowledgeable(String),

    /// The processor is not accepting acknowledgements
    #[error("acknowledgement processor for {0} is not running")]
    NotRunning(String),

    /// Invalid processor configuration
    #[error("invalid acknowledgement configuration: {0}")]
    InvalidConfig(String),
}

/// Receives messages that should be acknowledged
#[async_trait]
pub trait AcknowledgementCallback: Send + Sync {
    /// Acknowledge messages of a single endpoint
    async fn on_acknowledge(&self, messages: Vec<Message>) -> Result<(), AcknowledgementError>;
}

/// Observes the result of provider acknowledgement calls
#[async_trait]
pub trait AcknowledgementResultCallback: Send + Sync {
    /// Messages were acknowledged by the provider
    async fn on_success(&self, _messages: &[Message]) {}

    /// The provider call failed; messages may be redelivered
    async fn on_failure(&self, _messages: &[Message], _error: &AcknowledgementError) {}
}

struct AcknowledgementState {
    acknowledged: AtomicBool,
    callback: Arc<dyn AcknowledgementCallback>,
}

/// Per-message acknowledgement handle
///
/// Clones of a message share the handle, so a message is acknowledged at
/// most once whichever path gets there first.
#[derive(Clone)]
pub struct Acknowledgement {
    state: Arc<AcknowledgementState>,
}

impl Acknowledgement {
    pub(crate) fn new(callback: Arc<dyn AcknowledgementCallback>) -> Self {
        Self {
            state: Arc::new(AcknowledgementState {
                acknowledged: AtomicBool::new(false),
                callback,
            }),
        }
    }

    /// Whether the message was acknowledged
    pub fn is_acknowledged(&self) -> bool {
        self.state.acknowledged.load(Ordering::SeqCst)
    }

    fn claim(&self) -> bool {
        !self.state.acknowledged.swap(true, Ordering::SeqCst)
    }

    fn unclaim(&self) {
        self.state.acknowledged.store(false, Ordering::SeqCst);
    }

    pub(crate) async fn acknowledge(&self, message: &Message) -> Result<(), AcknowledgementError> {
        if !self.claim() {
            return Ok(());
        }
        let result = self.state.callback.on_acknowledge(vec![message.clone()]).await;
        if result.is_err() {
            self.unclaim();
        }
        result
    }
}

impl fmt::Debug for Acknowledgement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acknowledgement")
            .field("acknowledged", &self.is_acknowledged())
            .finish()
    }
}

/// Acknowledge every message not acknowledged yet, one callback per endpoint
///
/// Messages without a handle are skipped.
pub async fn acknowledge_all(messages: &[Message]) -> Result<(), AcknowledgementError> {
    let mut by_endpoint: BTreeMap<&str, (Arc<dyn AcknowledgementCallback>, Vec<Message>)> =
        BTreeMap::new();
    for message in messages {
        let Some(ack) = message.acknowledgement() else {
            continue;
        };
        if !ack.claim() {
            continue;
        }
        by_endpoint
            .entry(message.endpoint.as_str())
            .or_insert_with(|| (Arc::clone(&ack.state.callback), Vec::new()))
            .1
            .push(message.clone());
    }

    let mut result = Ok(());
    for (_, (callback, claimed)) in by_endpoint {
        if let Err(e) = callback.on_acknowledge(claimed.clone()).await {
            for message in &claimed {
                if let Some(ack) = message.acknowledgement() {
                    ack.unclaim();
                }
            }
            result = Err(e);
        }
    }
    result
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// Records every acknowledged message id
    #[derive(Default)]
    pub struct RecordingCallback {
        pub acknowledged: Mutex<Vec<String>>,
        pub calls: Mutex<usize>,
        pub fail: AtomicBool,
    }

    #[async_trait]
    impl AcknowledgementCallback for RecordingCallback {
        async fn on_acknowledge(&self, messages: Vec<Message>) -> Result<(), AcknowledgementError> {
            *self.calls.lock() += 1;
            if self.fail.load(Ordering::SeqCst) {
                return Err(AcknowledgementError::Provider(ProviderError::Throttled(
                    "slow down".into(),
                )));
            }
            self.acknowledged
                .lock()
                .extend(messages.into_iter().map(|m| m.id));
            Ok(())
        }
    }
}
