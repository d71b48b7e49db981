//! Error handlers
//!
//! An [`ErrorHandler`] sees every failed invocation. Returning `Ok` recovers
//! the failure, so the acknowledgement stage treats the messages as processed.
//! The backoff handlers push the failed messages' visibility out and keep the
//! failure, leaving the messages for redelivery.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::ListenerExecutionFailed;
use crate::message::{Message, Visibility};

/// Maximum visibility timeout accepted by queue services (12 hours)
pub const MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(43_200);

/// Handles listener failures
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    /// Handle a failure; `Ok` marks the messages as recovered
    async fn handle(&self, failure: ListenerExecutionFailed) -> Result<(), ListenerExecutionFailed>;
}

/// Logs the failure and keeps it
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingErrorHandler;

#[async_trait]
impl ErrorHandler for LoggingErrorHandler {
    async fn handle(
        &self,
        failure: ListenerExecutionFailed,
    ) -> Result<(), ListenerExecutionFailed> {
        let ids: Vec<&str> = failure.messages().iter().map(|m| m.id.as_str()).collect();
        error!(message_ids = ?ids, error = %failure.cause(), "Listener failed");
        Err(failure)
    }
}

/// Randomization applied to backoff visibility timeouts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffJitter {
    /// Exact timeout
    #[default]
    None,
    /// Uniform in `[0, timeout]`
    Full,
    /// Uniform in `[timeout / 2, timeout]`
    Half,
}

impl BackoffJitter {
    fn apply(self, seconds: u64) -> u64 {
        match self {
            BackoffJitter::None => seconds,
            BackoffJitter::Full => rand::thread_rng().gen_range(0..=seconds),
            BackoffJitter::Half => {
                let half = seconds / 2;
                half + rand::thread_rng().gen_range(0..=half)
            }
        }
    }
}

/// Change visibility per distinct timeout, one provider call per timeout and queue
async fn apply_visibility<F>(failure: &ListenerExecutionFailed, timeout_for: F)
where
    F: Fn(&Message) -> Duration,
{
    let mut by_timeout: BTreeMap<Duration, Vec<Message>> = BTreeMap::new();
    for message in failure.messages() {
        if message.visibility().is_none() {
            continue;
        }
        by_timeout
            .entry(timeout_for(message))
            .or_default()
            .push(message.clone());
    }

    for (timeout, messages) in by_timeout {
        match Visibility::change_batch(&messages, timeout).await {
            Ok(()) => debug!(
                count = messages.len(),
                timeout_secs = timeout.as_secs(),
                "Changed visibility of failed messages"
            ),
            Err(e) => error!(
                count = messages.len(),
                timeout_secs = timeout.as_secs(),
                error = %e,
                "Failed to change visibility of failed messages"
            ),
        }
    }
}

/// Exponential visibility backoff based on the receive count
///
/// `timeout = initial × multiplier^(receive_count − 1)`, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffErrorHandler {
    initial: Duration,
    multiplier: f64,
    max: Duration,
    jitter: BackoffJitter,
}

impl Default for ExponentialBackoffErrorHandler {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(100),
            multiplier: 2.0,
            max: MAX_VISIBILITY_TIMEOUT,
            jitter: BackoffJitter::None,
        }
    }
}

impl ExponentialBackoffErrorHandler {
    /// Handler with 100s initial timeout, multiplier 2 and the 12h cap
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timeout of the first redelivery
    pub fn with_initial_visibility_timeout(mut self, initial: Duration) -> Self {
        self.initial = initial;
        self
    }

    /// Set the growth factor
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Set the cap, never above [`MAX_VISIBILITY_TIMEOUT`]
    pub fn with_max_visibility_timeout(mut self, max: Duration) -> Self {
        self.max = max.min(MAX_VISIBILITY_TIMEOUT);
        self
    }

    /// Set the jitter
    pub fn with_jitter(mut self, jitter: BackoffJitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Timeout before jitter for a receive count
    pub fn visibility_timeout(&self, receive_count: u32) -> Duration {
        let exponent = receive_count.saturating_sub(1).min(64) as i32;
        let seconds = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max.as_secs_f64();
        Duration::from_secs(seconds.min(max) as u64)
    }
}

#[async_trait]
impl ErrorHandler for ExponentialBackoffErrorHandler {
    async fn handle(
        &self,
        failure: ListenerExecutionFailed,
    ) -> Result<(), ListenerExecutionFailed> {
        apply_visibility(&failure, |message| {
            let base = self.visibility_timeout(message.receive_count);
            Duration::from_secs(self.jitter.apply(base.as_secs()))
        })
        .await;
        Err(failure)
    }
}

/// Linear visibility backoff based on the receive count
///
/// `timeout = initial + increment × (receive_count − 1)`, capped at `max`.
#[derive(Debug, Clone)]
pub struct LinearBackoffErrorHandler {
    initial: Duration,
    increment: Duration,
    max: Duration,
}

impl Default for LinearBackoffErrorHandler {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(100),
            increment: Duration::from_secs(2),
            max: MAX_VISIBILITY_TIMEOUT,
        }
    }
}

impl LinearBackoffErrorHandler {
    /// Handler with 100s initial timeout, 2s increment and the 12h cap
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_visibility_timeout(mut self, initial: Duration) -> Self {
        self.initial = initial;
        self
    }

    pub fn with_increment(mut self, increment: Duration) -> Self {
        self.increment = increment;
        self
    }

    pub fn with_max_visibility_timeout(mut self, max: Duration) -> Self {
        self.max = max.min(MAX_VISIBILITY_TIMEOUT);
        self
    }

    /// Timeout for a receive count
    pub fn visibility_timeout(&self, receive_count: u32) -> Duration {
        let steps = receive_count.saturating_sub(1);
        self.initial
            .saturating_add(self.increment.saturating_mul(steps))
            .min(self.max)
    }
}

#[async_trait]
impl ErrorHandler for LinearBackoffErrorHandler {
    async fn handle(
        &self,
        failure: ListenerExecutionFailed,
    ) -> Result<(), ListenerExecutionFailed> {
        apply_visibility(&failure, |message| self.visibility_timeout(message.receive_count)).await;
        Err(failure)
    }
}
