//! Message sources
//!
//! A [`MessageSource`] owns the polling loop of one endpoint (a queue or a
//! stream shard). [`PollingMessageSource`] requests permits from its
//! backpressure handler, fetches at most that many messages through a
//! [`MessageFetcher`] and emits them to the sink.
//!
//! # Lifecycle
//!
//! ```text
//! Created ─▶ Started ─▶ Polling ⇄ Processing ─▶ Stopping ─▶ Stopped
//! ```

mod backoff;
mod fetcher;
mod polling;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use backoff::BackOffPolicy;
pub use fetcher::{MessageFetcher, QueueMessageFetcher, ShardMessageFetcher};
pub use polling::{PollingMessageSource, IDLE_POLL_DELAY};

/// Lifecycle state of a message source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    /// Built, not started
    Created,
    /// Polling task spawned
    Started,
    /// Waiting for permits or for the provider
    Polling,
    /// Emitting a batch to the sink
    Processing,
    /// Draining in-flight messages
    Stopping,
    /// Polling task finished
    Stopped,
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceState::Created => write!(f, "created"),
            SourceState::Started => write!(f, "started"),
            SourceState::Polling => write!(f, "polling"),
            SourceState::Processing => write!(f, "processing"),
            SourceState::Stopping => write!(f, "stopping"),
            SourceState::Stopped => write!(f, "stopped"),
        }
    }
}

/// A polled endpoint
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Endpoint this source polls
    fn endpoint(&self) -> &str;

    /// Spawn the polling task
    fn start(&self);

    /// Stop polling and wait for in-flight messages
    ///
    /// Returns whether every in-flight message finished in time.
    async fn stop(&self) -> bool;

    /// Whether the polling loop is active
    fn is_running(&self) -> bool;

    /// Current lifecycle state
    fn state(&self) -> SourceState;
}
