//! Permit-based backpressure for polling sources
//!
//! This module provides:
//! - [`BackPressureHandler`] - request/release/drain contract shared by every variant
//! - [`ConcurrencyLimiterBackPressureHandler`] - blocking counting semaphore
//! - [`ThroughputBackPressureHandler`] - non-blocking LOW/HIGH mode switch
//! - [`FullBatchBackPressureHandler`] - only ever grants complete batches
//! - [`LimitedBackPressureHandler`] - ceiling driven by a [`BackPressureLimiter`]
//! - [`CompositeBackPressureHandler`] - chains handlers under a min-grant law
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              CompositeBackPressureHandler                    │
//! │                                                              │
//! │  request(10) ─▶ ConcurrencyLimiter ─▶ Throughput ─▶ FullBatch│
//! │                    granted 10           granted 10   granted 0│
//! │                         │                   │                │
//! │                         └── release(10, Limited) ◀───────────┘
//! │                                                              │
//! │  release(n, reason) ─▶ fan-out to every handler              │
//! │  drain(timeout)     ─▶ logical AND over every handler        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod composite;
mod concurrency;
mod factory;
mod full_batch;
mod limiter;
mod throughput;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use composite::{CompositeBackPressureHandler, CompositeBackPressureHandlerBuilder};
pub use concurrency::{ConcurrencyLimiterBackPressureHandler, ConcurrencyLimiterConfig};
pub use factory::{adaptive_back_pressure_handler, BackPressureHandlerFactory};
pub use full_batch::FullBatchBackPressureHandler;
pub use limiter::{BackPressureLimiter, LimitedBackPressureHandler};
pub use throughput::{ThroughputBackPressureHandler, ThroughputMode};

/// Why permits are handed back to a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// A delivered message finished its pipeline invocation
    Processed,
    /// A poll returned messages; the unused remainder is returned
    PartialFetch,
    /// A poll returned nothing (or failed)
    NoneFetched,
    /// Another handler in a composite granted less than this one
    Limited,
}

impl std::fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReleaseReason::Processed => write!(f, "processed"),
            ReleaseReason::PartialFetch => write!(f, "partial_fetch"),
            ReleaseReason::NoneFetched => write!(f, "none_fetched"),
            ReleaseReason::Limited => write!(f, "limited"),
        }
    }
}

/// Backpressure-related errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackPressureError {
    /// Invalid configuration
    #[error("invalid backpressure configuration: {0}")]
    InvalidConfig(String),
}

/// Permit accounting for poll operations
///
/// `request` may suspend the caller (the polling task) but always within a
/// bounded wait, returning 0 on timeout or when the handler is drained.
/// `release` is called concurrently from many completing pipeline tasks.
#[async_trait]
pub trait BackPressureHandler: Send + Sync {
    /// Request up to `amount` permits, returning how many were granted
    async fn request(&self, amount: usize) -> usize;

    /// Return permits to the handler
    fn release(&self, amount: usize, reason: ReleaseReason);

    /// Reclaim every outstanding permit within `timeout`
    ///
    /// Interrupts waiting requests. Returns whether everything was reclaimed.
    async fn drain(&self, timeout: Duration) -> bool;

    /// Permits that could be granted right now, when the handler counts them
    fn available_permits(&self) -> Option<usize> {
        None
    }
}

/// A handler with a configured batch size
#[async_trait]
pub trait BatchAwareBackPressureHandler: BackPressureHandler {
    /// Number of permits requested per poll
    fn batch_size(&self) -> usize;

    /// Request a full batch worth of permits
    async fn request_batch(&self) -> usize {
        self.request(self.batch_size()).await
    }
}

/// Remaining time until `deadline`, zero once passed
pub(crate) fn remaining(deadline: tokio::time::Instant) -> Duration {
    deadline.saturating_duration_since(tokio::time::Instant::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_reason_display() {
        assert_eq!(ReleaseReason::Processed.to_string(), "processed");
        assert_eq!(ReleaseReason::PartialFetch.to_string(), "partial_fetch");
        assert_eq!(ReleaseReason::NoneFetched.to_string(), "none_fetched");
        assert_eq!(ReleaseReason::Limited.to_string(), "limited");
    }

    #[test]
    fn test_release_reason_serialization() {
        let json = serde_json::to_string(&ReleaseReason::NoneFetched).unwrap();
        assert_eq!(json, "\"none_fetched\"");
    }
}
