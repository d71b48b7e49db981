//! Throughput-adaptive backpressure
//!
//! Switches between a single outstanding poll (LOW) and unrestricted polling
//! (HIGH) based on what the last polls returned. Never blocks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{BackPressureError, BackPressureHandler, BatchAwareBackPressureHandler, ReleaseReason};

/// Current throughput mode
///
/// # State Machine
///
/// ```text
///          PartialFetch
///     ┌─────────────────────┐
///     │                     ▼
///  ┌──────┐             ┌──────┐
///  │ LOW  │             │ HIGH │
///  └──────┘             └──────┘
///     ▲                     │
///     └─────────────────────┘
///          NoneFetched
/// ```
///
/// `Processed` and `Limited` releases never change the mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThroughputMode {
    /// At most one outstanding poll
    Low,
    /// Polls bounded only by other handlers
    High,
}

impl std::fmt::Display for ThroughputMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThroughputMode::Low => write!(f, "low"),
            ThroughputMode::High => write!(f, "high"),
        }
    }
}

#[derive(Debug)]
struct ThroughputState {
    mode: ThroughputMode,
    /// Permits granted to the single LOW-mode poll still awaiting its outcome
    occupied: usize,
}

/// Non-blocking LOW/HIGH throughput handler
pub struct ThroughputBackPressureHandler {
    batch_size: usize,
    state: Mutex<ThroughputState>,
    drained: AtomicBool,
}

impl ThroughputBackPressureHandler {
    /// Create a handler starting in LOW mode
    pub fn new(batch_size: usize) -> Result<Self, BackPressureError> {
        if batch_size == 0 {
            return Err(BackPressureError::InvalidConfig(
                "batch_size must be greater than zero".into(),
            ));
        }
        Ok(Self {
            batch_size,
            state: Mutex::new(ThroughputState {
                mode: ThroughputMode::Low,
                occupied: 0,
            }),
            drained: AtomicBool::new(false),
        })
    }

    /// Current throughput mode
    pub fn mode(&self) -> ThroughputMode {
        self.state.lock().mode
    }

    /// Whether a LOW-mode poll is outstanding
    pub fn is_occupied(&self) -> bool {
        self.state.lock().occupied > 0
    }

    /// Whether the handler was drained
    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }

    fn transition(state: &mut ThroughputState, to: ThroughputMode) {
        if state.mode != to {
            debug!(from = %state.mode, to = %to, "Switching throughput mode");
            state.mode = to;
        }
    }
}

#[async_trait]
impl BackPressureHandler for ThroughputBackPressureHandler {
    async fn request(&self, amount: usize) -> usize {
        if self.is_drained() || amount == 0 {
            return 0;
        }
        let mut state = self.state.lock();
        match state.mode {
            ThroughputMode::High => amount,
            ThroughputMode::Low if state.occupied > 0 => {
                trace!("low throughput poll already in flight");
                0
            }
            ThroughputMode::Low => {
                state.occupied = amount;
                amount
            }
        }
    }

    fn release(&self, amount: usize, reason: ReleaseReason) {
        let mut state = self.state.lock();
        match reason {
            ReleaseReason::NoneFetched => {
                Self::transition(&mut state, ThroughputMode::Low);
                state.occupied = 0;
            }
            ReleaseReason::PartialFetch => {
                Self::transition(&mut state, ThroughputMode::High);
                state.occupied = 0;
            }
            // The poll this grant was meant for never happens.
            ReleaseReason::Limited => {
                state.occupied = state.occupied.saturating_sub(amount);
            }
            ReleaseReason::Processed => {}
        }
    }

    async fn drain(&self, _timeout: Duration) -> bool {
        self.drained.store(true, Ordering::SeqCst);
        true
    }
}

#[async_trait]
impl BatchAwareBackPressureHandler for ThroughputBackPressureHandler {
    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_starts_low_and_switches_high_on_partial_fetch() {
        let handler = ThroughputBackPressureHandler::new(10).unwrap();
        assert_eq!(handler.mode(), ThroughputMode::Low);

        assert_eq!(handler.request(10).await, 10);
        assert!(handler.is_occupied());

        handler.release(3, ReleaseReason::PartialFetch);
        assert_eq!(handler.mode(), ThroughputMode::High);
        assert!(!handler.is_occupied());
    }

    #[tokio::test]
    async fn test_low_mode_allows_single_outstanding_request() {
        let handler = ThroughputBackPressureHandler::new(10).unwrap();
        assert_eq!(handler.request(10).await, 10);
        assert_eq!(handler.request(10).await, 0);

        handler.release(10, ReleaseReason::NoneFetched);
        assert_eq!(handler.mode(), ThroughputMode::Low);
        assert_eq!(handler.request(10).await, 10);
    }

    #[tokio::test]
    async fn test_high_mode_grants_every_request() {
        let handler = ThroughputBackPressureHandler::new(10).unwrap();
        handler.request(10).await;
        handler.release(0, ReleaseReason::PartialFetch);

        assert_eq!(handler.request(10).await, 10);
        assert_eq!(handler.request(10).await, 10);
    }

    #[tokio::test]
    async fn test_none_fetched_switches_back_to_low() {
        let handler = ThroughputBackPressureHandler::new(10).unwrap();
        handler.release(0, ReleaseReason::PartialFetch);
        assert_eq!(handler.mode(), ThroughputMode::High);

        handler.release(10, ReleaseReason::NoneFetched);
        assert_eq!(handler.mode(), ThroughputMode::Low);
    }

    #[tokio::test]
    async fn test_processed_and_limited_never_change_mode() {
        let handler = ThroughputBackPressureHandler::new(10).unwrap();
        handler.release(1, ReleaseReason::Processed);
        handler.release(1, ReleaseReason::Limited);
        assert_eq!(handler.mode(), ThroughputMode::Low);

        handler.release(0, ReleaseReason::PartialFetch);
        handler.release(1, ReleaseReason::Processed);
        handler.release(1, ReleaseReason::Limited);
        assert_eq!(handler.mode(), ThroughputMode::High);
    }

    #[tokio::test]
    async fn test_limited_release_frees_low_mode_slot() {
        let handler = ThroughputBackPressureHandler::new(10).unwrap();
        assert_eq!(handler.request(10).await, 10);
        handler.release(10, ReleaseReason::Limited);
        assert!(!handler.is_occupied());
        assert_eq!(handler.request(10).await, 10);
    }

    #[tokio::test]
    async fn test_drained_handler_grants_nothing() {
        let handler = ThroughputBackPressureHandler::new(10).unwrap();
        handler.release(0, ReleaseReason::PartialFetch);
        assert!(handler.drain(Duration::from_secs(1)).await);
        assert_eq!(handler.request(10).await, 0);
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(ThroughputMode::Low.to_string(), "low");
        assert_eq!(ThroughputMode::High.to_string(), "high");
    }
}
