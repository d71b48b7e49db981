//! Blocking concurrency limiter
//!
//! A counting semaphore of `total_permits`. Requests try the exact amount,
//! fall back to a partial grant, and otherwise wait up to `acquire_timeout`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{BackPressureError, BackPressureHandler, BatchAwareBackPressureHandler, ReleaseReason};
use crate::options::duration_millis;

/// Concurrency limiter configuration
///
/// # Example
///
/// ```
/// use message_listener::backpressure::ConcurrencyLimiterConfig;
/// use std::time::Duration;
///
/// let config = ConcurrencyLimiterConfig::default()
///     .with_total_permits(20)
///     .with_batch_size(10)
///     .with_acquire_timeout(Duration::from_secs(5));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConcurrencyLimiterConfig {
    /// Permits requested per poll
    pub batch_size: usize,

    /// Maximum permits in flight
    pub total_permits: usize,

    /// Maximum time a request waits for permits
    #[serde(with = "duration_millis")]
    pub acquire_timeout: Duration,

    /// Reject partial grants instead of returning fewer permits
    pub always_full_batch: bool,
}

impl Default for ConcurrencyLimiterConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            total_permits: 10,
            acquire_timeout: Duration::from_secs(10),
            always_full_batch: false,
        }
    }
}

impl ConcurrencyLimiterConfig {
    /// Set the batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the total number of permits
    pub fn with_total_permits(mut self, total_permits: usize) -> Self {
        self.total_permits = total_permits;
        self
    }

    /// Set the acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Only grant complete batches
    pub fn with_always_full_batch(mut self, always_full_batch: bool) -> Self {
        self.always_full_batch = always_full_batch;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), BackPressureError> {
        if self.batch_size == 0 {
            return Err(BackPressureError::InvalidConfig(
                "batch_size must be greater than zero".into(),
            ));
        }
        if self.total_permits < self.batch_size {
            return Err(BackPressureError::InvalidConfig(format!(
                "total_permits ({}) must be greater than or equal to batch_size ({})",
                self.total_permits, self.batch_size
            )));
        }
        if self.total_permits > Semaphore::MAX_PERMITS || self.total_permits > u32::MAX as usize {
            return Err(BackPressureError::InvalidConfig(
                "total_permits exceeds the semaphore capacity".into(),
            ));
        }
        Ok(())
    }
}

/// Semaphore-limited backpressure handler
pub struct ConcurrencyLimiterBackPressureHandler {
    config: ConcurrencyLimiterConfig,
    semaphore: Semaphore,
    in_flight: AtomicUsize,
    draining: AtomicBool,
    interrupt: CancellationToken,
}

impl ConcurrencyLimiterBackPressureHandler {
    /// Create a new handler, validating the configuration
    pub fn new(config: ConcurrencyLimiterConfig) -> Result<Self, BackPressureError> {
        config.validate()?;
        Ok(Self {
            semaphore: Semaphore::new(config.total_permits),
            config,
            in_flight: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            interrupt: CancellationToken::new(),
        })
    }

    /// Handler configuration
    pub fn config(&self) -> &ConcurrencyLimiterConfig {
        &self.config
    }

    /// Total permits managed by this handler
    pub fn total_permits(&self) -> usize {
        self.config.total_permits
    }

    /// Permits currently available for acquisition
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Permits granted and not yet released
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Whether the handler has started draining
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    fn try_take(&self, amount: usize) -> bool {
        if amount == 0 {
            return false;
        }
        match self.semaphore.try_acquire_many(amount as u32) {
            Ok(permit) => {
                permit.forget();
                self.in_flight.fetch_add(amount, Ordering::SeqCst);
                true
            }
            Err(_) => false,
        }
    }

    async fn wait_for(&self, amount: usize) -> bool {
        let acquire = tokio::time::timeout(
            self.config.acquire_timeout,
            self.semaphore.acquire_many(amount as u32),
        );
        tokio::select! {
            biased;
            _ = self.interrupt.cancelled() => {
                trace!("permit request interrupted");
                false
            }
            result = acquire => match result {
                Ok(Ok(permit)) => {
                    permit.forget();
                    self.in_flight.fetch_add(amount, Ordering::SeqCst);
                    true
                }
                Ok(Err(_)) => false,
                Err(_) => {
                    trace!(amount, "permit request timed out");
                    false
                }
            }
        }
    }
}

#[async_trait]
impl BackPressureHandler for ConcurrencyLimiterBackPressureHandler {
    async fn request(&self, amount: usize) -> usize {
        if self.is_draining() {
            return 0;
        }
        let amount = amount.min(self.config.total_permits);
        if amount == 0 {
            return 0;
        }

        if self.try_take(amount) {
            trace!(amount, "acquired requested permits");
            return amount;
        }

        if !self.config.always_full_batch {
            let available = self.semaphore.available_permits().min(amount);
            if self.try_take(available) {
                trace!(requested = amount, granted = available, "acquired partial permits");
                return available;
            }
        }

        let wanted = if self.config.always_full_batch { amount } else { 1 };
        if !self.wait_for(wanted).await {
            return 0;
        }

        let mut granted = wanted;
        if granted < amount {
            let extra = self.semaphore.available_permits().min(amount - granted);
            if self.try_take(extra) {
                granted += extra;
            }
        }
        trace!(requested = amount, granted, "acquired permits after waiting");
        granted
    }

    fn release(&self, amount: usize, reason: ReleaseReason) {
        if amount == 0 {
            return;
        }
        let previous = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(amount))
            })
            .unwrap_or(0);
        let released = amount.min(previous);
        if released < amount {
            warn!(
                amount,
                in_flight = previous,
                %reason,
                "Released more permits than were granted"
            );
        }
        self.semaphore.add_permits(released);
        trace!(released, %reason, available = self.available_permits(), "released permits");
    }

    async fn drain(&self, timeout: Duration) -> bool {
        self.draining.store(true, Ordering::SeqCst);
        self.interrupt.cancel();
        debug!(
            in_flight = self.in_flight(),
            timeout_ms = timeout.as_millis() as u64,
            "Draining concurrency limiter"
        );

        let total = self.config.total_permits as u32;
        match tokio::time::timeout(timeout, self.semaphore.acquire_many(total)).await {
            // Permits go straight back so accessors reflect the idle state.
            Ok(Ok(_permit)) => true,
            _ => false,
        }
    }

    fn available_permits(&self) -> Option<usize> {
        Some(self.semaphore.available_permits())
    }
}

#[async_trait]
impl BatchAwareBackPressureHandler for ConcurrencyLimiterBackPressureHandler {
    fn batch_size(&self) -> usize {
        self.config.batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn handler(total: usize, batch: usize) -> ConcurrencyLimiterBackPressureHandler {
        ConcurrencyLimiterBackPressureHandler::new(
            ConcurrencyLimiterConfig::default()
                .with_total_permits(total)
                .with_batch_size(batch)
                .with_acquire_timeout(Duration::from_millis(50)),
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_total_below_batch() {
        let result = ConcurrencyLimiterBackPressureHandler::new(
            ConcurrencyLimiterConfig::default()
                .with_total_permits(5)
                .with_batch_size(10),
        );
        assert!(matches!(result, Err(BackPressureError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_full_grant_when_available() {
        let handler = handler(10, 10);
        assert_eq!(handler.request_batch().await, 10);
        assert_eq!(handler.available_permits(), 0);
        assert_eq!(handler.in_flight(), 10);
    }

    #[tokio::test]
    async fn test_partial_grant_falls_back_to_available() {
        let handler = handler(10, 10);
        assert_eq!(handler.request(6).await, 6);
        assert_eq!(handler.request(10).await, 4);
        assert_eq!(handler.available_permits(), 0);
    }

    #[tokio::test]
    async fn test_always_full_batch_rejects_partial() {
        let handler = ConcurrencyLimiterBackPressureHandler::new(
            ConcurrencyLimiterConfig::default()
                .with_total_permits(10)
                .with_batch_size(5)
                .with_always_full_batch(true)
                .with_acquire_timeout(Duration::from_millis(20)),
        )
        .unwrap();
        assert_eq!(handler.request(7).await, 7);
        assert_eq!(handler.request(5).await, 0);
        assert_eq!(handler.in_flight(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_with_zero() {
        let handler = handler(10, 10);
        assert_eq!(handler.request(10).await, 10);
        assert_eq!(handler.request(10).await, 0);
    }

    #[tokio::test]
    async fn test_waiting_request_wakes_on_release() {
        let handler = Arc::new(
            ConcurrencyLimiterBackPressureHandler::new(
                ConcurrencyLimiterConfig::default()
                    .with_total_permits(4)
                    .with_batch_size(4)
                    .with_acquire_timeout(Duration::from_secs(5)),
            )
            .unwrap(),
        );
        assert_eq!(handler.request(4).await, 4);

        let waiter = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.request(4).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        handler.release(3, ReleaseReason::Processed);

        assert_eq!(waiter.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_over_release_is_clamped() {
        let handler = handler(10, 10);
        assert_eq!(handler.request(3).await, 3);
        handler.release(5, ReleaseReason::Processed);
        assert_eq!(handler.available_permits(), 10);
        assert_eq!(handler.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_drain_interrupts_waiting_request() {
        let handler = Arc::new(
            ConcurrencyLimiterBackPressureHandler::new(
                ConcurrencyLimiterConfig::default()
                    .with_total_permits(2)
                    .with_batch_size(2)
                    .with_acquire_timeout(Duration::from_secs(60)),
            )
            .unwrap(),
        );
        assert_eq!(handler.request(2).await, 2);

        let waiter = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.request(2).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let drain = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.drain(Duration::from_secs(1)).await })
        };
        assert_eq!(waiter.await.unwrap(), 0);

        handler.release(2, ReleaseReason::Processed);
        assert!(drain.await.unwrap());
        assert_eq!(handler.request(1).await, 0);
    }

    #[tokio::test]
    async fn test_drain_fails_with_outstanding_permits() {
        let handler = handler(10, 10);
        assert_eq!(handler.request(1).await, 1);
        assert!(!handler.drain(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_random_request_release_conserves_permits() {
        use rand::Rng;

        let handler = handler(10, 5);
        let mut outstanding: Vec<usize> = Vec::new();
        let mut rng = rand::thread_rng();

        for _ in 0..500 {
            if rng.gen_bool(0.5) || outstanding.is_empty() {
                let amount = rng.gen_range(1..=5);
                let available = handler.available_permits();
                if available == 0 {
                    continue;
                }
                let granted = handler.request(amount).await;
                assert!(granted <= amount);
                if granted > 0 {
                    outstanding.push(granted);
                }
            } else {
                let index = rng.gen_range(0..outstanding.len());
                let granted = outstanding.swap_remove(index);
                handler.release(granted, ReleaseReason::Processed);
            }

            let held: usize = outstanding.iter().sum();
            assert!(held <= 10);
            assert_eq!(handler.in_flight(), held);
            assert_eq!(handler.available_permits(), 10 - held);
        }

        for granted in outstanding.drain(..) {
            handler.release(granted, ReleaseReason::Processed);
        }
        assert_eq!(handler.available_permits(), 10);
    }
}
