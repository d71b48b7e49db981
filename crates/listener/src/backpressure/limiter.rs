//! Externally limited backpressure
//!
//! The permit ceiling follows a user-provided [`BackPressureLimiter`], e.g. the
//! health of a downstream system. The ceiling is re-read on every request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{
    remaining, BackPressureError, BackPressureHandler, BatchAwareBackPressureHandler,
    ReleaseReason,
};

/// Source of an external capacity ceiling
///
/// A limit of 0 puts the handler in standby.
pub trait BackPressureLimiter: Send + Sync {
    /// Current maximum number of messages in flight
    fn limit(&self) -> usize;
}

impl<F> BackPressureLimiter for F
where
    F: Fn() -> usize + Send + Sync,
{
    fn limit(&self) -> usize {
        self()
    }
}

#[derive(Debug)]
struct LimitState {
    limit: usize,
    in_flight: usize,
}

impl LimitState {
    fn available(&self) -> usize {
        self.limit.saturating_sub(self.in_flight)
    }
}

/// Backpressure handler whose capacity follows a [`BackPressureLimiter`]
pub struct LimitedBackPressureHandler {
    limiter: Arc<dyn BackPressureLimiter>,
    batch_size: usize,
    total_permits: usize,
    acquire_timeout: Duration,
    standby_polling_interval: Duration,
    state: Mutex<LimitState>,
    released: Notify,
    draining: AtomicBool,
    interrupt: CancellationToken,
}

impl LimitedBackPressureHandler {
    /// Create a new limited handler
    pub fn new(
        limiter: Arc<dyn BackPressureLimiter>,
        batch_size: usize,
        total_permits: usize,
        acquire_timeout: Duration,
        standby_polling_interval: Duration,
    ) -> Result<Self, BackPressureError> {
        if batch_size == 0 || total_permits < batch_size {
            return Err(BackPressureError::InvalidConfig(format!(
                "total_permits ({}) must be at least batch_size ({}), which must be positive",
                total_permits, batch_size
            )));
        }
        Ok(Self {
            limiter,
            batch_size,
            total_permits,
            acquire_timeout,
            standby_polling_interval,
            state: Mutex::new(LimitState {
                limit: total_permits,
                in_flight: 0,
            }),
            released: Notify::new(),
            draining: AtomicBool::new(false),
            interrupt: CancellationToken::new(),
        })
    }

    /// Ceiling applied on the last request
    pub fn current_limit(&self) -> usize {
        self.state.lock().limit
    }

    /// Permits granted and not yet released
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    fn refresh_limit(&self) -> usize {
        let limit = self.limiter.limit().min(self.total_permits);
        let mut state = self.state.lock();
        if state.limit != limit {
            debug!(from = state.limit, to = limit, "Permit limit changed");
            let raised = limit > state.limit;
            state.limit = limit;
            if raised {
                self.released.notify_waiters();
            }
        }
        limit
    }

    fn try_take(&self, amount: usize) -> usize {
        let mut state = self.state.lock();
        let granted = state.available().min(amount);
        state.in_flight += granted;
        granted
    }
}

#[async_trait]
impl BackPressureHandler for LimitedBackPressureHandler {
    async fn request(&self, amount: usize) -> usize {
        if self.draining.load(Ordering::SeqCst) || amount == 0 {
            return 0;
        }

        if self.refresh_limit() == 0 {
            trace!("limiter in standby");
            tokio::select! {
                _ = self.interrupt.cancelled() => {}
                _ = tokio::time::sleep(self.standby_polling_interval) => {}
            }
            return 0;
        }

        let deadline = tokio::time::Instant::now() + self.acquire_timeout;
        loop {
            let notified = self.released.notified();
            let granted = self.try_take(amount);
            if granted > 0 {
                trace!(requested = amount, granted, "acquired limited permits");
                return granted;
            }

            let wait = remaining(deadline);
            if wait.is_zero() {
                return 0;
            }
            tokio::select! {
                _ = self.interrupt.cancelled() => return 0,
                _ = notified => {}
                _ = tokio::time::sleep(wait) => return 0,
            }
            if self.refresh_limit() == 0 {
                return 0;
            }
        }
    }

    fn release(&self, amount: usize, reason: ReleaseReason) {
        if amount == 0 {
            return;
        }
        {
            let mut state = self.state.lock();
            if amount > state.in_flight {
                warn!(
                    amount,
                    in_flight = state.in_flight,
                    %reason,
                    "Released more permits than were granted"
                );
            }
            state.in_flight = state.in_flight.saturating_sub(amount);
        }
        self.released.notify_waiters();
    }

    async fn drain(&self, timeout: Duration) -> bool {
        self.draining.store(true, Ordering::SeqCst);
        self.interrupt.cancel();

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.released.notified();
            if self.state.lock().in_flight == 0 {
                return true;
            }
            let wait = remaining(deadline);
            if wait.is_zero() {
                return false;
            }
            if tokio::time::timeout(wait, notified).await.is_err() {
                return self.state.lock().in_flight == 0;
            }
        }
    }

    fn available_permits(&self) -> Option<usize> {
        Some(self.state.lock().available())
    }
}

#[async_trait]
impl BatchAwareBackPressureHandler for LimitedBackPressureHandler {
    fn batch_size(&self) -> usize {
        self.batch_size
    }
}
