//! Composite backpressure
//!
//! Chains handlers so they all agree on one granted amount. Each handler is
//! asked for the minimum granted so far; whatever a handler granted above the
//! final minimum is given back with [`ReleaseReason::Limited`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{
    remaining, BackPressureError, BackPressureHandler, BatchAwareBackPressureHandler,
    ReleaseReason,
};

/// Builder for [`CompositeBackPressureHandler`]
#[derive(Default)]
pub struct CompositeBackPressureHandlerBuilder {
    handlers: Vec<Arc<dyn BackPressureHandler>>,
    batch_size: Option<usize>,
    no_permits_returned_wait_timeout: Option<Duration>,
}

impl CompositeBackPressureHandlerBuilder {
    /// Append a handler to the chain
    pub fn handler(mut self, handler: Arc<dyn BackPressureHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Set the batch size used by `request_batch`
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// How long to wait for a release when the chain grants nothing
    pub fn no_permits_returned_wait_timeout(mut self, timeout: Duration) -> Self {
        self.no_permits_returned_wait_timeout = Some(timeout);
        self
    }

    /// Build the composite, failing when required fields are missing
    pub fn build(self) -> Result<CompositeBackPressureHandler, BackPressureError> {
        if self.handlers.is_empty() {
            return Err(BackPressureError::InvalidConfig(
                "at least one backpressure handler is required".into(),
            ));
        }
        let batch_size = self.batch_size.ok_or_else(|| {
            BackPressureError::InvalidConfig("batch_size is required".into())
        })?;
        if batch_size == 0 {
            return Err(BackPressureError::InvalidConfig(
                "batch_size must be greater than zero".into(),
            ));
        }
        let wait_timeout = self.no_permits_returned_wait_timeout.ok_or_else(|| {
            BackPressureError::InvalidConfig("no_permits_returned_wait_timeout is required".into())
        })?;

        Ok(CompositeBackPressureHandler {
            handlers: self.handlers,
            batch_size,
            no_permits_returned_wait_timeout: wait_timeout,
            released: Notify::new(),
            draining: AtomicBool::new(false),
            interrupt: CancellationToken::new(),
        })
    }
}

/// Ordered chain of backpressure handlers
pub struct CompositeBackPressureHandler {
    handlers: Vec<Arc<dyn BackPressureHandler>>,
    batch_size: usize,
    no_permits_returned_wait_timeout: Duration,
    released: Notify,
    draining: AtomicBool,
    interrupt: CancellationToken,
}

impl CompositeBackPressureHandler {
    /// Start building a composite
    pub fn builder() -> CompositeBackPressureHandlerBuilder {
        CompositeBackPressureHandlerBuilder::default()
    }

    /// Number of handlers in the chain
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the chain is empty (never true for a built composite)
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    async fn request_through_chain(&self, amount: usize) -> usize {
        let mut obtained = amount;
        let mut grants = Vec::with_capacity(self.handlers.len());
        for handler in &self.handlers {
            if obtained == 0 {
                break;
            }
            let granted = handler.request(obtained).await;
            grants.push(granted);
            obtained = obtained.min(granted);
        }

        for (handler, granted) in self.handlers.iter().zip(grants) {
            if granted > obtained {
                handler.release(granted - obtained, ReleaseReason::Limited);
            }
        }
        obtained
    }
}

#[async_trait]
impl BackPressureHandler for CompositeBackPressureHandler {
    async fn request(&self, amount: usize) -> usize {
        if self.draining.load(Ordering::SeqCst) {
            return 0;
        }
        let notified = self.released.notified();
        let obtained = self.request_through_chain(amount).await;
        if obtained > 0 {
            trace!(requested = amount, obtained, "composite granted permits");
            return obtained;
        }

        trace!(
            wait_ms = self.no_permits_returned_wait_timeout.as_millis() as u64,
            "no permits granted, waiting for a release"
        );
        tokio::select! {
            _ = self.interrupt.cancelled() => {}
            _ = notified => {}
            _ = tokio::time::sleep(self.no_permits_returned_wait_timeout) => {}
        }
        0
    }

    fn release(&self, amount: usize, reason: ReleaseReason) {
        for handler in &self.handlers {
            handler.release(amount, reason);
        }
        if amount > 0 {
            self.released.notify_waiters();
        }
    }

    async fn drain(&self, timeout: Duration) -> bool {
        self.draining.store(true, Ordering::SeqCst);
        self.interrupt.cancel();

        let deadline = tokio::time::Instant::now() + timeout;
        let mut drained = true;
        for handler in &self.handlers {
            drained &= handler.drain(remaining(deadline)).await;
        }
        debug!(drained, handlers = self.handlers.len(), "Composite drain finished");
        drained
    }

    fn available_permits(&self) -> Option<usize> {
        self.handlers
            .iter()
            .filter_map(|handler| handler.available_permits())
            .min()
    }
}

#[async_trait]
impl BatchAwareBackPressureHandler for CompositeBackPressureHandler {
    fn batch_size(&self) -> usize {
        self.batch_size
    }
}
