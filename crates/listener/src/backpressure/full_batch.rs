//! Full-batch-only backpressure
//!
//! Meant as the last handler of a composite: the chain either agrees on a
//! complete batch or grants nothing.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{BackPressureError, BackPressureHandler, BatchAwareBackPressureHandler, ReleaseReason};

/// Grants permits only when a complete batch is requested
pub struct FullBatchBackPressureHandler {
    batch_size: usize,
}

impl FullBatchBackPressureHandler {
    /// Create a handler for the given batch size
    pub fn new(batch_size: usize) -> Result<Self, BackPressureError> {
        if batch_size == 0 {
            return Err(BackPressureError::InvalidConfig(
                "batch_size must be greater than zero".into(),
            ));
        }
        Ok(Self { batch_size })
    }
}

#[async_trait]
impl BackPressureHandler for FullBatchBackPressureHandler {
    async fn request(&self, amount: usize) -> usize {
        if amount == self.batch_size {
            return amount;
        }
        debug!(
            requested = amount,
            batch_size = self.batch_size,
            "Not a full batch, granting no permits"
        );
        0
    }

    fn release(&self, _amount: usize, _reason: ReleaseReason) {}

    async fn drain(&self, _timeout: Duration) -> bool {
        true
    }
}

#[async_trait]
impl BatchAwareBackPressureHandler for FullBatchBackPressureHandler {
    fn batch_size(&self) -> usize {
        self.batch_size
    }
}
