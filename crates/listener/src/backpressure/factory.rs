//! Assembly of the default backpressure chain from container options

use std::sync::Arc;

use tracing::debug;

use super::{
    BackPressureError, BatchAwareBackPressureHandler, CompositeBackPressureHandler,
    ConcurrencyLimiterBackPressureHandler, ConcurrencyLimiterConfig, FullBatchBackPressureHandler,
    LimitedBackPressureHandler, ThroughputBackPressureHandler,
};
use crate::options::{BackPressureMode, ContainerOptions};

/// Creates the backpressure handler of one message source
///
/// Called once per endpoint, every source gets its own handler.
pub trait BackPressureHandlerFactory: Send + Sync {
    /// Create a handler for the given options
    fn create(
        &self,
        options: &ContainerOptions,
    ) -> Result<Arc<dyn BatchAwareBackPressureHandler>, BackPressureError>;
}

impl<F> BackPressureHandlerFactory for F
where
    F: Fn(&ContainerOptions) -> Result<Arc<dyn BatchAwareBackPressureHandler>, BackPressureError>
        + Send
        + Sync,
{
    fn create(
        &self,
        options: &ContainerOptions,
    ) -> Result<Arc<dyn BatchAwareBackPressureHandler>, BackPressureError> {
        self(options)
    }
}

/// Default chain for the configured [`BackPressureMode`]
///
/// - `FixedHighThroughput`: the concurrency limiter alone
/// - `Auto`: limiter, optional external limit, throughput switch
/// - `AlwaysPollMaxMessages`: same as `Auto` with full batches only
pub fn adaptive_back_pressure_handler(
    options: &ContainerOptions,
) -> Result<Arc<dyn BatchAwareBackPressureHandler>, BackPressureError> {
    let batch_size = options.max_messages_per_poll;
    let total_permits = options.max_concurrent_messages;
    let always_full_batch = options.back_pressure_mode == BackPressureMode::AlwaysPollMaxMessages;

    let limiter = Arc::new(ConcurrencyLimiterBackPressureHandler::new(
        ConcurrencyLimiterConfig::default()
            .with_batch_size(batch_size)
            .with_total_permits(total_permits)
            .with_acquire_timeout(options.max_delay_between_polls)
            .with_always_full_batch(always_full_batch),
    )?);

    if options.back_pressure_mode == BackPressureMode::FixedHighThroughput
        && options.back_pressure_limiter.is_none()
    {
        debug!(batch_size, total_permits, "Using fixed high throughput backpressure");
        return Ok(limiter);
    }

    let mut builder = CompositeBackPressureHandler::builder()
        .batch_size(batch_size)
        .no_permits_returned_wait_timeout(options.max_delay_between_polls)
        .handler(limiter);

    if let Some(external) = &options.back_pressure_limiter {
        builder = builder.handler(Arc::new(LimitedBackPressureHandler::new(
            Arc::clone(external),
            batch_size,
            total_permits,
            options.max_delay_between_polls,
            options.standby_limit_polling_interval,
        )?));
    }

    if options.back_pressure_mode != BackPressureMode::FixedHighThroughput {
        builder = builder.handler(Arc::new(ThroughputBackPressureHandler::new(batch_size)?));
    }

    if always_full_batch {
        builder = builder.handler(Arc::new(FullBatchBackPressureHandler::new(batch_size)?));
    }

    let composite = builder.build()?;
    debug!(
        mode = ?options.back_pressure_mode,
        handlers = composite.len(),
        batch_size,
        total_permits,
        "Assembled backpressure chain"
    );
    Ok(Arc::new(composite))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::{BackPressureHandler, ReleaseReason};
    use std::time::Duration;

    fn options(mode: BackPressureMode) -> ContainerOptions {
        ContainerOptions::builder()
            .back_pressure_mode(mode)
            .max_delay_between_polls(Duration::from_millis(50))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_fixed_high_throughput_grants_parallel_batches() {
        let options = ContainerOptions::builder()
            .back_pressure_mode(BackPressureMode::FixedHighThroughput)
            .max_concurrent_messages(20)
            .max_messages_per_poll(10)
            .build()
            .unwrap();
        let handler = adaptive_back_pressure_handler(&options).unwrap();

        assert_eq!(handler.request_batch().await, 10);
        assert_eq!(handler.request_batch().await, 10);
        assert_eq!(handler.available_permits(), Some(0));
    }

    #[tokio::test]
    async fn test_auto_starts_in_low_throughput() {
        let options = ContainerOptions::builder()
            .max_concurrent_messages(20)
            .max_messages_per_poll(10)
            .max_delay_between_polls(Duration::from_millis(20))
            .build()
            .unwrap();
        let handler = adaptive_back_pressure_handler(&options).unwrap();

        assert_eq!(handler.request_batch().await, 10);
        // Low throughput allows a single poll in flight.
        assert_eq!(handler.request_batch().await, 0);
        assert_eq!(handler.available_permits(), Some(10));

        handler.release(3, ReleaseReason::PartialFetch);
        assert_eq!(handler.available_permits(), Some(13));
        assert_eq!(handler.request_batch().await, 10);
    }

    #[tokio::test]
    async fn test_always_poll_max_messages_waits_for_full_batch() {
        let handler = adaptive_back_pressure_handler(&options(
            BackPressureMode::AlwaysPollMaxMessages,
        ))
        .unwrap();

        assert_eq!(handler.request_batch().await, 10);
        handler.release(7, ReleaseReason::PartialFetch);
        // Only 7 permits are back, not a full batch.
        assert_eq!(handler.request_batch().await, 0);
        assert_eq!(handler.available_permits(), Some(7));

        handler.release(3, ReleaseReason::Processed);
        assert_eq!(handler.request_batch().await, 10);
    }

    #[tokio::test]
    async fn test_external_limiter_caps_grants() {
        let options = ContainerOptions::builder()
            .back_pressure_mode(BackPressureMode::FixedHighThroughput)
            .back_pressure_limiter(Arc::new(|| 4usize))
            .max_delay_between_polls(Duration::from_millis(20))
            .build()
            .unwrap();
        let handler = adaptive_back_pressure_handler(&options).unwrap();

        assert_eq!(handler.request_batch().await, 4);
        assert_eq!(handler.available_permits(), Some(0));
        handler.release(4, ReleaseReason::Processed);
        assert_eq!(handler.available_permits(), Some(4));
    }

    #[test]
    fn test_closure_factory() {
        let factory = |options: &ContainerOptions| -> Result<
            Arc<dyn BatchAwareBackPressureHandler>,
            BackPressureError,
        > {
            Ok(Arc::new(FullBatchBackPressureHandler::new(
                options.max_messages_per_poll,
            )?))
        };
        let handler = factory.create(&ContainerOptions::default()).unwrap();
        assert_eq!(handler.batch_size(), 10);
    }
}
