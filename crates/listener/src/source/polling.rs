use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, trace, warn};

use super::{BackOffPolicy, MessageFetcher, MessageSource, SourceState};
use crate::backpressure::{BatchAwareBackPressureHandler, ReleaseReason};
use crate::message::Message;
use crate::options::ContainerOptions;
use crate::pipeline::ProcessingContext;
use crate::sink::MessageSink;

/// Pause before requesting permits again after a zero grant
pub const IDLE_POLL_DELAY: Duration = Duration::from_millis(10);

struct SourceInner {
    endpoint: String,
    fetcher: Arc<dyn MessageFetcher>,
    handler: Arc<dyn BatchAwareBackPressureHandler>,
    sink: Arc<dyn MessageSink>,
    poll_timeout: Duration,
    back_off: BackOffPolicy,
    running: AtomicBool,
    state: RwLock<SourceState>,
    consecutive_failures: AtomicU32,
    /// Fetches started by the poll loop, one per granted batch
    fetches: TaskTracker,
    /// Cancelled only when in-flight fetches outlive the shutdown timeout
    abort_fetches: CancellationToken,
}

impl SourceInner {
    /// Move to `state`; a stopping source only moves on to `Stopped`
    fn set_state(&self, state: SourceState) {
        let mut current = self.state.write();
        let settled = match *current {
            SourceState::Stopped => true,
            SourceState::Stopping => state != SourceState::Stopped,
            _ => false,
        };
        if *current != state && !settled {
            trace!(endpoint = %self.endpoint, from = %*current, to = %state, "source state");
            *current = state;
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Receive up to `permits` messages and hand them to the sink
    ///
    /// Runs to completion even while the source is stopping.
    async fn poll_and_emit(&self, permits: usize) {
        trace!(endpoint = %self.endpoint, permits, "polling");
        let fetched = tokio::select! {
            _ = self.abort_fetches.cancelled() => {
                debug!(endpoint = %self.endpoint, permits, "Fetch aborted");
                self.handler.release(permits, ReleaseReason::NoneFetched);
                return;
            }
            result = self.fetcher.fetch(permits, self.poll_timeout) => result,
        };

        match fetched {
            Ok(messages) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.process(permits, messages);
            }
            Err(e) if e.is_fatal() => {
                error!(
                    endpoint = %self.endpoint,
                    error = %e,
                    "Endpoint unavailable, stopping source"
                );
                self.handler.release(permits, ReleaseReason::NoneFetched);
                self.running.store(false, Ordering::SeqCst);
                self.set_state(SourceState::Stopped);
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                error!(endpoint = %self.endpoint, failures, error = %e, "Failed to poll messages");
                self.handler.release(permits, ReleaseReason::NoneFetched);
            }
        }
    }

    /// Hand a fetched batch to the sink and settle unused permits
    fn process(&self, permits: usize, mut messages: Vec<Message>) {
        if messages.len() > permits {
            warn!(
                endpoint = %self.endpoint,
                permits,
                fetched = messages.len(),
                "Provider returned more messages than requested, dropping the excess"
            );
            messages.truncate(permits);
        }

        if messages.is_empty() {
            trace!(endpoint = %self.endpoint, permits, "no messages fetched");
            self.handler.release(permits, ReleaseReason::NoneFetched);
            return;
        }

        // A full fetch releases zero permits so throughput still switches to high.
        self.handler
            .release(permits - messages.len(), ReleaseReason::PartialFetch);

        self.set_state(SourceState::Processing);
        debug!(endpoint = %self.endpoint, count = messages.len(), permits, "Emitting messages");
        let handler = Arc::clone(&self.handler);
        let context = ProcessingContext::new()
            .with_back_pressure_release(move |n| handler.release(n, ReleaseReason::Processed));
        drop(self.sink.emit(messages, context));
    }
}

/// Polls one endpoint under backpressure
///
/// Every granted batch is fetched on its own task, so the number of
/// receives in flight is bounded by the backpressure handler alone.
pub struct PollingMessageSource {
    inner: Arc<SourceInner>,
    listener_shutdown_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PollingMessageSource {
    /// Create a source; nothing runs until [`MessageSource::start`]
    pub fn new(
        fetcher: Arc<dyn MessageFetcher>,
        handler: Arc<dyn BatchAwareBackPressureHandler>,
        sink: Arc<dyn MessageSink>,
        options: &ContainerOptions,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SourceInner {
                endpoint: fetcher.endpoint().to_string(),
                fetcher,
                handler,
                sink,
                poll_timeout: options.poll_timeout,
                back_off: options.poll_back_off.clone(),
                running: AtomicBool::new(false),
                state: RwLock::new(SourceState::Created),
                consecutive_failures: AtomicU32::new(0),
                fetches: TaskTracker::new(),
                abort_fetches: CancellationToken::new(),
            }),
            listener_shutdown_timeout: options.listener_shutdown_timeout,
            shutdown_tx,
            poll_handle: Mutex::new(None),
        }
    }

    /// Provider errors since the last successful fetch
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Fetches currently waiting on the provider
    pub fn in_flight_fetches(&self) -> usize {
        self.inner.fetches.len()
    }

    /// Backpressure handler of this source
    pub fn back_pressure_handler(&self) -> &Arc<dyn BatchAwareBackPressureHandler> {
        &self.inner.handler
    }
}

async fn poll_loop(inner: Arc<SourceInner>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if !inner.is_running() {
            break;
        }

        let failures = inner.consecutive_failures.load(Ordering::SeqCst);
        if failures > 0 {
            let delay = inner.back_off.delay_for_attempt(failures);
            trace!(
                endpoint = %inner.endpoint,
                failures,
                delay_ms = delay.as_millis() as u64,
                "backing off"
            );
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        inner.set_state(SourceState::Polling);
        // Draining the handler interrupts this wait.
        let permits = inner.handler.request_batch().await;
        if permits == 0 {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(IDLE_POLL_DELAY) => {}
            }
            continue;
        }

        if !inner.is_running() {
            inner.handler.release(permits, ReleaseReason::NoneFetched);
            break;
        }

        let task = Arc::clone(&inner);
        inner
            .fetches
            .spawn(async move { task.poll_and_emit(permits).await });
    }
    debug!(endpoint = %inner.endpoint, "Poll loop exited");
}

#[async_trait]
impl MessageSource for PollingMessageSource {
    fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    fn start(&self) {
        if *self.inner.state.read() != SourceState::Created {
            warn!(endpoint = %self.inner.endpoint, state = %self.state(), "Source already started");
            return;
        }
        self.inner.running.store(true, Ordering::SeqCst);
        self.inner.set_state(SourceState::Started);

        let handle = tokio::spawn(poll_loop(
            Arc::clone(&self.inner),
            self.shutdown_tx.subscribe(),
        ));
        *self.poll_handle.lock() = Some(handle);
        info!(endpoint = %self.inner.endpoint, "Message source started");
    }

    #[instrument(skip(self), fields(endpoint = %self.inner.endpoint))]
    async fn stop(&self) -> bool {
        let handle = self.poll_handle.lock().take();
        let Some(mut handle) = handle else {
            return true;
        };

        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.set_state(SourceState::Stopping);
        let _ = self.shutdown_tx.send(true);
        self.inner.fetches.close();

        if self.listener_shutdown_timeout.is_zero() {
            handle.abort();
            self.inner.set_state(SourceState::Stopped);
            info!("Message source stopped without waiting");
            return true;
        }

        // In-flight fetches complete or time out on their own; their
        // messages are processed before the drain succeeds.
        let deadline = tokio::time::Instant::now() + self.listener_shutdown_timeout;
        let drained = self
            .inner
            .handler
            .drain(self.listener_shutdown_timeout)
            .await;
        let exited = drained
            && tokio::time::timeout_at(deadline, &mut handle).await.is_ok()
            && tokio::time::timeout_at(deadline, self.inner.fetches.wait())
                .await
                .is_ok();
        if !exited {
            warn!(
                timeout_ms = self.listener_shutdown_timeout.as_millis() as u64,
                in_flight_fetches = self.inner.fetches.len(),
                "Messages did not finish before the shutdown timeout"
            );
            self.inner.abort_fetches.cancel();
            handle.abort();
        }

        self.inner.set_state(SourceState::Stopped);
        info!(drained = exited, "Message source stopped");
        exited
    }

    fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    fn state(&self) -> SourceState {
        *self.inner.state.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acknowledgement::test_support::RecordingCallback;
    use crate::backpressure::adaptive_back_pressure_handler;
    use crate::executor::TaskExecutor;
    use crate::options::BackPressureMode;
    use crate::provider::{InMemoryQueueClient, ProviderError};
    use crate::sink::test_support::recording_pipeline;
    use crate::sink::FanOutMessageSink;
    use crate::source::QueueMessageFetcher;
    use std::sync::atomic::AtomicUsize;

    /// Fetcher that holds every receive for `delay` and counts overlapping calls
    struct SlowFetcher {
        delay: Duration,
        batch: Option<usize>,
        next_id: AtomicUsize,
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        completed: AtomicUsize,
    }

    impl SlowFetcher {
        /// Returns `batch` messages per receive, or as many as requested when `None`
        fn new(delay: Duration, batch: Option<usize>) -> Self {
            Self {
                delay,
                batch,
                next_id: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MessageFetcher for SlowFetcher {
        fn endpoint(&self) -> &str {
            "slow"
        }

        async fn fetch(
            &self,
            max: usize,
            _wait: Duration,
        ) -> Result<Vec<Message>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);

            let count = self.batch.unwrap_or(max).min(max);
            Ok((0..count)
                .map(|_| {
                    let id = format!("m{}", self.next_id.fetch_add(1, Ordering::SeqCst));
                    Message::new(id.clone(), "slow", id)
                })
                .collect())
        }
    }

    fn slow_source(
        fetcher: Arc<SlowFetcher>,
        options: &ContainerOptions,
    ) -> (PollingMessageSource, Arc<Mutex<Vec<String>>>) {
        let processed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::new(FanOutMessageSink::new(
            recording_pipeline(Arc::clone(&processed), Duration::ZERO),
            TaskExecutor::new("test", options.max_concurrent_messages).unwrap(),
        ));
        sink.start();
        let handler = adaptive_back_pressure_handler(options).unwrap();
        let source = PollingMessageSource::new(fetcher, handler, sink, options);
        (source, processed)
    }

    struct Fixture {
        client: Arc<InMemoryQueueClient>,
        processed: Arc<Mutex<Vec<String>>>,
        source: PollingMessageSource,
    }

    fn fixture(options: ContainerOptions, delay: Duration) -> Fixture {
        let client = Arc::new(InMemoryQueueClient::new());
        client.create_queue("q");
        let processed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::new(FanOutMessageSink::new(
            recording_pipeline(Arc::clone(&processed), delay),
            TaskExecutor::new("test", 10).unwrap(),
        ));
        sink.start();
        let fetcher = Arc::new(QueueMessageFetcher::new(
            client.clone(),
            "q",
            Arc::new(RecordingCallback::default()),
        ));
        let handler = adaptive_back_pressure_handler(&options).unwrap();
        let source = PollingMessageSource::new(fetcher, handler, sink, &options);
        Fixture {
            client,
            processed,
            source,
        }
    }

    fn fast_options() -> ContainerOptions {
        ContainerOptions::builder()
            .poll_timeout(Duration::from_millis(20))
            .max_delay_between_polls(Duration::from_millis(20))
            .listener_shutdown_timeout(Duration::from_secs(2))
            .poll_back_off(BackOffPolicy::fixed(Duration::from_millis(10)))
            .build()
            .unwrap()
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_polls_and_processes_messages() {
        let f = fixture(fast_options(), Duration::ZERO);
        for i in 0..5 {
            f.client.send_message("q", format!("m{}", i));
        }

        f.source.start();
        assert!(f.source.is_running());
        wait_for(|| f.processed.lock().len() == 5).await;

        assert!(f.source.stop().await);
        assert_eq!(f.source.state(), SourceState::Stopped);
        assert_eq!(f.source.back_pressure_handler().available_permits(), Some(10));
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_messages() {
        let f = fixture(fast_options(), Duration::from_millis(200));
        f.client.send_message("q", "slow");

        f.source.start();
        wait_for(|| f.client.in_flight_count("q") == 1).await;

        assert!(f.source.stop().await);
        assert_eq!(f.processed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_back_off_and_recover() {
        let f = fixture(fast_options(), Duration::ZERO);
        f.client.fail_next_receive(ProviderError::Throttled("slow down".into()));
        f.client.fail_next_receive(ProviderError::Transient("oops".into()));
        f.client.send_message("q", "m");

        f.source.start();
        wait_for(|| f.processed.lock().len() == 1).await;
        assert_eq!(f.source.consecutive_failures(), 0);
        assert!(f.source.stop().await);
    }

    #[tokio::test]
    async fn test_missing_queue_stops_source() {
        let options = fast_options();
        let processed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::new(FanOutMessageSink::new(
            recording_pipeline(processed, Duration::ZERO),
            TaskExecutor::new("test", 10).unwrap(),
        ));
        let fetcher = Arc::new(QueueMessageFetcher::new(
            Arc::new(InMemoryQueueClient::new()),
            "missing",
            Arc::new(RecordingCallback::default()),
        ));
        let handler = adaptive_back_pressure_handler(&options).unwrap();
        let source = PollingMessageSource::new(fetcher, handler, sink, &options);

        source.start();
        wait_for(|| source.state() == SourceState::Stopped).await;
        assert!(!source.is_running());
        assert_eq!(source.back_pressure_handler().available_permits(), Some(10));
        assert!(source.stop().await);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let f = fixture(fast_options(), Duration::ZERO);
        assert!(f.source.stop().await);
        assert_eq!(f.source.state(), SourceState::Created);
    }

    #[tokio::test]
    async fn test_high_throughput_runs_concurrent_polls() {
        let options = ContainerOptions::builder()
            .back_pressure_mode(BackPressureMode::FixedHighThroughput)
            .max_concurrent_messages(40)
            .max_messages_per_poll(10)
            .poll_timeout(Duration::from_millis(20))
            .max_delay_between_polls(Duration::from_millis(20))
            .listener_shutdown_timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        let fetcher = Arc::new(SlowFetcher::new(Duration::from_millis(200), None));
        let (source, _processed) = slow_source(Arc::clone(&fetcher), &options);

        source.start();
        wait_for(|| fetcher.max_active.load(Ordering::SeqCst) >= 4).await;
        assert!(source.in_flight_fetches() > 1);

        assert!(source.stop().await);
        assert_eq!(source.back_pressure_handler().available_permits(), Some(40));
    }

    #[tokio::test]
    async fn test_stop_lets_in_flight_fetch_complete() {
        let options = fast_options();
        let fetcher = Arc::new(SlowFetcher::new(Duration::from_millis(200), Some(1)));
        let (source, processed) = slow_source(Arc::clone(&fetcher), &options);

        source.start();
        wait_for(|| fetcher.calls.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(source.stop().await);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fetcher.completed.load(Ordering::SeqCst), 1);
        assert_eq!(*processed.lock(), vec!["m0".to_string()]);
        assert_eq!(source.back_pressure_handler().available_permits(), Some(10));
    }
}
