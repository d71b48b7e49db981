//! Acknowledgement processors
//!
//! [`ImmediateAcknowledgementProcessor`] hands every acknowledgement to the
//! executor right away. [`BatchingAcknowledgementProcessor`] buffers them and
//! flushes when the interval elapses or a group reaches the threshold,
//! whichever comes first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, trace, warn};

use super::{
    AcknowledgementCallback, AcknowledgementError, AcknowledgementExecutor,
    AcknowledgementOrdering, AcknowledgementResultCallback,
};
use crate::message::Message;

/// Maximum messages per provider acknowledgement call
pub const DEFAULT_MAX_ACKNOWLEDGEMENTS_PER_BATCH: usize = 10;

/// Lifecycle of an acknowledgement processor
#[async_trait]
pub trait AcknowledgementProcessor: AcknowledgementCallback {
    /// Start accepting acknowledgements
    fn start(&self);

    /// Flush what is pending and wait up to `timeout` for running calls
    ///
    /// Returns whether everything finished in time.
    async fn stop(&self, timeout: Duration) -> bool;

    /// Whether acknowledgements are accepted
    fn is_running(&self) -> bool;

    /// This processor as the callback attached to messages
    fn as_callback(self: Arc<Self>) -> Arc<dyn AcknowledgementCallback>;
}

type Completion = Shared<BoxFuture<'static, ()>>;

/// Sends chunks of acknowledgements to the executor honoring the ordering
struct AcknowledgementDispatcher {
    endpoint: String,
    executor: Arc<dyn AcknowledgementExecutor>,
    ordering: AcknowledgementOrdering,
    max_per_batch: usize,
    result_callback: Option<Arc<dyn AcknowledgementResultCallback>>,
    last_by_key: Mutex<HashMap<String, Completion>>,
    tracker: TaskTracker,
}

impl AcknowledgementDispatcher {
    fn new(
        endpoint: String,
        executor: Arc<dyn AcknowledgementExecutor>,
        ordering: AcknowledgementOrdering,
        max_per_batch: usize,
        result_callback: Option<Arc<dyn AcknowledgementResultCallback>>,
    ) -> Self {
        Self {
            endpoint,
            executor,
            ordering,
            max_per_batch: max_per_batch.max(1),
            result_callback,
            last_by_key: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
        }
    }

    /// Schedule the messages; the returned future completes when their calls finish
    fn dispatch(&self, messages: Vec<Message>) -> BoxFuture<'static, ()> {
        if messages.is_empty() {
            return futures::future::ready(()).boxed();
        }
        match self.ordering {
            AcknowledgementOrdering::Parallel => self.dispatch_parallel(messages),
            AcknowledgementOrdering::Ordered => {
                let key = self.endpoint.clone();
                self.dispatch_ordered(vec![(key, messages)])
            }
            AcknowledgementOrdering::OrderedByGroup => {
                let mut groups: Vec<(String, Vec<Message>)> = Vec::new();
                for message in messages {
                    let key = message.group_key().to_string();
                    match groups.iter_mut().find(|(k, _)| *k == key) {
                        Some((_, group)) => group.push(message),
                        None => groups.push((key, vec![message])),
                    }
                }
                self.dispatch_ordered(groups)
            }
        }
    }

    fn chunks(&self, messages: Vec<Message>) -> Vec<Vec<Message>> {
        messages
            .chunks(self.max_per_batch)
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    fn dispatch_parallel(&self, messages: Vec<Message>) -> BoxFuture<'static, ()> {
        let handles: Vec<JoinHandle<()>> = self
            .chunks(messages)
            .into_iter()
            .map(|chunk| self.tracker.spawn(self.execute(chunk)))
            .collect();
        async move {
            join_all(handles).await;
        }
        .boxed()
    }

    fn dispatch_ordered(&self, groups: Vec<(String, Vec<Message>)>) -> BoxFuture<'static, ()> {
        let mut completions = Vec::new();
        let mut last_by_key = self.last_by_key.lock();
        last_by_key.retain(|_, completion| completion.peek().is_none());

        for (key, messages) in groups {
            for chunk in self.chunks(messages) {
                let previous = last_by_key.get(&key).cloned();
                let execution = self.execute(chunk);
                let next: Completion = async move {
                    // The previous outcome does not matter, only its completion.
                    if let Some(previous) = previous {
                        previous.await;
                    }
                    execution.await;
                }
                .boxed()
                .shared();
                last_by_key.insert(key.clone(), next.clone());
                self.tracker.spawn(next.clone());
                completions.push(next);
            }
        }
        async move {
            join_all(completions).await;
        }
        .boxed()
    }

    fn execute(&self, chunk: Vec<Message>) -> BoxFuture<'static, ()> {
        let executor = Arc::clone(&self.executor);
        let result_callback = self.result_callback.clone();
        let endpoint = self.endpoint.clone();
        async move {
            match executor.execute(&chunk).await {
                Ok(()) => {
                    trace!(%endpoint, count = chunk.len(), "acknowledged messages");
                    if let Some(callback) = result_callback {
                        callback.on_success(&chunk).await;
                    }
                }
                Err(e) => {
                    error!(
                        %endpoint,
                        count = chunk.len(),
                        error = %e,
                        "Failed to acknowledge messages"
                    );
                    if let Some(callback) = result_callback {
                        callback.on_failure(&chunk, &e).await;
                    }
                }
            }
        }
        .boxed()
    }

    async fn wait_for_running(&self, timeout: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok()
    }

    fn running_count(&self) -> usize {
        self.tracker.len()
    }
}

/// Acknowledges messages as soon as they are handed over
pub struct ImmediateAcknowledgementProcessor {
    dispatcher: AcknowledgementDispatcher,
    running: AtomicBool,
}

impl ImmediateAcknowledgementProcessor {
    /// Create a processor for an endpoint
    pub fn new(
        endpoint: impl Into<String>,
        executor: Arc<dyn AcknowledgementExecutor>,
        ordering: AcknowledgementOrdering,
    ) -> Self {
        Self {
            dispatcher: AcknowledgementDispatcher::new(
                endpoint.into(),
                executor,
                ordering,
                DEFAULT_MAX_ACKNOWLEDGEMENTS_PER_BATCH,
                None,
            ),
            running: AtomicBool::new(false),
        }
    }

    /// Observe provider acknowledgement results
    pub fn with_result_callback(
        mut self,
        callback: Arc<dyn AcknowledgementResultCallback>,
    ) -> Self {
        self.dispatcher.result_callback = Some(callback);
        self
    }

    /// Set the maximum messages per provider call
    pub fn with_max_acknowledgements_per_batch(mut self, max: usize) -> Self {
        self.dispatcher.max_per_batch = max.max(1);
        self
    }
}

#[async_trait]
impl AcknowledgementCallback for ImmediateAcknowledgementProcessor {
    async fn on_acknowledge(&self, messages: Vec<Message>) -> Result<(), AcknowledgementError> {
        if !self.is_running() {
            warn!(
                endpoint = %self.dispatcher.endpoint,
                count = messages.len(),
                "Acknowledgement processor not running, discarding acknowledgements"
            );
            return Err(AcknowledgementError::NotRunning(
                self.dispatcher.endpoint.clone(),
            ));
        }
        self.dispatcher.dispatch(messages).await;
        Ok(())
    }
}

#[async_trait]
impl AcknowledgementProcessor for ImmediateAcknowledgementProcessor {
    fn start(&self) {
        debug!(
            endpoint = %self.dispatcher.endpoint,
            "Starting immediate acknowledgement processor"
        );
        self.running.store(true, Ordering::SeqCst);
    }

    #[instrument(skip(self), fields(endpoint = %self.dispatcher.endpoint))]
    async fn stop(&self, timeout: Duration) -> bool {
        self.running.store(false, Ordering::SeqCst);
        let finished = self.dispatcher.wait_for_running(timeout).await;
        if !finished {
            warn!(
                running = self.dispatcher.running_count(),
                "Acknowledgements did not finish before the shutdown timeout"
            );
        }
        finished
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn as_callback(self: Arc<Self>) -> Arc<dyn AcknowledgementCallback> {
        self
    }
}

/// Buffers acknowledgements and flushes them by interval or threshold
///
/// Buffers are kept per message group so a threshold is reached per group.
pub struct BatchingAcknowledgementProcessor {
    dispatcher: Arc<AcknowledgementDispatcher>,
    interval: Option<Duration>,
    threshold: usize,
    sender: mpsc::UnboundedSender<Vec<Message>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Vec<Message>>>>,
    shutdown_tx: watch::Sender<bool>,
    running: AtomicBool,
    flush_handle: Mutex<Option<JoinHandle<()>>>,
}

impl BatchingAcknowledgementProcessor {
    /// Create a batching processor
    ///
    /// Fails when neither a non-zero interval nor a non-zero threshold is set.
    pub fn new(
        endpoint: impl Into<String>,
        executor: Arc<dyn AcknowledgementExecutor>,
        ordering: AcknowledgementOrdering,
        interval: Option<Duration>,
        threshold: Option<usize>,
        result_callback: Option<Arc<dyn AcknowledgementResultCallback>>,
    ) -> Result<Self, AcknowledgementError> {
        let interval = interval.filter(|i| !i.is_zero());
        let threshold = threshold.unwrap_or(0);
        if interval.is_none() && threshold == 0 {
            return Err(AcknowledgementError::InvalidConfig(
                "batching acknowledgements need a non-zero interval or threshold".into(),
            ));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            dispatcher: Arc::new(AcknowledgementDispatcher::new(
                endpoint.into(),
                executor,
                ordering,
                DEFAULT_MAX_ACKNOWLEDGEMENTS_PER_BATCH,
                result_callback,
            )),
            interval,
            threshold,
            sender,
            receiver: Mutex::new(Some(receiver)),
            shutdown_tx,
            running: AtomicBool::new(false),
            flush_handle: Mutex::new(None),
        })
    }

    /// Flush interval, if any
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Flush threshold per group, 0 when disabled
    pub fn threshold(&self) -> usize {
        self.threshold
    }
}

struct PendingAcknowledgements {
    groups: Vec<(String, Vec<Message>)>,
    first_buffered_at: Option<Instant>,
}

impl PendingAcknowledgements {
    fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn add(&mut self, message: Message) -> usize {
        if self.first_buffered_at.is_none() {
            self.first_buffered_at = Some(Instant::now());
        }
        let key = message.group_key().to_string();
        match self.groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, group)) => {
                group.push(message);
                group.len()
            }
            None => {
                self.groups.push((key, vec![message]));
                1
            }
        }
    }

    /// Remove full chunks of `threshold` messages from a group
    fn take_full(&mut self, key: &str, threshold: usize) -> Vec<Message> {
        let Some(index) = self.groups.iter().position(|(k, _)| k == key) else {
            return Vec::new();
        };
        let group = &mut self.groups[index].1;
        let full = group.len() / threshold * threshold;
        let taken: Vec<Message> = group.drain(..full).collect();
        if group.is_empty() {
            self.groups.remove(index);
        }
        if self.groups.is_empty() {
            self.first_buffered_at = None;
        }
        taken
    }

    fn take_all(&mut self) -> Vec<Message> {
        self.first_buffered_at = None;
        self.groups.drain(..).flat_map(|(_, group)| group).collect()
    }
}

async fn run_flush_loop(
    dispatcher: Arc<AcknowledgementDispatcher>,
    mut receiver: mpsc::UnboundedReceiver<Vec<Message>>,
    mut shutdown_rx: watch::Receiver<bool>,
    interval: Option<Duration>,
    threshold: usize,
) {
    let mut pending = PendingAcknowledgements {
        groups: Vec::new(),
        first_buffered_at: None,
    };

    loop {
        let flush_at = match (interval, pending.first_buffered_at) {
            (Some(interval), Some(first)) => Some(first + interval),
            _ => None,
        };

        tokio::select! {
            received = receiver.recv() => {
                let Some(messages) = received else { break };
                for message in messages {
                    let key = message.group_key().to_string();
                    let size = pending.add(message);
                    if threshold > 0 && size >= threshold {
                        let full = pending.take_full(&key, threshold);
                        trace!(count = full.len(), "threshold reached, flushing");
                        drop(dispatcher.dispatch(full));
                    }
                }
            }
            _ = async {
                match flush_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => futures::future::pending::<()>().await,
                }
            } => {
                let all = pending.take_all();
                trace!(count = all.len(), "interval elapsed, flushing");
                drop(dispatcher.dispatch(all));
            }
            _ = shutdown_rx.changed() => break,
        }
    }

    while let Ok(messages) = receiver.try_recv() {
        for message in messages {
            pending.add(message);
        }
    }
    if !pending.is_empty() {
        let all = pending.take_all();
        debug!(count = all.len(), "Flushing remaining acknowledgements");
        drop(dispatcher.dispatch(all));
    }
}

#[async_trait]
impl AcknowledgementCallback for BatchingAcknowledgementProcessor {
    async fn on_acknowledge(&self, messages: Vec<Message>) -> Result<(), AcknowledgementError> {
        if !self.is_running() || self.sender.send(messages).is_err() {
            warn!(
                endpoint = %self.dispatcher.endpoint,
                "Acknowledgement processor not running, discarding acknowledgements"
            );
            return Err(AcknowledgementError::NotRunning(
                self.dispatcher.endpoint.clone(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl AcknowledgementProcessor for BatchingAcknowledgementProcessor {
    fn start(&self) {
        let Some(receiver) = self.receiver.lock().take() else {
            warn!(
                endpoint = %self.dispatcher.endpoint,
                "Batching acknowledgement processor cannot be restarted"
            );
            return;
        };
        debug!(
            endpoint = %self.dispatcher.endpoint,
            interval_ms = self.interval.map(|i| i.as_millis() as u64),
            threshold = self.threshold,
            "Starting batching acknowledgement processor"
        );
        self.running.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(run_flush_loop(
            Arc::clone(&self.dispatcher),
            receiver,
            self.shutdown_tx.subscribe(),
            self.interval,
            self.threshold,
        ));
        *self.flush_handle.lock() = Some(handle);
    }

    #[instrument(skip(self), fields(endpoint = %self.dispatcher.endpoint))]
    async fn stop(&self, timeout: Duration) -> bool {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        let deadline = Instant::now() + timeout;
        let handle = self.flush_handle.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                warn!("Acknowledgement flush did not finish before the shutdown timeout");
                return false;
            }
        }

        let finished = self
            .dispatcher
            .wait_for_running(deadline.saturating_duration_since(Instant::now()))
            .await;
        if finished {
            info!("Acknowledgement processor stopped");
        } else {
            warn!(
                running = self.dispatcher.running_count(),
                "Acknowledgements did not finish before the shutdown timeout"
            );
        }
        finished
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn as_callback(self: Arc<Self>) -> Arc<dyn AcknowledgementCallback> {
        self
    }
}
