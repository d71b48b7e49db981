//! Bounded task executor shared by every sink of a container

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Executor errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutorError {
    /// Concurrency must be positive
    #[error("executor {0} needs a positive concurrency")]
    InvalidConcurrency(String),

    /// Concurrency above what a semaphore can hold
    #[error("executor {name} concurrency {requested} exceeds {max}")]
    TooManySlots {
        name: String,
        requested: usize,
        max: usize,
    },
}

/// Runs pipeline invocations with at most `max_concurrency` running at once
///
/// Tasks are spawned right away and wait for a slot inside the task, so
/// `spawn` never blocks the caller.
#[derive(Clone)]
pub struct TaskExecutor {
    name: Arc<str>,
    slots: Arc<Semaphore>,
    max_concurrency: usize,
    tracker: TaskTracker,
}

impl TaskExecutor {
    /// Create an executor
    pub fn new(name: impl Into<String>, max_concurrency: usize) -> Result<Self, ExecutorError> {
        let name: String = name.into();
        if max_concurrency == 0 {
            return Err(ExecutorError::InvalidConcurrency(name));
        }
        if max_concurrency > Semaphore::MAX_PERMITS {
            return Err(ExecutorError::TooManySlots {
                name,
                requested: max_concurrency,
                max: Semaphore::MAX_PERMITS,
            });
        }
        debug!(executor = %name, max_concurrency, "Created task executor");
        Ok(Self {
            name: name.into(),
            slots: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            tracker: TaskTracker::new(),
        })
    }

    /// Executor name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum tasks running at once
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Slots not taken by running tasks
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Spawned tasks not finished yet, waiting or running
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Spawn a task that runs once a slot is free
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let slots = Arc::clone(&self.slots);
        self.tracker.spawn(async move {
            let _slot = slots.acquire_owned().await.ok();
            task.await
        })
    }

    /// Wait up to `timeout` for every spawned task
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let idle = tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok();
        self.tracker.reopen();
        if !idle {
            warn!(
                executor = %self.name,
                active = self.active_tasks(),
                "Tasks still running after timeout"
            );
        }
        idle
    }
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("name", &self.name)
            .field("max_concurrency", &self.max_concurrency)
            .field("available_slots", &self.available_slots())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_zero_concurrency_rejected() {
        assert!(matches!(
            TaskExecutor::new("zero", 0),
            Err(ExecutorError::InvalidConcurrency(_))
        ));
    }

    #[test]
    fn test_oversized_concurrency_rejected() {
        assert!(matches!(
            TaskExecutor::new("huge", Semaphore::MAX_PERMITS + 1),
            Err(ExecutorError::TooManySlots { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let executor = TaskExecutor::new("bounded", 2).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                executor.spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(executor.available_slots(), 2);
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let executor = TaskExecutor::new("idle", 4).unwrap();
        executor.spawn(tokio::time::sleep(Duration::from_millis(10)));
        assert!(executor.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(executor.active_tasks(), 0);

        executor.spawn(tokio::time::sleep(Duration::from_secs(10)));
        assert!(!executor.wait_idle(Duration::from_millis(10)).await);
    }
}
