/*!
Async operation queue.

Bounds how many storage operations are in flight, admits waiting operations
by priority class, and provides a per-key write lock so at most one write
per logical key runs at a time.
*/

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info_span, Instrument};

use crate::config::QueueConfig;
use crate::{DataError, Result};

/// Scheduling priority class
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Descriptive metadata attached to a batch, used for logging
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchMetadata {
    pub operation: String,
    pub count: usize,
}

/// Options for [`AsyncQueue::execute_batch`]
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub priority: Priority,
    /// Run operations concurrently (up to the queue cap) instead of in order
    pub parallel: bool,
    pub metadata: BatchMetadata,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            parallel: true,
            metadata: BatchMetadata::default(),
        }
    }
}

impl BatchOptions {
    pub fn sequential() -> Self {
        Self {
            parallel: false,
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata<S: Into<String>>(mut self, operation: S, count: usize) -> Self {
        self.metadata = BatchMetadata {
            operation: operation.into(),
            count,
        };
        self
    }
}

/// Point-in-time queue status
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    /// Operations waiting for admission
    pub pending: usize,
    /// Operations currently in flight
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub max_concurrency: usize,
    pub closed: bool,
}

struct Waiter {
    priority: Priority,
    seq: u64,
    admit: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // Max-heap: higher priority first, then earlier arrival
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct SchedulerState {
    running: usize,
    waiting: BinaryHeap<Waiter>,
    closed: bool,
}

/// Bounded, priority-aware operation queue
pub struct AsyncQueue {
    max_concurrency: usize,
    state: Mutex<SchedulerState>,
    key_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    seq: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl AsyncQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency.max(1),
            state: Mutex::new(SchedulerState::default()),
            key_locks: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Run one operation once a slot is available
    pub async fn enqueue<T, Fut>(&self, priority: Priority, operation: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let _slot = self.acquire(priority).await?;
        let result = operation.await;
        match &result {
            Ok(_) => self.completed.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    /// Run a batch of operations and report each outcome in input order
    ///
    /// A failing operation never cancels its siblings. With `parallel` off
    /// the operations run strictly one after another in array order.
    pub async fn execute_batch<'a, T>(
        &self,
        operations: Vec<BoxFuture<'a, Result<T>>>,
        options: BatchOptions,
    ) -> Vec<Result<T>> {
        let span = info_span!(
            "execute_batch",
            operation = %options.metadata.operation,
            count = operations.len(),
            parallel = options.parallel,
        );

        async {
            let priority = options.priority;
            let results = if options.parallel {
                join_all(operations.into_iter().map(|op| self.enqueue(priority, op))).await
            } else {
                let mut results = Vec::with_capacity(operations.len());
                for op in operations {
                    results.push(self.enqueue(priority, op).await);
                }
                results
            };

            let failures = results.iter().filter(|r| r.is_err()).count();
            debug!(failures, "batch finished");
            results
        }
        .instrument(span)
        .await
    }

    /// Take the write lock for `key`, waiting for any in-flight holder
    pub async fn lock_key(&self, key: &str) -> KeyGuard<'_> {
        let lock = {
            let mut locks = self.lock_keys();
            Arc::clone(
                locks
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };

        KeyGuard {
            guard: Some(lock.lock_owned().await),
            key: key.to_string(),
            queue: self,
        }
    }

    /// Stop admitting operations. Waiting operations fail with
    /// [`DataError::QueueClosed`]; operations already running finish.
    pub fn close(&self) {
        let mut state = self.lock_state();
        state.closed = true;
        let dropped = state.waiting.len();
        state.waiting.clear();
        debug!(dropped, "operation queue closed");
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.lock_state();
        QueueStatus {
            pending: state.waiting.len(),
            running: state.running,
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            max_concurrency: self.max_concurrency,
            closed: state.closed,
        }
    }

    async fn acquire(&self, priority: Priority) -> Result<Slot<'_>> {
        let rx = {
            let mut state = self.lock_state();
            if state.closed {
                return Err(DataError::QueueClosed);
            }
            if state.running < self.max_concurrency && state.waiting.is_empty() {
                state.running += 1;
                return Ok(Slot { queue: self });
            }

            let (admit, rx) = oneshot::channel();
            state.waiting.push(Waiter {
                priority,
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                admit,
            });
            rx
        };

        let mut pending = PendingAdmission {
            queue: self,
            rx: Some(rx),
        };
        let admitted = match pending.rx.as_mut() {
            Some(rx) => rx.await.is_ok(),
            None => false,
        };
        pending.rx = None;

        if admitted {
            Ok(Slot { queue: self })
        } else {
            Err(DataError::QueueClosed)
        }
    }

    /// Hand the slot to the best waiter, or give it back
    fn release_slot(&self) {
        let mut state = self.lock_state();
        while let Some(waiter) = state.waiting.pop() {
            if waiter.admit.send(()).is_ok() {
                return;
            }
        }
        state.running = state.running.saturating_sub(1);
    }

    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_keys(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.key_locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new(&QueueConfig::default())
    }
}

/// An admitted operation's slot; released on drop
struct Slot<'a> {
    queue: &'a AsyncQueue,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.queue.release_slot();
    }
}

/// Receiver side of a queued admission. If the waiting future is dropped
/// after a slot was handed over but before it was observed, the slot is
/// passed on instead of leaking.
struct PendingAdmission<'a> {
    queue: &'a AsyncQueue,
    rx: Option<oneshot::Receiver<()>>,
}

impl Drop for PendingAdmission<'_> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                self.queue.release_slot();
            }
        }
    }
}

/// Exclusive write access to one logical key
pub struct KeyGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    queue: &'a AsyncQueue,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.queue.lock_keys();
        if let Some(lock) = locks.get(&self.key) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(&self.key);
            }
        }
    }
}
