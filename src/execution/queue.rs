//! Elastic FIFO work queue for running job bodies off the clock loop.
//!
//! [`BatchQueue`] is the buffer: non-blocking enqueue, and a drain that
//! suspends until at least one item is buffered and then takes up to a batch
//! of items without waiting further.
//!
//! [`WorkerQueue`] puts a consumer on top of it. The consumer task exists only
//! while there is work: the first enqueue into an idle queue spawns it, and
//! it exits as soon as it finds the buffer empty after a batch.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerQueueConfig;
use crate::core::job::{JobError, JobResult};

/// Errors returned when submitting work.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// FIFO buffer with blocking batch drain.
pub struct BatchQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T> BatchQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Append an item. Never blocks; fails only once the queue is closed.
    pub fn enqueue(&self, item: T) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            state.items.push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Wait until at least one item is buffered, then take up to `max_batch`
    /// items in FIFO order.
    ///
    /// Returns an empty batch only when the queue is closed and drained.
    pub async fn drain(&self, max_batch: usize) -> Vec<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if !state.items.is_empty() {
                    return take_batch(&mut state.items, max_batch);
                }
                if state.closed {
                    return Vec::new();
                }
            }

            notified.await;
        }
    }

    /// Take up to `max_batch` buffered items without waiting.
    pub fn try_drain(&self, max_batch: usize) -> Vec<T> {
        take_batch(&mut self.lock().items, max_batch)
    }

    /// Refuse further items and wake any waiting drain.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    // Every critical section leaves the deque consistent.
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for BatchQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for BatchQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("BatchQueue")
            .field("len", &state.items.len())
            .field("closed", &state.closed)
            .finish()
    }
}

fn take_batch<T>(items: &mut VecDeque<T>, max_batch: usize) -> Vec<T> {
    let n = items.len().min(max_batch.max(1));
    items.drain(..n).collect()
}

/// Per-item processing hook of a [`WorkerQueue`].
#[async_trait]
pub trait QueueProcessor<T: Send + 'static>: Send + Sync + 'static {
    /// Process one item.
    ///
    /// `cancel` fires when the item's timeout elapses. It is not tied to the
    /// queue's lifetime token: a drained item runs to completion even while
    /// the queue shuts down.
    async fn process_item(&self, item: T, cancel: CancellationToken) -> JobResult;
}

/// Elastic single-consumer work queue.
///
/// Items are processed one at a time in FIFO order, each on its own task so
/// a panicking item is isolated. A failure is logged and the consumer moves
/// on to the next item.
pub struct WorkerQueue<T: Send + 'static> {
    queue: Arc<BatchQueue<T>>,
    processor: Arc<dyn QueueProcessor<T>>,
    max_batch: usize,
    item_timeout: Option<Duration>,
    lifetime: CancellationToken,
    consumer_active: Arc<Mutex<bool>>,
}

impl<T: Send + 'static> WorkerQueue<T> {
    /// Default number of items taken per drain.
    pub const DEFAULT_MAX_BATCH: usize = 16;

    /// Create a queue whose consumer stops when `lifetime` is cancelled.
    pub fn new(processor: Arc<dyn QueueProcessor<T>>, lifetime: CancellationToken) -> Self {
        Self {
            queue: Arc::new(BatchQueue::new()),
            processor,
            max_batch: Self::DEFAULT_MAX_BATCH,
            item_timeout: None,
            lifetime,
            consumer_active: Arc::new(Mutex::new(false)),
        }
    }

    /// Create a queue from configuration.
    pub fn from_config(
        processor: Arc<dyn QueueProcessor<T>>,
        config: &WorkerQueueConfig,
        lifetime: CancellationToken,
    ) -> Self {
        let mut queue = Self::new(processor, lifetime).with_max_batch(config.max_batch);
        if let Some(timeout) = config.item_timeout() {
            queue = queue.with_item_timeout(timeout);
        }
        queue
    }

    /// Set how many items one drain takes. Zero is treated as one.
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    /// Cancel and abandon an item that runs longer than `timeout`.
    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = Some(timeout);
        self
    }

    /// Submit an item. Never blocks.
    ///
    /// Wakes a consumer if none is running. Fails once the lifetime token
    /// is cancelled or the queue is closed.
    pub fn enqueue(&self, item: T) -> Result<(), QueueError> {
        if self.lifetime.is_cancelled() {
            return Err(QueueError::Closed);
        }
        self.queue.enqueue(item)?;

        let mut active = lock_flag(&self.consumer_active);
        if !*active {
            *active = true;
            drop(active);
            self.spawn_consumer();
        }
        Ok(())
    }

    /// Items buffered and not yet drained.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Whether a consumer task currently exists.
    pub fn is_consuming(&self) -> bool {
        *lock_flag(&self.consumer_active)
    }

    /// Stop accepting items. Buffered items are still processed.
    pub fn close(&self) {
        self.queue.close();
    }

    fn spawn_consumer(&self) {
        let consumer = Consumer {
            queue: Arc::clone(&self.queue),
            processor: Arc::clone(&self.processor),
            max_batch: self.max_batch,
            item_timeout: self.item_timeout,
            lifetime: self.lifetime.clone(),
            active: Arc::clone(&self.consumer_active),
        };
        tokio::spawn(consumer.run());
    }
}

impl<T: Send + 'static> fmt::Debug for WorkerQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerQueue")
            .field("queue", &self.queue)
            .field("max_batch", &self.max_batch)
            .field("item_timeout", &self.item_timeout)
            .finish()
    }
}

fn lock_flag(flag: &Mutex<bool>) -> MutexGuard<'_, bool> {
    flag.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Consumer<T: Send + 'static> {
    queue: Arc<BatchQueue<T>>,
    processor: Arc<dyn QueueProcessor<T>>,
    max_batch: usize,
    item_timeout: Option<Duration>,
    lifetime: CancellationToken,
    active: Arc<Mutex<bool>>,
}

impl<T: Send + 'static> Consumer<T> {
    async fn run(self) {
        loop {
            let batch = tokio::select! {
                biased;
                _ = self.lifetime.cancelled() => {
                    tracing::debug!(pending = self.queue.len(), "Worker queue cancelled, consumer exiting");
                    break;
                }
                batch = self.queue.drain(self.max_batch) => batch,
            };
            if batch.is_empty() {
                break;
            }

            tracing::trace!(batch = batch.len(), "Processing worker queue batch");
            for item in batch {
                self.process(item).await;
            }

            if self.retire_if_idle() {
                return;
            }
        }
        *lock_flag(&self.active) = false;
    }

    // Checked under the flag lock so a concurrent enqueue either sees the
    // consumer still active or spawns a new one.
    fn retire_if_idle(&self) -> bool {
        let mut active = lock_flag(&self.active);
        if self.queue.is_empty() {
            *active = false;
            return true;
        }
        false
    }

    async fn process(&self, item: T) {
        let processor = Arc::clone(&self.processor);
        let cancel = CancellationToken::new();
        let item_cancel = cancel.clone();
        let handle = tokio::spawn(async move { processor.process_item(item, item_cancel).await });

        let joined = match self.item_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    cancel.cancel();
                    tracing::warn!(timeout = ?timeout, "Worker queue item timed out");
                    return;
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Worker queue item failed"),
            Err(e) => {
                let error = JobError::Panicked(e.to_string());
                tracing::error!(error = %error, "Worker queue item panicked");
            }
        }
    }
}
