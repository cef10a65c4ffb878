//! Testing utilities for users of the Kairos library.
//!
//! This module provides helpers for testing schedules:
//!
//! - [`RecordingHandler`]: An event handler that keeps every event it sees
//! - [`ExecutionLog`]: Start/finish instants of every execution
//! - [`CountingJob`]: A configurable job that writes to an [`ExecutionLog`]

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::context::JobContext;
use crate::core::job::{Job, JobData, JobError, JobResult};
use crate::core::retry::RetryProvider;
use crate::core::types::JobKey;
use crate::events::{Event, EventHandler};

/// Event handler that records received events.
///
/// # Example
///
/// ```
/// use kairos::scheduler::Scheduler;
/// use kairos::testing::RecordingHandler;
///
/// let handler = RecordingHandler::new();
/// let _scheduler = Scheduler::new().with_event_handler(handler.clone());
/// ```
#[derive(Default)]
pub struct RecordingHandler {
    events: tokio::sync::Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All events received so far, in order.
    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    /// Number of received events matching `predicate`.
    pub async fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().await.iter().filter(|e| predicate(e)).count()
    }

    pub async fn clear(&self) {
        self.events.lock().await.clear();
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}

/// One execution seen by an [`ExecutionLog`].
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub key: JobKey,
    pub started: Instant,
    /// `None` while the execution is still running.
    pub finished: Option<Instant>,
}

/// Shared record of job executions, using tokio's clock so it follows
/// paused time.
#[derive(Debug, Default)]
pub struct ExecutionLog {
    records: Mutex<Vec<ExecutionRecord>>,
}

impl ExecutionLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record the start of an execution and return its index.
    pub fn start(&self, key: JobKey) -> usize {
        let mut records = self.lock();
        records.push(ExecutionRecord {
            key,
            started: Instant::now(),
            finished: None,
        });
        records.len() - 1
    }

    /// Record the end of the execution at `index`.
    pub fn finish(&self, index: usize) {
        if let Some(record) = self.lock().get_mut(index) {
            record.finished = Some(Instant::now());
        }
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.lock().clone()
    }

    /// Executions of `key`, oldest first.
    pub fn runs_of(&self, key: &JobKey) -> Vec<ExecutionRecord> {
        self.lock()
            .iter()
            .filter(|r| &r.key == key)
            .cloned()
            .collect()
    }

    /// Total number of executions started.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ExecutionRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

const ALWAYS: u32 = u32::MAX;

/// A job that logs its executions and can sleep, fail or panic on demand.
///
/// Clones share the failure budget, so a factory handing out clones behaves
/// like one job across firings.
///
/// # Example
///
/// ```
/// use kairos::core::job::JobRegistry;
/// use kairos::testing::{CountingJob, ExecutionLog};
/// use std::time::Duration;
///
/// let log = ExecutionLog::new();
/// let job = CountingJob::new(log.clone())
///     .sleeping(Duration::from_secs(5))
///     .failing_times(2);
///
/// let registry = JobRegistry::new().with("counting", job.factory());
/// assert!(registry.contains("counting"));
/// assert!(log.is_empty());
/// ```
#[derive(Clone)]
pub struct CountingJob {
    log: Arc<ExecutionLog>,
    duration: Duration,
    failures: Arc<AtomicU32>,
    panics: bool,
    retry: Option<Arc<dyn RetryProvider>>,
}

impl CountingJob {
    /// A job that succeeds immediately.
    pub fn new(log: Arc<ExecutionLog>) -> Self {
        Self {
            log,
            duration: Duration::ZERO,
            failures: Arc::new(AtomicU32::new(0)),
            panics: false,
            retry: None,
        }
    }

    /// Sleep for `duration` (or until cancelled) on every execution.
    pub fn sleeping(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Fail the first `count` executions, then succeed.
    pub fn failing_times(mut self, count: u32) -> Self {
        self.failures = Arc::new(AtomicU32::new(count));
        self
    }

    /// Fail every execution.
    pub fn always_failing(self) -> Self {
        self.failing_times(ALWAYS)
    }

    /// Panic on every execution.
    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    /// Declare the job retryable through `provider`.
    pub fn with_retry(mut self, provider: Arc<dyn RetryProvider>) -> Self {
        self.retry = Some(provider);
        self
    }

    /// Factory closure handing out clones of this job.
    pub fn factory(self) -> impl Fn(&JobData) -> Result<CountingJob, JobError> + Send + Sync + 'static {
        move |_| Ok(self.clone())
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                ALWAYS => Some(ALWAYS),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

#[async_trait]
impl Job for CountingJob {
    async fn execute(&self, ctx: &JobContext, cancel: &CancellationToken) -> JobResult {
        let index = self.log.start(ctx.key().clone());
        let outcome = if self.duration.is_zero() {
            Ok(())
        } else {
            tokio::select! {
                _ = cancel.cancelled() => Err(JobError::Cancelled),
                _ = tokio::time::sleep(self.duration) => Ok(()),
            }
        };
        self.log.finish(index);
        outcome?;

        if self.panics {
            panic!("{} panicked", ctx.key());
        }
        if self.take_failure() {
            return Err(JobError::execution(format!("{} failed", ctx.key())));
        }
        Ok(())
    }

    fn retry_provider(&self) -> Option<Arc<dyn RetryProvider>> {
        self.retry.clone()
    }
}
