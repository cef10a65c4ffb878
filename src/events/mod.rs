//! Lifecycle events and event handling.
//!
//! The scheduler reports every scheduling decision and execution outcome on
//! an [`EventBus`]. This is the channel through which callers observe
//! terminal failures and trigger computation errors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::types::{JobKey, RunId};

/// Lifecycle events emitted by the scheduler.
#[derive(Debug, Clone)]
pub enum Event {
    /// An entry was added to the store.
    JobScheduled {
        key: JobKey,
        next_fire_time: DateTime<Utc>,
        timestamp: Instant,
    },

    /// An entry was removed by `unschedule`.
    JobUnscheduled { key: JobKey, timestamp: Instant },

    /// A due entry found its exclusion gate held and was queued.
    JobDeferred {
        key: JobKey,
        gate: String,
        timestamp: Instant,
    },

    /// An execution started.
    JobStarted {
        key: JobKey,
        run_id: RunId,
        fire_time: DateTime<Utc>,
        timestamp: Instant,
    },

    /// An execution succeeded.
    JobCompleted {
        key: JobKey,
        run_id: RunId,
        duration: Duration,
        timestamp: Instant,
    },

    /// An execution failed and no retry was scheduled.
    JobFailed {
        key: JobKey,
        run_id: RunId,
        error: String,
        duration: Duration,
        timestamp: Instant,
    },

    /// An execution failed and its retry provider scheduled a repeat.
    RetryScheduled {
        key: JobKey,
        run_id: RunId,
        /// Repeat number, starting at 1.
        attempt: u32,
        retry_key: JobKey,
        timestamp: Instant,
    },

    /// The retry budget of `origin` is spent. Terminal.
    RetryExhausted {
        key: JobKey,
        run_id: RunId,
        origin: JobKey,
        /// Failed executions including the initial one.
        attempts: u32,
        error: String,
        timestamp: Instant,
    },

    /// Computing the next fire time failed; the entry was finalized.
    TriggerFailed {
        key: JobKey,
        error: String,
        timestamp: Instant,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::JobScheduled { timestamp, .. }
            | Event::JobUnscheduled { timestamp, .. }
            | Event::JobDeferred { timestamp, .. }
            | Event::JobStarted { timestamp, .. }
            | Event::JobCompleted { timestamp, .. }
            | Event::JobFailed { timestamp, .. }
            | Event::RetryScheduled { timestamp, .. }
            | Event::RetryExhausted { timestamp, .. }
            | Event::TriggerFailed { timestamp, .. } => *timestamp,
        }
    }

    /// Key of the entry the event is about.
    pub fn key(&self) -> &JobKey {
        match self {
            Event::JobScheduled { key, .. }
            | Event::JobUnscheduled { key, .. }
            | Event::JobDeferred { key, .. }
            | Event::JobStarted { key, .. }
            | Event::JobCompleted { key, .. }
            | Event::JobFailed { key, .. }
            | Event::RetryScheduled { key, .. }
            | Event::RetryExhausted { key, .. }
            | Event::TriggerFailed { key, .. } => key,
        }
    }

    /// Create a JobScheduled event.
    pub fn job_scheduled(key: JobKey, next_fire_time: DateTime<Utc>) -> Self {
        Event::JobScheduled {
            key,
            next_fire_time,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobUnscheduled event.
    pub fn job_unscheduled(key: JobKey) -> Self {
        Event::JobUnscheduled {
            key,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobDeferred event.
    pub fn job_deferred(key: JobKey, gate: impl Into<String>) -> Self {
        Event::JobDeferred {
            key,
            gate: gate.into(),
            timestamp: Instant::now(),
        }
    }

    /// Create a JobStarted event.
    pub fn job_started(key: JobKey, run_id: RunId, fire_time: DateTime<Utc>) -> Self {
        Event::JobStarted {
            key,
            run_id,
            fire_time,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobCompleted event.
    pub fn job_completed(key: JobKey, run_id: RunId, duration: Duration) -> Self {
        Event::JobCompleted {
            key,
            run_id,
            duration,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobFailed event.
    pub fn job_failed(key: JobKey, run_id: RunId, error: String, duration: Duration) -> Self {
        Event::JobFailed {
            key,
            run_id,
            error,
            duration,
            timestamp: Instant::now(),
        }
    }

    /// Create a RetryScheduled event.
    pub fn retry_scheduled(key: JobKey, run_id: RunId, attempt: u32, retry_key: JobKey) -> Self {
        Event::RetryScheduled {
            key,
            run_id,
            attempt,
            retry_key,
            timestamp: Instant::now(),
        }
    }

    /// Create a RetryExhausted event.
    pub fn retry_exhausted(
        key: JobKey,
        run_id: RunId,
        origin: JobKey,
        attempts: u32,
        error: String,
    ) -> Self {
        Event::RetryExhausted {
            key,
            run_id,
            origin,
            attempts,
            error,
            timestamp: Instant::now(),
        }
    }

    /// Create a TriggerFailed event.
    pub fn trigger_failed(key: JobKey, error: String) -> Self {
        Event::TriggerFailed {
            key,
            error,
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers, in registration order.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
