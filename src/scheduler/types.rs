//! Scheduler type definitions.
//!
//! This module contains error types, state enums, and command types for the scheduler.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::core::gate::Gate;
use crate::core::trigger::TriggerError;
use crate::core::types::JobKey;
use crate::storage::StoreError;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// An active entry already exists for the key.
    #[error("duplicate key: {0}")]
    DuplicateKey(JobKey),

    /// The descriptor cannot be used to build a job.
    #[error("invalid descriptor for {key}: {reason}")]
    InvalidDescriptor { key: JobKey, reason: String },

    /// No factory is registered for the descriptor's job type.
    #[error("unknown job type '{job_type}' for {key}")]
    UnknownJobType { key: JobKey, job_type: String },

    /// The trigger could not compute a first fire time.
    #[error("trigger error for {key}: {source}")]
    Trigger {
        key: JobKey,
        #[source]
        source: TriggerError,
    },

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),

    /// The scheduler has been shut down.
    #[error("scheduler is not running")]
    NotRunning,
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Scheduler is stopped.
    Stopped,
    /// Scheduler is running.
    Running,
    /// Scheduler is paused: nothing fires, `schedule` still works.
    Paused,
}

/// Result of a successful `schedule` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub key: JobKey,
    /// First fire time, or `None` when the trigger never fires and nothing
    /// was stored.
    pub next_fire_time: Option<DateTime<Utc>>,
}

impl JobHandle {
    /// Whether an entry was stored.
    pub fn is_scheduled(&self) -> bool {
        self.next_fire_time.is_some()
    }
}

/// Commands that can be sent to the scheduler.
pub(crate) enum SchedulerCommand {
    /// Pause the scheduler.
    Pause { response: oneshot::Sender<()> },
    /// Resume the scheduler.
    Resume { response: oneshot::Sender<()> },
    /// Shutdown the scheduler.
    Shutdown { response: oneshot::Sender<()> },
}

/// A gate was handed to a deferred key and its execution should start.
#[derive(Debug)]
pub(crate) struct Admission {
    pub gate: Gate,
    pub key: JobKey,
}
