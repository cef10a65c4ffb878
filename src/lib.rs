//! kairos - an in-process job scheduling engine.
//!
//! Jobs are registered with a [`Trigger`] that decides when they fire. A
//! single clock loop dispatches due entries onto their own tasks, wraps every
//! execution in a listener pipeline, serializes exclusion groups through a
//! shared [`Gate`], and lets jobs opt into bounded retries through a
//! [`RetryProvider`].

pub mod config;
pub mod core;
pub mod events;
pub mod execution;
pub mod listeners;
pub mod scheduler;
pub mod storage;
pub mod testing;

pub use config::{ConfigError, SchedulerConfig, WorkerQueueConfig};
pub use core::clock::{Clock, SystemClock, TokioClock};
pub use core::context::JobContext;
pub use core::gate::Gate;
pub use core::job::{
    Job, JobData, JobDataError, JobDescriptor, JobError, JobFactory, JobRegistry, JobResult,
};
pub use core::retry::{FixedDelayRetry, RetryDecision, RetryPolicy, RetryProvider};
pub use core::schedule::{CronError, CronSchedule};
pub use core::trigger::{Trigger, TriggerError};
pub use core::types::{EntryId, JobKey, RunId};
pub use events::{Event, EventBus, EventHandler};
pub use execution::{BatchQueue, QueueError, QueueProcessor, WorkerQueue};
pub use listeners::{JobListener, ListenerPipeline, LoggingListener, RetryListener};
pub use scheduler::{JobHandle, MIN_TICK_INTERVAL, Scheduler, SchedulerError, SchedulerHandle, SchedulerState};
pub use storage::{InMemoryJobStore, JobStore, RunState, ScheduleEntry, StoreError};
