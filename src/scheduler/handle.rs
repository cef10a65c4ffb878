//! Scheduler handle for controlling the scheduler.
//!
//! This module provides the `SchedulerHandle` type through which callers (and
//! running jobs, via their context) schedule and unschedule entries and send
//! lifecycle commands to the clock loop.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::core::job::JobDescriptor;
use crate::core::trigger::Trigger;
use crate::core::types::JobKey;
use crate::events::EventBus;
use crate::storage::{ScheduleEntry, StoreError};

use super::engine::SchedulerCore;
use super::types::{JobHandle, SchedulerCommand, SchedulerError, SchedulerState};

/// Buffer size for the command channel between SchedulerHandle and Scheduler.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Handle for controlling the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    pub(crate) core: Arc<SchedulerCore>,
}

impl SchedulerHandle {
    /// Helper to send a command that returns unit and wait for response.
    async fn send_unit_command(
        &self,
        build_command: impl FnOnce(oneshot::Sender<()>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<(), SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.core
            .command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })?;

        Ok(())
    }

    /// Register `descriptor` under `trigger`.
    ///
    /// The first fire time is computed immediately. A trigger that never fires
    /// stores nothing and yields a handle without a fire time.
    pub async fn schedule(
        &self,
        descriptor: JobDescriptor,
        trigger: Trigger,
    ) -> Result<JobHandle, SchedulerError> {
        self.core.schedule(descriptor, trigger).await
    }

    /// Remove the entry for `key` and any pending repeats scheduled for it
    /// after failures. Returns whether anything was removed.
    ///
    /// A running execution of the entry finishes normally but is neither
    /// rescheduled nor repeated.
    pub async fn unschedule(&self, key: &JobKey) -> Result<bool, SchedulerError> {
        self.core.unschedule(key).await
    }

    /// Pause the scheduler.
    ///
    /// While paused, due entries are not fired, but `schedule` still works.
    pub async fn pause(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(|response| SchedulerCommand::Pause { response }, "pause")
            .await
    }

    /// Resume the scheduler after being paused.
    pub async fn resume(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(|response| SchedulerCommand::Resume { response }, "resume")
            .await
    }

    /// Shutdown the scheduler.
    ///
    /// Cancels every running execution's token and waits, up to the shutdown
    /// timeout, for them to return.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(
            |response| SchedulerCommand::Shutdown { response },
            "shutdown",
        )
        .await
    }

    /// Get the current scheduler state.
    pub async fn state(&self) -> SchedulerState {
        *self.core.state.read().await
    }

    /// Check if the scheduler is running.
    pub async fn is_running(&self) -> bool {
        self.state().await == SchedulerState::Running
    }

    /// Check if the scheduler is paused.
    pub async fn is_paused(&self) -> bool {
        self.state().await == SchedulerState::Paused
    }

    /// The stored entry for `key`, if any.
    pub async fn get(&self, key: &JobKey) -> Result<Option<ScheduleEntry>, SchedulerError> {
        match self.core.store.get(key).await {
            Ok(entry) => Ok(Some(entry)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All stored entries, ordered by key.
    pub async fn list(&self) -> Result<Vec<ScheduleEntry>, SchedulerError> {
        Ok(self.core.store.list().await?)
    }

    /// Number of executions currently in flight.
    pub async fn running_count(&self) -> usize {
        self.core
            .running
            .read()
            .await
            .values()
            .filter(|(_, handle)| !handle.is_finished())
            .count()
    }

    /// The scheduler's notion of now.
    pub fn now(&self) -> DateTime<Utc> {
        self.core.clock.now()
    }

    /// A token cancelled when the scheduler shuts down, e.g. to bound the
    /// lifetime of a worker queue.
    pub fn cancellation(&self) -> CancellationToken {
        self.core.shutdown.child_token()
    }

    /// Get the event bus.
    pub fn event_bus(&self) -> &EventBus {
        &self.core.event_bus
    }
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("clock", &self.core.clock)
            .finish_non_exhaustive()
    }
}
