//! Per-execution context handed to listeners and job bodies.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::gate::Gate;
use super::job::{Job, JobDescriptor};
use super::types::{JobKey, RunId};
use crate::scheduler::SchedulerHandle;

/// Handle to one execution of a schedule entry.
///
/// Cheap to clone. The cancellation token is a child of the scheduler's
/// lifetime token and fires when the scheduler stops.
#[derive(Clone)]
pub struct JobContext {
    run_id: RunId,
    fire_time: DateTime<Utc>,
    descriptor: JobDescriptor,
    job: Arc<dyn Job>,
    gate: Option<Gate>,
    cancel: CancellationToken,
    scheduler: SchedulerHandle,
}

impl JobContext {
    pub(crate) fn new(
        run_id: RunId,
        descriptor: JobDescriptor,
        fire_time: DateTime<Utc>,
        job: Arc<dyn Job>,
        gate: Option<Gate>,
        cancel: CancellationToken,
        scheduler: SchedulerHandle,
    ) -> Self {
        Self {
            run_id,
            fire_time,
            descriptor,
            job,
            gate,
            cancel,
            scheduler,
        }
    }

    /// Key of the entry being executed.
    pub fn key(&self) -> &JobKey {
        self.descriptor.key()
    }

    /// Key retries are accounted against: the original entry for repeats,
    /// otherwise the entry itself.
    pub fn origin_key(&self) -> &JobKey {
        self.descriptor.origin().unwrap_or_else(|| self.descriptor.key())
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// The time this execution was scheduled to fire.
    pub fn fire_time(&self) -> DateTime<Utc> {
        self.fire_time
    }

    pub fn descriptor(&self) -> &JobDescriptor {
        &self.descriptor
    }

    /// The job instance built for this execution.
    pub fn job(&self) -> &Arc<dyn Job> {
        &self.job
    }

    /// Exclusion gate of the entry's trigger, if it has one.
    pub fn gate(&self) -> Option<&Gate> {
        self.gate.as_ref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Handle to the scheduler running this job, e.g. to schedule follow-ups.
    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("key", self.key())
            .field("run_id", &self.run_id)
            .field("fire_time", &self.fire_time)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
