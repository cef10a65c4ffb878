//! Scheduler engine: the clock loop and execution dispatch.
//!
//! A single actor task owns the clock. Each tick it asks the store for due
//! entries and dispatches them; every execution runs on its own task, so the
//! loop only decides when jobs run, never waits for what they do. Exclusion
//! gates hand themselves to the next deferred key on release, and the loop
//! receives those hand-offs as admissions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::core::clock::{Clock, SystemClock};
use crate::core::context::JobContext;
use crate::core::gate::Gate;
use crate::core::job::{JobDescriptor, JobError, JobRegistry, JobResult};
use crate::core::trigger::Trigger;
use crate::core::types::{JobKey, RunId};
use crate::events::{Event, EventBus, EventHandler};
use crate::listeners::{JobListener, ListenerPipeline, RetryListener};
use crate::storage::{InMemoryJobStore, JobStore, RunState, ScheduleEntry, StoreError};

use super::handle::{COMMAND_CHANNEL_BUFFER, SchedulerHandle};
use super::types::{Admission, JobHandle, SchedulerCommand, SchedulerError, SchedulerState};

/// Smallest tick interval the clock loop accepts.
pub const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Main scheduler builder.
///
/// Configure the store, job registry, listeners and timing, then call
/// [`Scheduler::start`] to spawn the clock loop.
pub struct Scheduler {
    /// Store holding active entries.
    store: Arc<dyn JobStore>,
    /// Factories for every job type that may be scheduled.
    registry: JobRegistry,
    /// User listeners, run after the retry listener.
    listeners: Vec<Arc<dyn JobListener>>,
    /// Whether the stock retry listener is installed.
    retry_listener: bool,
    /// Event bus for emitting events.
    event_bus: Arc<EventBus>,
    /// Handlers registered on the bus at start.
    handlers: Vec<Arc<dyn EventHandler>>,
    clock: Arc<dyn Clock>,
    /// Tick interval for checking due entries.
    tick_interval: Duration,
    /// Graceful shutdown timeout (default: 30 seconds).
    shutdown_timeout: Duration,
}

impl Scheduler {
    /// Create a scheduler with an in-memory store and the system clock.
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryJobStore::new()),
            registry: JobRegistry::new(),
            listeners: Vec::new(),
            retry_listener: true,
            event_bus: Arc::new(EventBus::new()),
            handlers: Vec::new(),
            clock: Arc::new(SystemClock),
            tick_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    /// Create a scheduler with timing taken from `config`.
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new()
            .with_tick_interval(config.tick_interval())
            .with_shutdown_timeout(config.shutdown_timeout())
    }

    /// Set the store.
    pub fn with_store(self, store: impl JobStore + 'static) -> Self {
        self.with_shared_store(Arc::new(store))
    }

    /// Set a store shared with other owners (for testing).
    pub fn with_shared_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = store;
        self
    }

    /// Set the job registry.
    pub fn with_registry(mut self, registry: JobRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Append a listener to the pipeline.
    pub fn with_listener(mut self, listener: Arc<dyn JobListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Do not install the retry listener.
    pub fn without_retry_listener(mut self) -> Self {
        self.retry_listener = false;
        self
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Arc::new(event_bus);
        self
    }

    /// Register an event handler when the scheduler starts.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Set the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the tick interval. A zero interval is raised to
    /// [`MIN_TICK_INTERVAL`].
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        if interval < MIN_TICK_INTERVAL {
            tracing::warn!(
                requested = ?interval,
                using = ?MIN_TICK_INTERVAL,
                "Tick interval too small, clamping"
            );
        }
        self.tick_interval = interval.max(MIN_TICK_INTERVAL);
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Get the job registry.
    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Get the event bus.
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Start the scheduler and return a handle for controlling it.
    pub async fn start(self) -> (SchedulerHandle, JoinHandle<()>) {
        let mut pipeline = ListenerPipeline::new();
        if self.retry_listener {
            let retry = Arc::new(RetryListener::new());
            pipeline.push(retry.clone());
            self.event_bus.register(retry).await;
        }
        for listener in self.listeners {
            pipeline.push(listener);
        }
        for handler in self.handlers {
            self.event_bus.register(handler).await;
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let (admission_tx, admission_rx) = mpsc::unbounded_channel();

        tracing::info!(
            tick_interval = ?self.tick_interval,
            listeners = ?pipeline.names(),
            "Scheduler starting"
        );

        let core = Arc::new(SchedulerCore {
            store: self.store,
            registry: self.registry,
            pipeline,
            event_bus: self.event_bus,
            clock: self.clock,
            shutdown: CancellationToken::new(),
            shutdown_timeout: self.shutdown_timeout,
            state: RwLock::new(SchedulerState::Running),
            running: RwLock::new(HashMap::new()),
            command_tx,
            admission_tx,
        });

        let handle = SchedulerHandle {
            core: Arc::clone(&core),
        };
        let tick_interval = self.tick_interval;
        let scheduler_task = tokio::spawn(async move {
            core.run(command_rx, admission_rx, tick_interval).await;
        });

        (handle, scheduler_task)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by the clock loop, its handles and running executions.
pub(crate) struct SchedulerCore {
    pub(crate) store: Arc<dyn JobStore>,
    registry: JobRegistry,
    pipeline: ListenerPipeline,
    pub(crate) event_bus: Arc<EventBus>,
    pub(crate) clock: Arc<dyn Clock>,
    /// Root of every execution's cancellation token.
    pub(crate) shutdown: CancellationToken,
    shutdown_timeout: Duration,
    pub(crate) state: RwLock<SchedulerState>,
    /// Currently running executions mapped to (JobKey, Handle).
    #[allow(clippy::type_complexity)]
    pub(crate) running: RwLock<HashMap<RunId, (JobKey, JoinHandle<()>)>>,
    pub(crate) command_tx: mpsc::Sender<SchedulerCommand>,
    admission_tx: mpsc::UnboundedSender<Admission>,
}

impl SchedulerCore {
    pub(crate) async fn schedule(
        &self,
        descriptor: JobDescriptor,
        mut trigger: Trigger,
    ) -> Result<JobHandle, SchedulerError> {
        let key = descriptor.key().clone();
        if *self.state.read().await == SchedulerState::Stopped {
            return Err(SchedulerError::NotRunning);
        }
        descriptor
            .validate()
            .map_err(|e| SchedulerError::InvalidDescriptor {
                key: key.clone(),
                reason: e.to_string(),
            })?;
        if !self.registry.contains(descriptor.job_type()) {
            return Err(SchedulerError::UnknownJobType {
                key,
                job_type: descriptor.job_type().to_string(),
            });
        }

        let now = self.clock.now();
        let first = trigger
            .next_fire_time(None, now)
            .map_err(|source| SchedulerError::Trigger {
                key: key.clone(),
                source,
            })?;
        let Some(first) = first else {
            tracing::info!(job = %key, trigger = trigger.kind(), "Trigger never fires, nothing scheduled");
            return Ok(JobHandle {
                key,
                next_fire_time: None,
            });
        };

        let kind = trigger.kind();
        self.store
            .add(ScheduleEntry::new(descriptor, trigger, first))
            .await
            .map_err(|e| match e {
                StoreError::DuplicateKey(key) => SchedulerError::DuplicateKey(key),
                other => SchedulerError::Storage(other),
            })?;

        tracing::info!(job = %key, trigger = kind, next_fire_time = %first, "Job scheduled");
        self.event_bus
            .emit(Event::job_scheduled(key.clone(), first))
            .await;

        Ok(JobHandle {
            key,
            next_fire_time: Some(first),
        })
    }

    /// Remove `key` and every pending repeat derived from it.
    pub(crate) async fn unschedule(&self, key: &JobKey) -> Result<bool, SchedulerError> {
        let removed = self.remove_entry(key).await?;

        let repeats: Vec<JobKey> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|entry| entry.descriptor.origin() == Some(key))
            .map(|entry| entry.key)
            .collect();
        let mut repeats_removed = 0;
        for repeat in &repeats {
            if self.remove_entry(repeat).await? {
                repeats_removed += 1;
            }
        }

        if !removed && repeats_removed == 0 {
            tracing::debug!(job = %key, "Unschedule of unknown key ignored");
            return Ok(false);
        }
        if !removed {
            // The origin already finished; its retry state still has to go.
            self.event_bus.emit(Event::job_unscheduled(key.clone())).await;
        }
        if repeats_removed > 0 {
            tracing::info!(job = %key, repeats = repeats_removed, "Pending repeats unscheduled");
        }
        Ok(true)
    }

    async fn remove_entry(&self, key: &JobKey) -> Result<bool, SchedulerError> {
        let Some(entry) = self.store.remove(key).await? else {
            return Ok(false);
        };
        if let Some(gate) = entry.trigger.gate() {
            gate.withdraw(key);
        }

        tracing::info!(job = %key, run_state = ?entry.run_state, "Job unscheduled");
        self.event_bus.emit(Event::job_unscheduled(key.clone())).await;
        Ok(true)
    }

    /// Main scheduler loop.
    async fn run(
        self: Arc<Self>,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        mut admission_rx: mpsc::UnboundedReceiver<Admission>,
        tick_interval: Duration,
    ) {
        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if *self.state.read().await == SchedulerState::Running {
                        self.dispatch_due().await;
                    }

                    // Clean up finished execution handles
                    self.cleanup_finished_runs().await;
                }

                Some(admission) = admission_rx.recv() => {
                    self.admit(admission).await;
                }

                Some(command) = command_rx.recv() => {
                    match command {
                        SchedulerCommand::Pause { response } => {
                            *self.state.write().await = SchedulerState::Paused;
                            tracing::info!("Scheduler paused");
                            let _ = response.send(());
                        }
                        SchedulerCommand::Resume { response } => {
                            *self.state.write().await = SchedulerState::Running;
                            tracing::info!("Scheduler resumed");
                            let _ = response.send(());
                        }
                        SchedulerCommand::Shutdown { response } => {
                            *self.state.write().await = SchedulerState::Stopped;
                            tracing::info!("Scheduler shutting down, cancelling running jobs");
                            self.shutdown.cancel();

                            // Wait for running jobs to observe cancellation
                            self.await_running().await;

                            let _ = response.send(());
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Dispatch every entry due at the current clock reading.
    async fn dispatch_due(self: &Arc<Self>) {
        let now = self.clock.now();
        let due = match self.store.get_due(now).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "Failed to fetch due entries");
                return;
            }
        };
        if !due.is_empty() {
            tracing::debug!(count = due.len(), now = %now, "Dispatching due entries");
        }
        for entry in due {
            self.dispatch(entry).await;
        }
    }

    /// Start a due entry, or queue it on its gate when the gate is held.
    async fn dispatch(self: &Arc<Self>, mut entry: ScheduleEntry) {
        if let Some(gate) = entry.trigger.gate().cloned() {
            if !gate.try_acquire(&entry.key) {
                let key = entry.key.clone();
                entry.run_state = RunState::Deferred;
                match self.store.update(entry).await {
                    Ok(()) => {
                        tracing::debug!(job = %key, gate = gate.name(), "Gate busy, deferring job");
                        self.event_bus
                            .emit(Event::job_deferred(key, gate.name()))
                            .await;
                    }
                    Err(e) => {
                        gate.withdraw(&key);
                        tracing::warn!(job = %key, error = %e, "Failed to defer job");
                    }
                }
                return;
            }
        }
        self.start_run(entry).await;
    }

    /// Mark `entry` running and spawn its execution. The entry's gate, if
    /// any, must already be held for its key.
    async fn start_run(self: &Arc<Self>, mut entry: ScheduleEntry) {
        entry.run_state = RunState::Running;
        if let Err(e) = self.store.update(entry.clone()).await {
            tracing::warn!(job = %entry.key, error = %e, "Failed to mark job running");
            self.release_gate(&entry);
            return;
        }

        let run_id = RunId::new();
        let key = entry.key.clone();
        let core = Arc::clone(self);
        let task = tokio::spawn(core.execute_entry(entry, run_id.clone()));
        self.running.write().await.insert(run_id, (key, task));
    }

    /// Run one execution: build the job, run the listener pipeline around
    /// it, report the outcome and reschedule the entry.
    async fn execute_entry(self: Arc<Self>, mut entry: ScheduleEntry, run_id: RunId) {
        let key = entry.key.clone();
        let fire_time = entry.next_fire_time;
        let started = tokio::time::Instant::now();

        let result = match self.registry.create(&entry.descriptor) {
            Ok(job) => {
                let ctx = JobContext::new(
                    run_id.clone(),
                    entry.descriptor.clone(),
                    fire_time,
                    job,
                    entry.trigger.gate().cloned(),
                    self.shutdown.child_token(),
                    SchedulerHandle {
                        core: Arc::clone(&self),
                    },
                );
                tracing::info!(job = %key, run_id = %run_id, fire_time = %fire_time, "Job started");
                self.event_bus
                    .emit(Event::job_started(key.clone(), run_id.clone(), fire_time))
                    .await;

                // A panic in a listener or the job body ends only this task.
                let pipeline = self.pipeline.clone();
                match tokio::spawn(async move { pipeline.run(&ctx).await }).await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => Err(JobError::Panicked(e.to_string())),
                    Err(_) => Err(JobError::Cancelled),
                }
            }
            Err(e) => Err(e),
        };

        self.report(&key, &run_id, result, started.elapsed()).await;
        self.reschedule(&mut entry).await;
        self.release_gate(&entry);
    }

    async fn report(&self, key: &JobKey, run_id: &RunId, result: JobResult, duration: Duration) {
        match result {
            Ok(()) => {
                tracing::info!(job = %key, run_id = %run_id, duration = ?duration, "Job completed");
                self.event_bus
                    .emit(Event::job_completed(key.clone(), run_id.clone(), duration))
                    .await;
            }
            Err(JobError::RetryScheduled {
                attempt,
                retry_key,
                source,
            }) => {
                tracing::warn!(
                    job = %key,
                    run_id = %run_id,
                    attempt,
                    retry_key = %retry_key,
                    error = %source,
                    "Job failed, repeat scheduled"
                );
                self.event_bus
                    .emit(Event::retry_scheduled(
                        key.clone(),
                        run_id.clone(),
                        attempt,
                        retry_key,
                    ))
                    .await;
            }
            Err(JobError::RetryExhausted {
                key: origin,
                attempts,
                source,
            }) => {
                tracing::error!(
                    job = %key,
                    run_id = %run_id,
                    origin = %origin,
                    attempts,
                    error = %source,
                    "Job failed permanently, retries exhausted"
                );
                self.event_bus
                    .emit(Event::retry_exhausted(
                        key.clone(),
                        run_id.clone(),
                        origin,
                        attempts,
                        source.to_string(),
                    ))
                    .await;
            }
            Err(e) => {
                tracing::warn!(job = %key, run_id = %run_id, error = %e, "Job failed");
                self.event_bus
                    .emit(Event::job_failed(
                        key.clone(),
                        run_id.clone(),
                        e.to_string(),
                        duration,
                    ))
                    .await;
            }
        }
    }

    /// Ask the trigger for the next fire time and write the entry back.
    ///
    /// A missing entry means it was unscheduled while running; it stays gone.
    async fn reschedule(&self, entry: &mut ScheduleEntry) {
        let fire_time = entry.next_fire_time;
        entry.last_fire_time = Some(fire_time);

        let mut trigger_error = None;
        match entry.trigger.next_fire_time(Some(fire_time), self.clock.now()) {
            Ok(Some(next)) => {
                entry.next_fire_time = next;
                entry.run_state = RunState::Scheduled;
            }
            Ok(None) => {
                tracing::debug!(job = %entry.key, "Trigger exhausted, finishing entry");
                entry.run_state = RunState::Finished;
            }
            Err(e) => {
                tracing::error!(job = %entry.key, error = %e, "Trigger failed, finishing entry");
                entry.run_state = RunState::Finished;
                trigger_error = Some(e.to_string());
            }
        }

        match self.store.update(entry.clone()).await {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                tracing::debug!(job = %entry.key, "Entry unscheduled while running, not rescheduling");
            }
            Err(e) => {
                tracing::warn!(job = %entry.key, error = %e, "Failed to update entry after run");
            }
        }

        if let Some(error) = trigger_error {
            self.event_bus
                .emit(Event::trigger_failed(entry.key.clone(), error))
                .await;
        }
    }

    /// Start the deferred entry that was just handed its gate.
    async fn admit(self: &Arc<Self>, admission: Admission) {
        let Admission { gate, key } = admission;
        if *self.state.read().await != SchedulerState::Stopped {
            match self.store.get(&key).await {
                Ok(entry) if entry.run_state == RunState::Deferred => {
                    tracing::debug!(job = %key, gate = gate.name(), "Gate handed over, starting deferred job");
                    self.start_run(entry).await;
                    return;
                }
                Ok(_) | Err(StoreError::NotFound(_)) => {
                    tracing::debug!(job = %key, gate = gate.name(), "Gate handed to a key no longer waiting");
                }
                Err(e) => {
                    tracing::warn!(job = %key, error = %e, "Failed to load deferred job");
                }
            }
        }
        self.pass_gate(&gate, &key);
    }

    fn release_gate(&self, entry: &ScheduleEntry) {
        if let Some(gate) = entry.trigger.gate() {
            self.pass_gate(gate, &entry.key);
        }
    }

    /// Release `gate` for `key` and queue an admission for the next waiter.
    fn pass_gate(&self, gate: &Gate, key: &JobKey) {
        if let Some(next) = gate.release(key) {
            let admission = Admission {
                gate: gate.clone(),
                key: next,
            };
            if self.admission_tx.send(admission).is_err() {
                tracing::debug!(gate = gate.name(), "Scheduler stopped, gate hand-off dropped");
            }
        }
    }

    /// Clean up finished execution handles.
    async fn cleanup_finished_runs(&self) {
        let mut running = self.running.write().await;
        running.retain(|_, (_, handle)| !handle.is_finished());
    }

    /// Wait for all running executions to complete with a timeout.
    async fn await_running(&self) {
        let running_count = self.running.read().await.len();

        if running_count == 0 {
            tracing::info!("No running jobs to wait for during shutdown");
            return;
        }

        tracing::info!(
            "Graceful shutdown: waiting for {} running job(s) to complete (timeout: {:?})",
            running_count,
            self.shutdown_timeout
        );

        let start = tokio::time::Instant::now();
        let deadline = start + self.shutdown_timeout;

        loop {
            let mut running = self.running.write().await;
            running.retain(|_, (_, handle)| !handle.is_finished());
            let remaining = running.len();
            drop(running);

            if remaining == 0 {
                tracing::info!("All running jobs completed gracefully in {:?}", start.elapsed());
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                let keys: Vec<String> = self
                    .running
                    .read()
                    .await
                    .values()
                    .map(|(key, _)| key.to_string())
                    .collect();
                tracing::warn!(
                    jobs = ?keys,
                    "Graceful shutdown timeout ({:?}) exceeded with {} job(s) still running",
                    self.shutdown_timeout,
                    remaining
                );
                break;
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
