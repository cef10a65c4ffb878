//! Entry lifecycle integration tests.
//!
//! Tests that verify firing cadence, unscheduling of running entries,
//! duplicate keys, shutdown, failure isolation and trigger errors.

use crate::common::{registry, scheduler, wait_for_events};
use async_trait::async_trait;
use kairos::testing::{CountingJob, ExecutionLog, RecordingHandler};
use kairos::{
    Event, Job, JobContext, JobData, JobDescriptor, JobError, JobKey, JobListener, JobRegistry,
    JobResult, LoggingListener, SchedulerError, Trigger,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn test_recurring_entry_fires_four_times_in_35_seconds() {
    let log = ExecutionLog::new();
    let events = RecordingHandler::new();
    let (handle, _task) = scheduler(registry("tick", CountingJob::new(log.clone())), &events)
        .start()
        .await;

    let scheduled = handle
        .schedule(
            JobDescriptor::new("heartbeat", "tick"),
            Trigger::every(Duration::from_secs(10)).unwrap(),
        )
        .await
        .unwrap();
    assert!(scheduled.is_scheduled());

    tokio::time::sleep(Duration::from_secs(35)).await;

    let runs = log.runs_of(&JobKey::named("heartbeat"));
    assert_eq!(runs.len(), 4);
    // Later firings land exactly on the cadence; the first depends on the
    // first tick.
    for pair in runs[1..].windows(2) {
        assert_eq!(pair[1].started - pair[0].started, Duration::from_secs(10));
    }

    let entry = handle
        .get(&JobKey::named("heartbeat"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        entry.next_fire_time - scheduled.next_fire_time.unwrap(),
        chrono::Duration::seconds(40)
    );
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unscheduling_running_entry_lets_it_finish_without_refiring() {
    let log = ExecutionLog::new();
    let events = RecordingHandler::new();
    let job = CountingJob::new(log.clone()).sleeping(Duration::from_secs(5));
    let (handle, _task) = scheduler(registry("slow", job), &events).start().await;

    let key = JobKey::named("report");
    handle
        .schedule(
            JobDescriptor::new(key.clone(), "slow"),
            Trigger::every(Duration::from_secs(10)).unwrap(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(handle.running_count().await, 1);
    assert!(handle.unschedule(&key).await.unwrap());
    assert!(handle.get(&key).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_secs(40)).await;

    let runs = log.runs_of(&key);
    assert_eq!(runs.len(), 1);
    assert!(runs[0].finished.is_some());
    assert_eq!(
        events
            .count(|e| matches!(e, Event::JobCompleted { .. }))
            .await,
        1
    );
    assert!(handle.list().await.unwrap().is_empty());
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_key_rejected_until_entry_finishes() {
    let log = ExecutionLog::new();
    let events = RecordingHandler::new();
    let (handle, _task) = scheduler(registry("noop", CountingJob::new(log.clone())), &events)
        .start()
        .await;
    let later = handle.now() + chrono::Duration::seconds(5);

    handle
        .schedule(JobDescriptor::new("sync", "noop"), Trigger::once_at(later))
        .await
        .unwrap();
    let duplicate = handle
        .schedule(JobDescriptor::new("sync", "noop"), Trigger::once())
        .await;
    assert!(matches!(duplicate, Err(SchedulerError::DuplicateKey(_))));

    // Same name in another group is a different key.
    handle
        .schedule(
            JobDescriptor::new(JobKey::new("sync", "nightly"), "noop"),
            Trigger::once_at(later),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(log.len(), 2);

    handle
        .schedule(JobDescriptor::new("sync", "noop"), Trigger::once())
        .await
        .unwrap();
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_running_jobs() {
    let log = ExecutionLog::new();
    let events = RecordingHandler::new();
    let job = CountingJob::new(log.clone()).sleeping(Duration::from_secs(3600));
    let (handle, task) = scheduler(registry("long", job), &events).start().await;

    handle
        .schedule(JobDescriptor::new("backup", "long"), Trigger::once())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(handle.running_count().await, 1);

    let started = tokio::time::Instant::now();
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(handle.running_count().await, 0);
    let cancelled = events
        .count(|e| matches!(e, Event::JobFailed { error, .. } if error.contains("cancelled")))
        .await;
    assert_eq!(cancelled, 1);
    assert!(handle.cancellation().is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_panicking_job_does_not_stop_other_jobs() {
    let log = ExecutionLog::new();
    let events = RecordingHandler::new();
    let registry = JobRegistry::new()
        .with("steady", CountingJob::new(log.clone()).factory())
        .with("boom", CountingJob::new(log.clone()).panicking().factory());
    let (handle, _task) = scheduler(registry, &events).start().await;

    handle
        .schedule(
            JobDescriptor::new("steady", "steady"),
            Trigger::every(Duration::from_secs(2)).unwrap(),
        )
        .await
        .unwrap();
    handle
        .schedule(
            JobDescriptor::new("boom", "boom"),
            Trigger::every(Duration::from_secs(4)).unwrap(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(9)).await;

    assert_eq!(log.runs_of(&JobKey::named("steady")).len(), 5);
    assert_eq!(log.runs_of(&JobKey::named("boom")).len(), 3);
    let panics = events
        .count(|e| matches!(e, Event::JobFailed { error, .. } if error.contains("panicked")))
        .await;
    assert_eq!(panics, 3);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_trigger_error_finalizes_entry_and_is_reported() {
    let log = ExecutionLog::new();
    let events = RecordingHandler::new();
    let (handle, _task) = scheduler(registry("noop", CountingJob::new(log.clone())), &events)
        .start()
        .await;

    // The first fire time is "now"; adding the interval afterwards overflows.
    let key = JobKey::named("overflow");
    handle
        .schedule(
            JobDescriptor::new(key.clone(), "noop"),
            Trigger::every(Duration::from_secs(u64::MAX)).unwrap(),
        )
        .await
        .unwrap();

    wait_for_events(&events, 1, Duration::from_secs(5), |e| {
        matches!(e, Event::TriggerFailed { .. })
    })
    .await;

    assert_eq!(log.len(), 1);
    assert!(handle.get(&key).await.unwrap().is_none());
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(log.len(), 1);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cron_trigger_fires_on_schedule() {
    let log = ExecutionLog::new();
    let events = RecordingHandler::new();
    let (handle, _task) = scheduler(registry("noop", CountingJob::new(log.clone())), &events)
        .start()
        .await;

    let scheduled = handle
        .schedule(
            JobDescriptor::new("every-five", "noop"),
            Trigger::cron("*/5 * * * * *").unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        scheduled.next_fire_time.unwrap() - handle.now(),
        chrono::Duration::seconds(5)
    );

    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(log.len(), 2);
    handle.shutdown().await.unwrap();
}

/// Before-listener that refuses every execution.
struct Maintenance;

#[async_trait]
impl JobListener for Maintenance {
    fn name(&self) -> &str {
        "maintenance"
    }

    async fn before_execution(
        &self,
        _ctx: &JobContext,
        _cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        Err(JobError::execution("maintenance window"))
    }
}

#[tokio::test(start_paused = true)]
async fn test_before_listener_vetoes_job_body() {
    let log = ExecutionLog::new();
    let events = RecordingHandler::new();
    let (handle, _task) = scheduler(registry("noop", CountingJob::new(log.clone())), &events)
        .with_listener(Arc::new(LoggingListener))
        .with_listener(Arc::new(Maintenance))
        .start()
        .await;

    handle
        .schedule(JobDescriptor::new("blocked", "noop"), Trigger::once())
        .await
        .unwrap();
    wait_for_events(&events, 1, Duration::from_secs(5), |e| {
        matches!(e, Event::JobFailed { error, .. } if error.contains("maintenance"))
    })
    .await;

    assert!(log.is_empty());
    handle.shutdown().await.unwrap();
}

#[derive(Debug, PartialEq)]
struct ChannelId(u64);

struct Announce {
    channel: Arc<ChannelId>,
    message: Arc<String>,
    sent: Arc<Mutex<Vec<(u64, String)>>>,
}

#[async_trait]
impl Job for Announce {
    async fn execute(&self, _ctx: &JobContext, _cancel: &CancellationToken) -> JobResult {
        self.sent
            .lock()
            .unwrap()
            .push((self.channel.0, self.message.as_ref().clone()));
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_job_is_built_from_typed_descriptor_values() {
    let events = RecordingHandler::new();
    let sent = Arc::new(Mutex::new(Vec::new()));
    let outbox = sent.clone();
    let registry = JobRegistry::new().with("announce", move |data: &JobData| {
        Ok(Announce {
            channel: data.get::<ChannelId>()?,
            message: data.get::<String>()?,
            sent: outbox.clone(),
        })
    });
    let (handle, _task) = scheduler(registry, &events).start().await;

    handle
        .schedule(
            JobDescriptor::new("welcome", "announce")
                .with_value(ChannelId(42))
                .with_value("hello".to_string()),
            Trigger::once(),
        )
        .await
        .unwrap();
    wait_for_events(&events, 1, Duration::from_secs(5), |e| {
        matches!(e, Event::JobCompleted { .. })
    })
    .await;

    assert_eq!(*sent.lock().unwrap(), vec![(42, "hello".to_string())]);
    handle.shutdown().await.unwrap();
}
