//! Retry integration tests.
//!
//! Tests that verify failing retryable jobs are repeated a bounded number of
//! times through the retry listener, and that retry state is reset on
//! success and on unschedule.

use crate::common::{registry, scheduler, wait_for_events};
use kairos::testing::{CountingJob, ExecutionLog, RecordingHandler};
use kairos::{
    Event, FixedDelayRetry, Gate, JobDescriptor, JobKey, RetryProvider, SchedulerConfig, Trigger,
};
use std::sync::Arc;
use std::time::Duration;

fn provider(max_repeat_count: u32) -> Arc<FixedDelayRetry> {
    Arc::new(FixedDelayRetry::fixed(
        max_repeat_count,
        Duration::from_secs(1),
    ))
}

#[tokio::test(start_paused = true)]
async fn test_always_failing_job_runs_max_repeat_count_plus_one_times() {
    let log = ExecutionLog::new();
    let events = RecordingHandler::new();
    let retry = provider(3);
    let job = CountingJob::new(log.clone())
        .always_failing()
        .with_retry(retry.clone());
    let (handle, _task) = scheduler(registry("flaky", job), &events).start().await;

    handle
        .schedule(JobDescriptor::new("flaky", "flaky"), Trigger::once())
        .await
        .unwrap();
    wait_for_events(&events, 1, Duration::from_secs(30), |e| {
        matches!(e, Event::RetryExhausted { .. })
    })
    .await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(log.len(), 4);
    let keys: Vec<String> = log
        .records()
        .iter()
        .map(|r| r.key.name().to_string())
        .collect();
    assert_eq!(
        keys,
        vec!["flaky", "flaky#retry-1", "flaky#retry-2", "flaky#retry-3"]
    );

    assert_eq!(
        events
            .count(|e| matches!(e, Event::RetryScheduled { .. }))
            .await,
        3
    );
    let exhausted: Vec<_> = events
        .events()
        .await
        .into_iter()
        .filter_map(|e| match e {
            Event::RetryExhausted {
                key,
                origin,
                attempts,
                ..
            } => Some((key, origin, attempts)),
            _ => None,
        })
        .collect();
    assert_eq!(
        exhausted,
        vec![(
            JobKey::named("flaky#retry-3"),
            JobKey::named("flaky"),
            4
        )]
    );

    assert_eq!(retry.attempts(&JobKey::named("flaky")), 0);
    assert!(handle.list().await.unwrap().is_empty());
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_recovering_job_resets_retry_state() {
    let log = ExecutionLog::new();
    let events = RecordingHandler::new();
    let retry = provider(3);
    let job = CountingJob::new(log.clone())
        .failing_times(2)
        .with_retry(retry.clone());
    let (handle, _task) = scheduler(registry("flaky", job), &events).start().await;

    handle
        .schedule(JobDescriptor::new("sync", "flaky"), Trigger::once())
        .await
        .unwrap();
    wait_for_events(&events, 1, Duration::from_secs(30), |e| {
        matches!(e, Event::JobCompleted { .. })
    })
    .await;

    assert_eq!(log.len(), 3);
    assert_eq!(
        log.records().last().unwrap().key,
        JobKey::named("sync#retry-2")
    );
    assert_eq!(retry.attempts(&JobKey::named("sync")), 0);
    assert_eq!(
        events
            .count(|e| matches!(e, Event::RetryExhausted { .. }))
            .await,
        0
    );
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_job_without_provider_fails_once() {
    let log = ExecutionLog::new();
    let events = RecordingHandler::new();
    let job = CountingJob::new(log.clone()).always_failing();
    let (handle, _task) = scheduler(registry("fragile", job), &events).start().await;

    handle
        .schedule(JobDescriptor::new("fragile", "fragile"), Trigger::once())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(log.len(), 1);
    assert_eq!(
        events
            .count(|e| matches!(e, Event::JobFailed { .. }))
            .await,
        1
    );
    assert_eq!(
        events
            .count(|e| matches!(e, Event::RetryScheduled { .. }))
            .await,
        0
    );
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unscheduling_origin_resets_retry_state() {
    let log = ExecutionLog::new();
    let events = RecordingHandler::new();
    let retry = Arc::new(FixedDelayRetry::fixed(5, Duration::from_secs(10)));
    let job = CountingJob::new(log.clone())
        .always_failing()
        .with_retry(retry.clone());
    let (handle, _task) = scheduler(registry("flaky", job), &events).start().await;

    let key = JobKey::named("poller");
    handle
        .schedule(
            JobDescriptor::new(key.clone(), "flaky"),
            Trigger::every(Duration::from_secs(600)).unwrap(),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(retry.attempts(&key), 1);
    assert!(handle.get(&key.derive("retry-1")).await.unwrap().is_some());

    assert!(handle.unschedule(&key).await.unwrap());
    assert_eq!(retry.attempts(&key), 0);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unscheduling_origin_removes_pending_repeats() {
    let log = ExecutionLog::new();
    let events = RecordingHandler::new();
    let retry = Arc::new(FixedDelayRetry::fixed(5, Duration::from_secs(10)));
    let job = CountingJob::new(log.clone())
        .always_failing()
        .with_retry(retry.clone());
    let (handle, _task) = scheduler(registry("flaky", job), &events).start().await;

    let key = JobKey::named("poller");
    handle
        .schedule(
            JobDescriptor::new(key.clone(), "flaky"),
            Trigger::every(Duration::from_secs(600)).unwrap(),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    let repeat = key.derive("retry-1");
    assert!(handle.get(&repeat).await.unwrap().is_some());

    assert!(handle.unschedule(&key).await.unwrap());
    assert!(handle.get(&repeat).await.unwrap().is_none());
    tokio::time::sleep(Duration::from_secs(120)).await;

    let keys: Vec<String> = log
        .records()
        .iter()
        .map(|r| r.key.name().to_string())
        .collect();
    assert_eq!(keys, vec!["poller"]);
    assert!(handle.list().await.unwrap().is_empty());
    assert_eq!(retry.attempts(&key), 0);
    let unscheduled = events
        .count(|e| matches!(e, Event::JobUnscheduled { .. }))
        .await;
    assert_eq!(unscheduled, 2);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unscheduling_finished_one_shot_origin_stops_its_repeats() {
    let log = ExecutionLog::new();
    let events = RecordingHandler::new();
    let retry = Arc::new(FixedDelayRetry::fixed(5, Duration::from_secs(10)));
    let job = CountingJob::new(log.clone())
        .always_failing()
        .with_retry(retry.clone());
    let (handle, _task) = scheduler(registry("flaky", job), &events).start().await;

    let key = JobKey::named("import");
    handle
        .schedule(JobDescriptor::new(key.clone(), "flaky"), Trigger::once())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(handle.get(&key).await.unwrap().is_none());

    assert!(handle.unschedule(&key).await.unwrap());
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(log.len(), 1);
    assert_eq!(retry.attempts(&key), 0);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_repeat_unscheduled_while_running_is_not_repeated_again() {
    let log = ExecutionLog::new();
    let events = RecordingHandler::new();
    let retry = Arc::new(FixedDelayRetry::fixed(5, Duration::from_secs(1)));
    let job = CountingJob::new(log.clone())
        .sleeping(Duration::from_secs(5))
        .always_failing()
        .with_retry(retry.clone());
    let (handle, _task) = scheduler(registry("flaky", job), &events).start().await;

    let key = JobKey::named("export");
    handle
        .schedule(JobDescriptor::new(key.clone(), "flaky"), Trigger::once())
        .await
        .unwrap();

    // The first repeat is due one second after the first run fails.
    let repeat = key.derive("retry-1");
    tokio::time::sleep(Duration::from_secs(8)).await;
    assert_eq!(log.runs_of(&repeat).len(), 1);
    assert!(log.runs_of(&repeat)[0].finished.is_none());

    assert!(handle.unschedule(&key).await.unwrap());
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(log.len(), 2);
    assert!(handle.list().await.unwrap().is_empty());
    assert_eq!(retry.attempts(&key), 0);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_repeat_of_exclusive_job_inherits_gate() {
    let log = ExecutionLog::new();
    let events = RecordingHandler::new();
    let job = CountingJob::new(log.clone())
        .sleeping(Duration::from_secs(2))
        .failing_times(1)
        .with_retry(provider(2));
    let (handle, _task) = scheduler(registry("flaky", job), &events).start().await;
    let gate = Gate::new("api");

    handle
        .schedule(
            JobDescriptor::new("upload", "flaky"),
            Trigger::once().exclusive(&gate),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let repeat = JobKey::named("upload#retry-1");
    wait_for_events(&events, 1, Duration::from_secs(10), |e| {
        matches!(e, Event::RetryScheduled { .. })
    })
    .await;
    let entry = handle.get(&repeat).await.unwrap().unwrap();
    assert!(entry.trigger.gate().unwrap().same_group(&gate));

    wait_for_events(&events, 1, Duration::from_secs(30), |e| {
        matches!(e, Event::JobCompleted { .. })
    })
    .await;
    assert_eq!(log.runs_of(&repeat).len(), 1);
    crate::common::assert_no_overlap(&log);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_configured_retry_provider_drives_repeats() {
    let config = SchedulerConfig::from_yaml_str(
        "tick_interval_ms: 500\nretry:\n  max_repeat_count: 1\n  delay_secs: 2\n",
    )
    .unwrap();
    let retry: Arc<dyn RetryProvider> = Arc::new(config.retry_provider().unwrap());

    let log = ExecutionLog::new();
    let events = RecordingHandler::new();
    let job = CountingJob::new(log.clone())
        .always_failing()
        .with_retry(retry);
    let (handle, _task) = kairos::Scheduler::from_config(&config)
        .with_registry(registry("flaky", job))
        .with_clock(Arc::new(kairos::TokioClock::starting_at(
            crate::common::origin(),
        )))
        .with_event_handler(events.clone())
        .start()
        .await;

    handle
        .schedule(JobDescriptor::new("once", "flaky"), Trigger::once())
        .await
        .unwrap();
    wait_for_events(&events, 1, Duration::from_secs(30), |e| {
        matches!(e, Event::RetryExhausted { attempts: 2, .. })
    })
    .await;

    let runs = log.records();
    assert_eq!(runs.len(), 2);
    assert!(runs[1].started - runs[0].started >= Duration::from_secs(2));
    handle.shutdown().await.unwrap();
}
