//! Common test utilities shared across integration tests.

use chrono::{DateTime, TimeZone, Utc};
use kairos::testing::{CountingJob, ExecutionLog, ExecutionRecord, RecordingHandler};
use kairos::{Event, JobRegistry, Scheduler, TokioClock};
use std::sync::Arc;
use std::time::Duration;

/// Wall time at which every test clock starts.
pub fn origin() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

/// Install a log subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A scheduler driven by tokio's (paused) clock, recording every event.
pub fn scheduler(registry: JobRegistry, events: &Arc<RecordingHandler>) -> Scheduler {
    init_tracing();
    Scheduler::new()
        .with_registry(registry)
        .with_clock(Arc::new(TokioClock::starting_at(origin())))
        .with_event_handler(events.clone())
}

/// Registry with a single job type.
pub fn registry(job_type: &str, job: CountingJob) -> JobRegistry {
    JobRegistry::new().with(job_type, job.factory())
}

/// Wait until `count` recorded events match `predicate`.
///
/// Polls every 10ms and panics once the timeout is reached.
pub async fn wait_for_events(
    events: &RecordingHandler,
    count: usize,
    timeout: Duration,
    predicate: impl Fn(&Event) -> bool,
) {
    let start = tokio::time::Instant::now();
    loop {
        let seen = events.count(&predicate).await;
        if seen >= count {
            return;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for {} matching events, saw {}: {:?}",
                count,
                seen,
                events.events().await
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Assert that no two executions in `log` overlap in time.
pub fn assert_no_overlap(log: &ExecutionLog) {
    let mut records: Vec<ExecutionRecord> = log.records();
    records.sort_by_key(|r| r.started);
    for pair in records.windows(2) {
        let finished = pair[0]
            .finished
            .unwrap_or_else(|| panic!("{} still running", pair[0].key));
        assert!(
            pair[1].started >= finished,
            "{} started before {} finished",
            pair[1].key,
            pair[0].key
        );
    }
}
