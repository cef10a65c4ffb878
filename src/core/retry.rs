//! Retry policy and the pluggable retry provider contract.
//!
//! Retries are opt-in per job: a [`Job`](super::job::Job) that returns a
//! [`RetryProvider`] has its retryable failures handed to
//! [`RetryProvider::schedule_repeat`] by the retry listener. The provider
//! tracks its own attempt counts and re-schedules the job itself.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::context::JobContext;
use super::job::{JobError, JobResult};
use super::trigger::Trigger;
use super::types::JobKey;

/// Bounded, fixed-delay retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of repeats after the initial failure (0 = no retries).
    /// `max_repeat_count = 3` allows 4 executions in total.
    pub max_repeat_count: u32,

    /// Delay between a failure and its repeat.
    #[serde(with = "serde_duration", rename = "delay_secs")]
    pub delay: Duration,
}

impl RetryPolicy {
    /// A policy that never repeats.
    pub fn none() -> Self {
        Self {
            max_repeat_count: 0,
            delay: Duration::ZERO,
        }
    }

    pub fn fixed(max_repeat_count: u32, delay: Duration) -> Self {
        Self {
            max_repeat_count,
            delay,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_repeat_count > 0
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Serializes a Duration as whole seconds.
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Per-job-type policy for re-executing failed jobs.
#[async_trait]
pub trait RetryProvider: Send + Sync {
    /// Upper bound on repeats after the initial failure.
    fn max_repeat_count(&self) -> u32;

    /// Handle a failed execution.
    ///
    /// Either schedules a repeat and returns [`JobError::RetryScheduled`], or
    /// returns a final error ([`JobError::RetryExhausted`] once the bound is
    /// exceeded).
    async fn schedule_repeat(
        &self,
        ctx: &JobContext,
        failure: JobError,
        cancel: &CancellationToken,
    ) -> JobResult;

    /// Forget attempt state for `key`, after a success or an unschedule.
    fn reset(&self, _key: &JobKey) {}
}

/// Outcome of recording one failure against a retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule repeat number `attempt`.
    Repeat { attempt: u32 },
    /// The budget is spent after `attempts` failed executions.
    Exhausted { attempts: u32 },
}

/// Stock provider: repeat as a one-shot after a fixed delay.
///
/// Repeats are scheduled under derived keys (`name#retry-N`, same group) so
/// they do not collide with the still-active failing entry. Attempts are
/// counted against the origin key, so a repeat that fails again draws from
/// the same budget.
#[derive(Debug, Default)]
pub struct FixedDelayRetry {
    policy: RetryPolicy,
    attempts: Mutex<HashMap<JobKey, u32>>,
}

impl FixedDelayRetry {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn fixed(max_repeat_count: u32, delay: Duration) -> Self {
        Self::new(RetryPolicy::fixed(max_repeat_count, delay))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Failures recorded for `key` since the last reset.
    pub fn attempts(&self, key: &JobKey) -> u32 {
        self.lock().get(key).copied().unwrap_or(0)
    }

    /// Count a failure for `key` and decide whether to repeat.
    ///
    /// Exhaustion clears the count so a later failure starts a fresh budget.
    pub fn record_failure(&self, key: &JobKey) -> RetryDecision {
        let mut attempts = self.lock();
        let count = attempts.entry(key.clone()).or_insert(0);
        *count += 1;
        let attempt = *count;
        if attempt > self.policy.max_repeat_count {
            attempts.remove(key);
            RetryDecision::Exhausted { attempts: attempt }
        } else {
            RetryDecision::Repeat { attempt }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobKey, u32>> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RetryProvider for FixedDelayRetry {
    fn max_repeat_count(&self) -> u32 {
        self.policy.max_repeat_count
    }

    async fn schedule_repeat(
        &self,
        ctx: &JobContext,
        failure: JobError,
        cancel: &CancellationToken,
    ) -> JobResult {
        let origin = ctx.origin_key().clone();
        if cancel.is_cancelled() {
            tracing::debug!(job = %origin, "Scheduler stopping, not scheduling repeat");
            return Err(failure);
        }

        let attempt = match self.record_failure(&origin) {
            RetryDecision::Repeat { attempt } => attempt,
            RetryDecision::Exhausted { attempts } => {
                return Err(JobError::RetryExhausted {
                    key: origin,
                    attempts,
                    source: Box::new(failure),
                });
            }
        };

        let retry_key = origin.derive(format!("retry-{}", attempt));
        let at = match chrono::Duration::from_std(self.policy.delay) {
            Ok(delay) => ctx.scheduler().now() + delay,
            Err(_) => ctx.scheduler().now(),
        };
        let mut trigger = Trigger::once_at(at);
        if let Some(gate) = ctx.gate() {
            trigger = trigger.exclusive(gate);
        }

        let descriptor = ctx.descriptor().repeat_as(retry_key.clone());
        match ctx.scheduler().schedule(descriptor, trigger).await {
            Ok(_) => {
                tracing::info!(
                    job = %origin,
                    retry_key = %retry_key,
                    attempt,
                    max_repeat_count = self.policy.max_repeat_count,
                    at = %at,
                    "Scheduled repeat after failure"
                );
                Err(JobError::RetryScheduled {
                    attempt,
                    retry_key,
                    source: Box::new(failure),
                })
            }
            Err(e) => {
                tracing::warn!(job = %origin, retry_key = %retry_key, error = %e, "Failed to schedule repeat");
                self.reset(&origin);
                Err(failure)
            }
        }
    }

    fn reset(&self, key: &JobKey) {
        self.lock().remove(key);
    }
}
