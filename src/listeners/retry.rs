//! After-listener delegating failures to the job's retry provider.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

use super::JobListener;
use crate::core::context::JobContext;
use crate::core::job::{JobError, JobResult};
use crate::core::retry::RetryProvider;
use crate::core::types::JobKey;
use crate::events::{Event, EventHandler};

/// Routes retryable failures to [`RetryProvider::schedule_repeat`].
///
/// Successful executions reset the provider's state for the origin key. The
/// listener also remembers which provider holds state for which key, so that
/// unscheduling the key resets it as well (it is registered on the event bus
/// for that purpose).
#[derive(Default)]
pub struct RetryListener {
    pending: Mutex<HashMap<JobKey, Arc<dyn RetryProvider>>>,
}

impl RetryListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys with retry state outstanding.
    pub fn pending_keys(&self) -> Vec<JobKey> {
        let mut keys: Vec<_> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobKey, Arc<dyn RetryProvider>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl JobListener for RetryListener {
    fn name(&self) -> &str {
        "retry"
    }

    async fn after_execution(
        &self,
        ctx: &JobContext,
        result: JobResult,
        cancel: &CancellationToken,
    ) -> JobResult {
        let Some(provider) = ctx.job().retry_provider() else {
            return result;
        };
        let origin = ctx.origin_key().clone();

        match result {
            Ok(()) => {
                if self.lock().remove(&origin).is_some() {
                    tracing::debug!(job = %origin, "Job recovered, resetting retry state");
                }
                provider.reset(&origin);
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                // Unscheduled while running: no further repeats.
                if matches!(ctx.scheduler().get(ctx.key()).await, Ok(None)) {
                    tracing::debug!(job = %ctx.key(), "Entry unscheduled during execution, not repeating");
                    self.lock().remove(&origin);
                    provider.reset(&origin);
                    return Err(e);
                }
                self.lock().insert(origin.clone(), Arc::clone(&provider));
                let outcome = provider.schedule_repeat(ctx, e, cancel).await;
                if !matches!(outcome, Err(JobError::RetryScheduled { .. })) {
                    self.lock().remove(&origin);
                }
                outcome
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl EventHandler for RetryListener {
    async fn handle(&self, event: &Event) {
        if let Event::JobUnscheduled { key, .. } = event {
            let provider = self.lock().remove(key);
            if let Some(provider) = provider {
                tracing::debug!(job = %key, "Job unscheduled, resetting retry state");
                provider.reset(key);
            }
        }
    }
}
