//! Before/after listeners wrapped around every job execution.
//!
//! Before-listeners form a blocking chain: the first error vetoes the job
//! body. After-listeners all run, in registration order, and each receives
//! the result produced by the previous one, so a listener may rewrite the
//! outcome (the retry listener turns a failure into a scheduled repeat).

mod retry;

pub use retry::RetryListener;

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::core::context::JobContext;
use crate::core::job::{JobError, JobResult};

/// Hook around job execution.
#[async_trait]
pub trait JobListener: Send + Sync {
    /// Name used in logs and veto errors.
    fn name(&self) -> &str;

    /// Called before the job body. An error prevents the body from running.
    async fn before_execution(
        &self,
        _ctx: &JobContext,
        _cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        Ok(())
    }

    /// Called after the job body (or veto) with the current result.
    async fn after_execution(
        &self,
        _ctx: &JobContext,
        result: JobResult,
        _cancel: &CancellationToken,
    ) -> JobResult {
        result
    }
}

/// Ordered set of listeners applied to every execution.
#[derive(Clone, Default)]
pub struct ListenerPipeline {
    listeners: Vec<Arc<dyn JobListener>>,
}

impl ListenerPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener.
    pub fn push(&mut self, listener: Arc<dyn JobListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Listener names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.listeners.iter().map(|l| l.name()).collect()
    }

    /// Run before-listeners, the job body and after-listeners.
    pub async fn run(&self, ctx: &JobContext) -> JobResult {
        let cancel = ctx.cancellation();
        let mut result = self.before(ctx, cancel).await;
        if result.is_ok() {
            result = ctx.job().execute(ctx, cancel).await;
        }
        for listener in &self.listeners {
            result = listener.after_execution(ctx, result, cancel).await;
        }
        result
    }

    async fn before(&self, ctx: &JobContext, cancel: &CancellationToken) -> JobResult {
        for listener in &self.listeners {
            if let Err(e) = listener.before_execution(ctx, cancel).await {
                tracing::warn!(
                    job = %ctx.key(),
                    listener = listener.name(),
                    error = %e,
                    "Listener vetoed execution"
                );
                return Err(JobError::Vetoed {
                    listener: listener.name().to_string(),
                    reason: e.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Traces every execution at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingListener;

#[async_trait]
impl JobListener for LoggingListener {
    fn name(&self) -> &str {
        "logging"
    }

    async fn before_execution(
        &self,
        ctx: &JobContext,
        _cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        tracing::debug!(
            job = %ctx.key(),
            run_id = %ctx.run_id(),
            fire_time = %ctx.fire_time(),
            "Executing job"
        );
        Ok(())
    }

    async fn after_execution(
        &self,
        ctx: &JobContext,
        result: JobResult,
        _cancel: &CancellationToken,
    ) -> JobResult {
        match &result {
            Ok(()) => tracing::debug!(job = %ctx.key(), run_id = %ctx.run_id(), "Job succeeded"),
            Err(e) => {
                tracing::debug!(job = %ctx.key(), run_id = %ctx.run_id(), error = %e, "Job failed")
            }
        }
        result
    }
}
