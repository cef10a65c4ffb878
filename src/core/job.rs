//! Job definitions: the [`Job`] trait, typed job data and job construction.
//!
//! Jobs are instantiated fresh for every firing from a [`JobDescriptor`] by
//! the [`JobFactory`] registered for the descriptor's job type. Factories
//! pull their constructor arguments out of [`JobData`] by type.

use async_trait::async_trait;
use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::context::JobContext;
use super::retry::RetryProvider;
use super::types::JobKey;

/// Outcome of one execution as seen by listeners.
pub type JobResult = Result<(), JobError>;

/// Errors that can occur while constructing or executing a job.
#[derive(Debug, Error)]
pub enum JobError {
    /// The job body failed.
    #[error("job execution failed: {0}")]
    Execution(String),

    /// The job observed cancellation and stopped early.
    #[error("job cancelled")]
    Cancelled,

    /// The job body or a listener panicked.
    #[error("job panicked: {0}")]
    Panicked(String),

    /// No factory is registered for the descriptor's job type.
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    /// A factory could not bind its constructor arguments.
    #[error("failed to construct job: {0}")]
    Binding(#[from] JobDataError),

    /// A before-listener refused to let the job run.
    #[error("vetoed by listener '{listener}': {reason}")]
    Vetoed { listener: String, reason: String },

    /// The failure was handed to a retry provider, which scheduled a repeat.
    #[error("attempt {attempt} failed, repeat scheduled as {retry_key}: {source}")]
    RetryScheduled {
        attempt: u32,
        retry_key: JobKey,
        #[source]
        source: Box<JobError>,
    },

    /// The retry budget is spent; this failure is final.
    #[error("retries exhausted for {key} after {attempts} attempts: {source}")]
    RetryExhausted {
        key: JobKey,
        attempts: u32,
        #[source]
        source: Box<JobError>,
    },
}

impl JobError {
    /// Convenience constructor for body failures.
    pub fn execution(message: impl fmt::Display) -> Self {
        JobError::Execution(message.to_string())
    }

    /// Whether a retry provider may schedule a repeat for this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Execution(_) | JobError::Panicked(_))
    }
}

/// A unit of work run by the scheduler.
#[async_trait]
pub trait Job: Send + Sync {
    /// Run the job body.
    ///
    /// `cancel` is triggered when the scheduler stops. Bodies are expected
    /// to check it at their await points; they are never killed forcibly.
    async fn execute(&self, ctx: &JobContext, cancel: &CancellationToken) -> JobResult;

    /// Retry policy for failed executions. `None` disables retries.
    fn retry_provider(&self) -> Option<Arc<dyn RetryProvider>> {
        None
    }
}

/// Errors that can occur while binding job data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobDataError {
    #[error("no value bound for type {0}")]
    Missing(&'static str),

    #[error("more than one value bound for type {0}")]
    DuplicateType(&'static str),
}

#[derive(Clone)]
struct Binding {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

/// Values bound to a job, looked up by their type.
///
/// Each type may be bound at most once. A second binding of the same type is
/// recorded as a conflict and reported by [`JobData::validate`], so an
/// ambiguous descriptor is rejected when it is scheduled.
#[derive(Clone, Default)]
pub struct JobData {
    values: HashMap<TypeId, Binding>,
    conflicts: Vec<&'static str>,
}

impl JobData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a value, failing if its type is already bound.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Result<(), JobDataError> {
        let id = TypeId::of::<T>();
        if self.values.contains_key(&id) {
            return Err(JobDataError::DuplicateType(type_name::<T>()));
        }
        self.values.insert(
            id,
            Binding {
                type_name: type_name::<T>(),
                value: Arc::new(value),
            },
        );
        Ok(())
    }

    /// Builder form of [`JobData::insert`]; conflicts surface in `validate`.
    pub fn with<T: Any + Send + Sync>(mut self, value: T) -> Self {
        if let Err(JobDataError::DuplicateType(name)) = self.insert(value) {
            self.conflicts.push(name);
        }
        self
    }

    /// Look up the value bound for `T`.
    pub fn get<T: Any + Send + Sync>(&self) -> Result<Arc<T>, JobDataError> {
        let binding = self
            .values
            .get(&TypeId::of::<T>())
            .ok_or(JobDataError::Missing(type_name::<T>()))?;
        Arc::clone(&binding.value)
            .downcast::<T>()
            .map_err(|_| JobDataError::Missing(type_name::<T>()))
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.values.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Reject data that bound some type more than once.
    pub fn validate(&self) -> Result<(), JobDataError> {
        match self.conflicts.first() {
            Some(name) => Err(JobDataError::DuplicateType(name)),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for JobData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.values.values().map(|b| b.type_name).collect();
        types.sort_unstable();
        f.debug_struct("JobData")
            .field("types", &types)
            .field("conflicts", &self.conflicts)
            .finish()
    }
}

/// Everything needed to build a job instance for one schedule entry.
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    key: JobKey,
    job_type: String,
    data: JobData,
    origin: Option<JobKey>,
}

impl JobDescriptor {
    pub fn new(key: impl Into<JobKey>, job_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            job_type: job_type.into(),
            data: JobData::new(),
            origin: None,
        }
    }

    /// Bind a constructor argument by its type.
    pub fn with_value<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.data = self.data.with(value);
        self
    }

    /// Replace the bound data.
    pub fn with_data(mut self, data: JobData) -> Self {
        self.data = data;
        self
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn data(&self) -> &JobData {
        &self.data
    }

    /// Key of the entry this descriptor repeats, for retry entries.
    pub fn origin(&self) -> Option<&JobKey> {
        self.origin.as_ref()
    }

    /// Copy of this descriptor under `key` that repeats the same origin.
    pub fn repeat_as(&self, key: JobKey) -> Self {
        Self {
            origin: Some(self.origin.clone().unwrap_or_else(|| self.key.clone())),
            key,
            job_type: self.job_type.clone(),
            data: self.data.clone(),
        }
    }

    /// Check the descriptor can be bound unambiguously.
    pub fn validate(&self) -> Result<(), JobDataError> {
        self.data.validate()
    }
}

/// Builds job instances from bound data.
pub trait JobFactory: Send + Sync {
    fn create(&self, data: &JobData) -> Result<Arc<dyn Job>, JobError>;
}

struct FnFactory<F, J> {
    build: F,
    _job: PhantomData<fn() -> J>,
}

impl<F, J> JobFactory for FnFactory<F, J>
where
    F: Fn(&JobData) -> Result<J, JobError> + Send + Sync,
    J: Job + 'static,
{
    fn create(&self, data: &JobData) -> Result<Arc<dyn Job>, JobError> {
        let job: Arc<dyn Job> = Arc::new((self.build)(data)?);
        Ok(job)
    }
}

/// Maps job type names to their factories.
#[derive(Clone, Default)]
pub struct JobRegistry {
    factories: HashMap<String, Arc<dyn JobFactory>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure building jobs of `job_type`.
    pub fn register<J, F>(&mut self, job_type: impl Into<String>, build: F) -> &mut Self
    where
        J: Job + 'static,
        F: Fn(&JobData) -> Result<J, JobError> + Send + Sync + 'static,
    {
        self.register_factory(
            job_type,
            Arc::new(FnFactory {
                build,
                _job: PhantomData,
            }),
        )
    }

    /// Register a custom factory.
    pub fn register_factory(
        &mut self,
        job_type: impl Into<String>,
        factory: Arc<dyn JobFactory>,
    ) -> &mut Self {
        let job_type = job_type.into();
        if self.factories.insert(job_type.clone(), factory).is_some() {
            tracing::warn!(job_type = %job_type, "Replacing previously registered job factory");
        }
        self
    }

    /// Builder form of [`JobRegistry::register`].
    pub fn with<J, F>(mut self, job_type: impl Into<String>, build: F) -> Self
    where
        J: Job + 'static,
        F: Fn(&JobData) -> Result<J, JobError> + Send + Sync + 'static,
    {
        self.register(job_type, build);
        self
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.factories.contains_key(job_type)
    }

    /// Instantiate the job described by `descriptor`.
    pub fn create(&self, descriptor: &JobDescriptor) -> Result<Arc<dyn Job>, JobError> {
        let factory = self
            .factories
            .get(descriptor.job_type())
            .ok_or_else(|| JobError::UnknownJobType(descriptor.job_type().to_string()))?;
        factory.create(descriptor.data())
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.job_types().collect();
        types.sort_unstable();
        f.debug_struct("JobRegistry").field("job_types", &types).finish()
    }
}
