//! Configuration loading and parsing.
//!
//! Scheduler settings are read from YAML; every field has a default, so an
//! empty document is a valid configuration.

mod error;
mod types;

pub use error::ConfigError;
pub use types::{SchedulerConfig, WorkerQueueConfig};
