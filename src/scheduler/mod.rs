//! Scheduler engine for job execution.
//!
//! This module provides the clock loop that fires schedule entries when they
//! are due, the handle used to control it, and the scheduler's types.

mod engine;
mod handle;
mod types;

pub use engine::{MIN_TICK_INTERVAL, Scheduler};
pub use handle::SchedulerHandle;
pub use types::{JobHandle, SchedulerError, SchedulerState};
