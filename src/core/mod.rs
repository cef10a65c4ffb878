//! Core scheduling types: identifiers, triggers, jobs and retry policy.

pub mod clock;
pub mod context;
pub mod gate;
pub mod job;
pub mod retry;
pub mod schedule;
pub mod trigger;
pub mod types;
