//! Off-clock execution support for I/O-bound job bodies.
//!
//! Jobs whose bodies call slow external services hand their work to a
//! [`WorkerQueue`] instead of holding their execution task open.

mod queue;

pub use queue::{BatchQueue, QueueError, QueueProcessor, WorkerQueue};
