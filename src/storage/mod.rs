//! Storage abstraction for active schedule entries.
//!
//! The scheduler mutates entries only through the [`JobStore`] trait, which
//! serializes access so that at most one entry exists per [`JobKey`].

mod memory;

pub use memory::InMemoryJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::job::JobDescriptor;
use crate::core::trigger::Trigger;
use crate::core::types::{EntryId, JobKey};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An active entry already exists for the key.
    #[error("duplicate key: {0}")]
    DuplicateKey(JobKey),

    /// No matching entry exists.
    #[error("not found: {0}")]
    NotFound(JobKey),

    /// Store lock was poisoned.
    #[error("store lock poisoned")]
    LockPoisoned,
}

/// Lifecycle state of a schedule entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Waiting for its next fire time.
    Scheduled,
    /// Due, but queued on a held exclusion gate.
    Deferred,
    /// Currently executing.
    Running,
    /// The trigger is exhausted; the entry is removed on update.
    Finished,
}

/// An active (job, trigger) registration.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    /// Identity of this incarnation of the key.
    pub id: EntryId,
    pub key: JobKey,
    pub descriptor: JobDescriptor,
    /// Trigger state, written back after every firing.
    pub trigger: Trigger,
    /// When the entry fires next, or is firing when `Running`.
    pub next_fire_time: DateTime<Utc>,
    pub last_fire_time: Option<DateTime<Utc>>,
    pub run_state: RunState,
}

impl ScheduleEntry {
    /// Create a `Scheduled` entry for the descriptor's key.
    pub fn new(descriptor: JobDescriptor, trigger: Trigger, next_fire_time: DateTime<Utc>) -> Self {
        Self {
            id: EntryId::new(),
            key: descriptor.key().clone(),
            descriptor,
            trigger,
            next_fire_time,
            last_fire_time: None,
            run_state: RunState::Scheduled,
        }
    }

    /// Whether the clock loop should pick this entry up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.run_state == RunState::Scheduled && self.next_fire_time <= now
    }
}

/// Holds the set of active schedule entries.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Add a new entry. Fails with `DuplicateKey` if the key is active.
    async fn add(&self, entry: ScheduleEntry) -> Result<(), StoreError>;

    /// Remove the entry for `key`, returning it. Removing an absent key is a no-op.
    async fn remove(&self, key: &JobKey) -> Result<Option<ScheduleEntry>, StoreError>;

    /// Entries in `Scheduled` state due at or before `now`, ordered by fire
    /// time and then by key.
    async fn get_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>, StoreError>;

    /// Replace the stored entry with the same key and id.
    ///
    /// Fails with `NotFound` if the key is absent or now belongs to a newer
    /// entry. An entry updated to `Finished` is removed.
    async fn update(&self, entry: ScheduleEntry) -> Result<(), StoreError>;

    /// Get the entry for `key`.
    async fn get(&self, key: &JobKey) -> Result<ScheduleEntry, StoreError>;

    /// List all entries ordered by key.
    async fn list(&self) -> Result<Vec<ScheduleEntry>, StoreError>;
}
