//! In-memory store implementation.
//!
//! Volatile: entries do not survive a process restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use super::{JobStore, RunState, ScheduleEntry, StoreError};
use crate::core::types::JobKey;

/// In-memory job store.
///
/// Thread-safe map guarded by a RwLock; every mutation takes the write lock,
/// which keeps check-and-insert atomic.
pub struct InMemoryJobStore {
    entries: RwLock<HashMap<JobKey, ScheduleEntry>>,
}

impl InMemoryJobStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn add(&self, entry: ScheduleEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        if entries.contains_key(&entry.key) {
            return Err(StoreError::DuplicateKey(entry.key));
        }
        entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn remove(&self, key: &JobKey) -> Result<Option<ScheduleEntry>, StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        Ok(entries.remove(key))
    }

    async fn get_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut due: Vec<_> = entries
            .values()
            .filter(|e| e.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.next_fire_time
                .cmp(&b.next_fire_time)
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(due)
    }

    async fn update(&self, entry: ScheduleEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        match entries.get(&entry.key) {
            Some(current) if current.id == entry.id => {}
            _ => return Err(StoreError::NotFound(entry.key)),
        }
        if entry.run_state == RunState::Finished {
            entries.remove(&entry.key);
        } else {
            entries.insert(entry.key.clone(), entry);
        }
        Ok(())
    }

    async fn get(&self, key: &JobKey) -> Result<ScheduleEntry, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        entries
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn list(&self) -> Result<Vec<ScheduleEntry>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut result: Vec<_> = entries.values().cloned().collect();
        result.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(result)
    }
}
