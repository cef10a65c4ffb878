//! Mutual-exclusion gate shared by every trigger of one exclusion group.
//!
//! A [`Gate`] is created once by the caller and handed to each
//! [`Trigger::exclusive`](crate::core::trigger::Trigger::exclusive) of the
//! group. It records which key currently holds the group and a FIFO of keys
//! whose fire requests arrived while it was held.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::types::JobKey;

/// Shared handle to one exclusion group's state.
///
/// Clones refer to the same group.
#[derive(Clone)]
pub struct Gate {
    name: Arc<str>,
    state: Arc<Mutex<GateState>>,
}

#[derive(Debug, Default)]
struct GateState {
    holder: Option<JobKey>,
    waiters: VecDeque<JobKey>,
}

impl Gate {
    /// Create a new, free gate.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            state: Arc::new(Mutex::new(GateState::default())),
        }
    }

    /// Name of the exclusion group.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Try to take the gate for `key`.
    ///
    /// Returns `true` when the gate was free. Otherwise the request is queued
    /// (once per key) and `false` is returned; the key will later be handed
    /// the gate by [`Gate::release`].
    pub fn try_acquire(&self, key: &JobKey) -> bool {
        let mut state = self.lock();
        if state.holder.is_none() {
            state.holder = Some(key.clone());
            return true;
        }
        if !state.waiters.contains(key) {
            state.waiters.push_back(key.clone());
        }
        false
    }

    /// Release the gate held by `key`.
    ///
    /// The gate passes directly to the oldest waiter, which is returned. A
    /// release by a key that does not hold the gate changes nothing.
    pub fn release(&self, key: &JobKey) -> Option<JobKey> {
        let mut state = self.lock();
        if state.holder.as_ref() != Some(key) {
            return None;
        }
        state.holder = state.waiters.pop_front();
        state.holder.clone()
    }

    /// Drop a queued request for `key`. Returns whether one was queued.
    pub fn withdraw(&self, key: &JobKey) -> bool {
        let mut state = self.lock();
        let before = state.waiters.len();
        state.waiters.retain(|k| k != key);
        state.waiters.len() != before
    }

    /// Key currently holding the gate.
    pub fn holder(&self) -> Option<JobKey> {
        self.lock().holder.clone()
    }

    /// Keys waiting for the gate, oldest first.
    pub fn waiting(&self) -> Vec<JobKey> {
        self.lock().waiters.iter().cloned().collect()
    }

    pub fn is_held(&self) -> bool {
        self.lock().holder.is_some()
    }

    /// Whether both handles refer to the same group.
    pub fn same_group(&self, other: &Gate) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    // Gate state is updated in single assignments, so a poisoned lock still
    // holds a consistent value.
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Gate")
            .field("name", &self.name)
            .field("holder", &state.holder)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}
