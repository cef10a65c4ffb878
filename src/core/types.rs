//! Core identifier types for the scheduler.
//!
//! These types provide type-safe identifiers for schedule entries and executions.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Group used when a key is created without an explicit group.
pub const DEFAULT_GROUP: &str = "default";

/// Unique `(name, group)` identifier of a schedule entry.
///
/// At most one active entry may exist per key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobKey {
    group: String,
    name: String,
}

/// Unique identifier for a single execution of a schedule entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

/// Identity of one stored incarnation of a schedule entry.
///
/// Unscheduling a key and scheduling it again yields a different id, so a
/// stale execution can never overwrite the newer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryId(Uuid);

impl JobKey {
    /// Create a key in the given group.
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }

    /// Create a key in the default group.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_GROUP)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Derive a sibling key in the same group, e.g. `report#retry-1`.
    pub fn derive(&self, suffix: impl fmt::Display) -> Self {
        Self::new(format!("{}#{}", self.name, suffix), self.group.clone())
    }
}

impl From<&str> for JobKey {
    fn from(s: &str) -> Self {
        Self::named(s)
    }
}

impl From<String> for JobKey {
    fn from(s: String) -> Self {
        Self::named(s)
    }
}

impl RunId {
    /// Generate a new random RunId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
