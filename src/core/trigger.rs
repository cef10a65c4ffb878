//! Triggers decide when a schedule entry fires next.
//!
//! A trigger is consulted once when the entry is scheduled (with no previous
//! fire time) and again after every execution with the time the entry was
//! scheduled to fire. Cadence is therefore computed from scheduled times,
//! never from completion times.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use super::gate::Gate;
use super::schedule::{CronError, CronSchedule};

/// Errors raised while computing a fire time.
#[derive(Debug, Error)]
pub enum TriggerError {
    /// A recurring trigger with a zero interval would fire continuously.
    #[error("recurring interval must be greater than zero")]
    ZeroInterval,

    /// The next fire time is not representable.
    #[error("next fire time overflows: {last} + {interval:?}")]
    Overflow {
        last: DateTime<Utc>,
        interval: Duration,
    },

    #[error(transparent)]
    Cron(#[from] CronError),
}

/// Policy computing an entry's next fire time from its firing history.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Fires exactly once, at `at` or immediately when unset.
    OneShot {
        at: Option<DateTime<Utc>>,
        fired: bool,
    },

    /// Fires at a fixed cadence forever, starting immediately.
    Recurring { interval: Duration },

    /// Fires on every occurrence of a cron expression.
    Cron(CronSchedule),

    /// Delegates timing to `inner`, but only one entry of the gate's group may
    /// run at a time. Fire requests that find the gate held are queued on it.
    MutuallyExclusive { inner: Box<Trigger>, gate: Gate },
}

impl Trigger {
    /// One-shot trigger firing as soon as it is scheduled.
    pub fn once() -> Self {
        Trigger::OneShot {
            at: None,
            fired: false,
        }
    }

    /// One-shot trigger firing at a fixed instant.
    pub fn once_at(at: DateTime<Utc>) -> Self {
        Trigger::OneShot {
            at: Some(at),
            fired: false,
        }
    }

    /// Recurring trigger. Rejects a zero interval.
    pub fn every(interval: Duration) -> Result<Self, TriggerError> {
        if interval.is_zero() {
            return Err(TriggerError::ZeroInterval);
        }
        Ok(Trigger::Recurring { interval })
    }

    /// Cron trigger evaluated in UTC.
    pub fn cron(expression: &str) -> Result<Self, TriggerError> {
        Ok(Trigger::Cron(CronSchedule::new(expression)?))
    }

    /// Wrap this trigger so it runs exclusively within `gate`'s group.
    pub fn exclusive(self, gate: &Gate) -> Self {
        Trigger::MutuallyExclusive {
            inner: Box::new(self),
            gate: gate.clone(),
        }
    }

    /// The exclusion gate guarding this trigger, if any.
    pub fn gate(&self) -> Option<&Gate> {
        match self {
            Trigger::MutuallyExclusive { gate, .. } => Some(gate),
            _ => None,
        }
    }

    /// Short name of the variant, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::OneShot { .. } => "one_shot",
            Trigger::Recurring { .. } => "recurring",
            Trigger::Cron(_) => "cron",
            Trigger::MutuallyExclusive { .. } => "mutually_exclusive",
        }
    }

    /// Compute the next fire time.
    ///
    /// `last` is the time the entry was last scheduled to fire, `None` on the
    /// first call. `Ok(None)` means the trigger is exhausted.
    pub fn next_fire_time(
        &mut self,
        last: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, TriggerError> {
        match self {
            Trigger::OneShot { at, fired } => {
                if *fired {
                    return Ok(None);
                }
                *fired = true;
                Ok(Some(at.unwrap_or(now)))
            }
            Trigger::Recurring { interval } => {
                if interval.is_zero() {
                    return Err(TriggerError::ZeroInterval);
                }
                let Some(last) = last else {
                    return Ok(Some(now));
                };
                chrono::Duration::from_std(*interval)
                    .ok()
                    .and_then(|step| last.checked_add_signed(step))
                    .map(Some)
                    .ok_or(TriggerError::Overflow {
                        last,
                        interval: *interval,
                    })
            }
            Trigger::Cron(schedule) => Ok(schedule.next_after(last.unwrap_or(now))),
            Trigger::MutuallyExclusive { inner, .. } => inner.next_fire_time(last, now),
        }
    }
}
