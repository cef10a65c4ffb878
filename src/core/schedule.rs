//! Cron expressions for calendar-driven triggers.
//!
//! Accepts standard 5-field cron, 6-field cron with a leading seconds field,
//! and the `@yearly`/`@monthly`/`@weekly`/`@daily`/`@hourly` shortcuts.
//! Occurrences are evaluated in the schedule's timezone.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while parsing or evaluating a cron schedule.
#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
}

/// A parsed cron schedule bound to a timezone.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    timezone: Tz,
    schedule: Box<Schedule>,
}

impl CronSchedule {
    /// Parse an expression evaluated in UTC.
    pub fn new(expression: impl Into<String>) -> Result<Self, CronError> {
        Self::parse(expression.into(), Tz::UTC)
    }

    /// Parse an expression evaluated in the named IANA timezone.
    pub fn with_timezone(
        expression: impl Into<String>,
        timezone: &str,
    ) -> Result<Self, CronError> {
        let tz = timezone
            .parse::<Tz>()
            .map_err(|_| CronError::InvalidTimezone(timezone.to_string()))?;
        Self::parse(expression.into(), tz)
    }

    fn parse(expression: String, timezone: Tz) -> Result<Self, CronError> {
        let normalized = normalize(&expression)?;
        let schedule =
            Schedule::from_str(&normalized).map_err(|e| CronError::InvalidExpression {
                expression: expression.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            expression,
            timezone,
            schedule: Box::new(schedule),
        })
    }

    /// First occurrence strictly after `after`, or `None` if the schedule is exhausted.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.timezone);
        self.schedule
            .after(&local)
            .next()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// The expression as written by the caller.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }
}

/// Expand shortcuts and add the seconds field the `cron` crate expects.
fn normalize(expression: &str) -> Result<String, CronError> {
    let trimmed = expression.trim();
    let expanded = match trimmed.to_lowercase().as_str() {
        "@yearly" | "@annually" => "0 0 1 1 *",
        "@monthly" => "0 0 1 * *",
        "@weekly" => "0 0 * * SUN",
        "@daily" | "@midnight" => "0 0 * * *",
        "@hourly" => "0 * * * *",
        s if s.starts_with('@') => {
            return Err(CronError::InvalidExpression {
                expression: expression.to_string(),
                reason: "unknown shortcut".to_string(),
            });
        }
        _ => trimmed,
    };

    match expanded.split_whitespace().count() {
        5 => Ok(format!("0 {}", expanded)),
        6 => Ok(expanded.to_string()),
        n => Err(CronError::InvalidExpression {
            expression: expression.to_string(),
            reason: format!("expected 5 or 6 fields, got {}", n),
        }),
    }
}
