//! When a task runs next: once, after a fixed delay, or on a cron expression.
//!
//! The cron side is a black box to the rest of the crate: given a schedule, its
//! options and a reference time, it answers with the delay until the next fire
//! (or says the schedule has no fires left).

use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("invalid timezone offset '{0}' (expected e.g. +02:00 or UTC)")]
    InvalidTimezone(String),
}

/// How a task repeats.
///
/// Wire form: `0` (or absent) for `Once`, a positive integer for `Delay`,
/// a string for `Cron`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Schedule {
    /// Run once, immediately.
    #[default]
    Once,

    /// Fixed delay in milliseconds between runs.
    Delay(u64),

    /// Cron expression (5 or 6 fields; 5-field expressions get a `0` seconds field).
    Cron(String),
}

/// Answer of the schedule black box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextRun {
    /// Run after this many milliseconds.
    In(u64),

    /// No fire time left (past `endDate`).
    Exhausted,
}

/// Bounds and timezone for cron evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScheduleOptions {
    /// Evaluate in UTC when no `tz` is given. `false` means local time.
    pub utc: bool,

    /// Fixed offset such as `+02:00`, or `UTC`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            utc: true,
            tz: None,
            start_date: None,
            end_date: None,
        }
    }
}

impl ScheduleOptions {
    fn offset(&self) -> Result<FixedOffset, ScheduleError> {
        if let Some(tz) = &self.tz {
            let trimmed = tz.trim();
            if trimmed.eq_ignore_ascii_case("utc") || trimmed == "Z" {
                return Ok(Utc.fix());
            }
            return FixedOffset::from_str(trimmed)
                .map_err(|_| ScheduleError::InvalidTimezone(tz.clone()));
        }
        if self.utc {
            Ok(Utc.fix())
        } else {
            Ok(*chrono::Local::now().offset())
        }
    }
}

impl Schedule {
    pub fn is_once(&self) -> bool {
        matches!(self, Schedule::Once)
    }

    /// Check cron syntax (and nothing else) up front.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            Schedule::Cron(expression) => parse_cron(expression).map(|_| ()),
            Schedule::Once | Schedule::Delay(_) => Ok(()),
        }
    }

    /// Delay until the next run, seen from `now`.
    pub fn next_run(
        &self,
        options: &ScheduleOptions,
        now: DateTime<Utc>,
    ) -> Result<NextRun, ScheduleError> {
        match self {
            Schedule::Once => Ok(NextRun::In(0)),
            Schedule::Delay(ms) => Ok(NextRun::In(*ms)),
            Schedule::Cron(expression) => {
                let Some(next) = next_cron_fire(expression, options, now)? else {
                    return Ok(NextRun::Exhausted);
                };
                let ms = (next - now).num_milliseconds().max(0) as u64;
                Ok(NextRun::In(ms))
            }
        }
    }
}

fn parse_cron(expression: &str) -> Result<cron::Schedule, ScheduleError> {
    let fields = expression.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {}", expression.trim())
    } else {
        expression.trim().to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

fn next_cron_fire(
    expression: &str,
    options: &ScheduleOptions,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let schedule = parse_cron(expression)?;
    let offset = options.offset()?;
    let reference = match options.start_date {
        Some(start) if start > now => start,
        _ => now,
    };

    let next = schedule
        .after(&reference.with_timezone(&offset))
        .next()
        .map(|fire| fire.with_timezone(&Utc));

    Ok(match (next, options.end_date) {
        (Some(fire), Some(end)) if fire > end => None,
        (next, _) => next,
    })
}

impl Serialize for Schedule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Schedule::Once => serializer.serialize_u64(0),
            Schedule::Delay(ms) => serializer.serialize_u64(*ms),
            Schedule::Cron(expression) => serializer.serialize_str(expression),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSchedule {
    Millis(u64),
    Fractional(f64),
    Expression(String),
}

impl<'de> Deserialize<'de> for Schedule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<RawSchedule>::deserialize(deserializer)?;
        Ok(match raw {
            None | Some(RawSchedule::Millis(0)) => Schedule::Once,
            Some(RawSchedule::Millis(ms)) => Schedule::Delay(ms),
            Some(RawSchedule::Fractional(ms)) if ms <= 0.0 => Schedule::Once,
            Some(RawSchedule::Fractional(ms)) => Schedule::Delay(ms.round() as u64),
            Some(RawSchedule::Expression(expression)) if expression.trim().is_empty() => {
                Schedule::Once
            }
            Some(RawSchedule::Expression(expression)) => Schedule::Cron(expression),
        })
    }
}
