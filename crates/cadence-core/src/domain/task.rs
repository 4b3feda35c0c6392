//! Task record: the unit of schedulable work, its state machine and wire form.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::backoff::BackoffPolicy;
use super::error_record::{ErrorRecord, HandlerError, PARSE_ERROR_CODE};
use super::ids::TaskId;
use super::limit::Limit;
use super::schedule::{NextRun, Schedule, ScheduleError, ScheduleOptions};
use super::state::{Stage, TaskStatus};
use crate::error::CadenceError;

pub const DEFAULT_QUEUE: &str = "tasks";
pub const DEFAULT_KEY_PREFIX: &str = "tasks";
pub const DEFAULT_MAX_RUNS: u32 = 1;
pub const DEFAULT_MAX_TRIES: u32 = 4;
pub const DEFAULT_MAX_ERRORS_LENGTH: usize = 20;

/// Defaults applied to records that don't say otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefaults {
    pub key_prefix: String,
    pub queue: String,
    pub max_runs: Limit,
    pub max_tries: Limit,
    pub max_errors_length: usize,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            queue: DEFAULT_QUEUE.to_string(),
            max_runs: Limit::Bounded(DEFAULT_MAX_RUNS),
            max_tries: Limit::Bounded(DEFAULT_MAX_TRIES),
            max_errors_length: DEFAULT_MAX_ERRORS_LENGTH,
        }
    }
}

/// A task and everything the lifecycle knows about it.
///
/// Design:
/// - `status` only moves through `update_state`.
/// - `id` is set once; `key()` and `ttl_key()` derive from it.
/// - Only the fields of `TaskWire` ever reach storage.
/// - `ttl_override` and `execution_start` live in memory only.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    id: Option<TaskId>,
    key_prefix: String,

    pub queue: String,
    pub data: serde_json::Value,
    pub schedule: Schedule,
    pub schedule_options: ScheduleOptions,
    pub max_runs: Limit,
    pub max_tries: Limit,

    pub(crate) status: Option<TaskStatus>,

    /// Last resolved TTL in milliseconds.
    pub(crate) expire: u64,
    pub(crate) ttl_override: Option<u64>,

    pub(crate) runs: u32,
    pub(crate) error_count: u32,
    pub(crate) total_errors: u32,

    max_errors_length: usize,
    errors: VecDeque<ErrorRecord>,

    /// Epoch milliseconds.
    first_run: Option<i64>,
    last_run: Option<i64>,
    execution_start: Option<i64>,
    execution_time: Option<u64>,
    execution_average: Option<f64>,
}

impl Default for TaskRecord {
    fn default() -> Self {
        Self::with_defaults(&TaskDefaults::default())
    }
}

impl TaskRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(defaults: &TaskDefaults) -> Self {
        Self {
            id: None,
            key_prefix: defaults.key_prefix.clone(),
            queue: defaults.queue.clone(),
            data: serde_json::Value::Null,
            schedule: Schedule::Once,
            schedule_options: ScheduleOptions::default(),
            max_runs: defaults.max_runs,
            max_tries: defaults.max_tries,
            status: None,
            expire: 0,
            ttl_override: None,
            runs: 0,
            error_count: 0,
            total_errors: 0,
            max_errors_length: defaults.max_errors_length,
            errors: VecDeque::new(),
            first_run: None,
            last_run: None,
            execution_start: None,
            execution_time: None,
            execution_average: None,
        }
    }

    // ----- builders -----

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_schedule_options(mut self, options: ScheduleOptions) -> Self {
        self.schedule_options = options;
        self
    }

    pub fn with_max_runs(mut self, max_runs: impl Into<Limit>) -> Self {
        self.max_runs = max_runs.into();
        self
    }

    pub fn with_max_tries(mut self, max_tries: impl Into<Limit>) -> Self {
        self.max_tries = max_tries.into();
        self
    }

    /// Records always live under the coordinator's prefix; it stamps it on submit.
    pub(crate) fn set_key_prefix(&mut self, prefix: &str) {
        if self.key_prefix != prefix {
            self.key_prefix = prefix.to_string();
        }
    }

    pub fn with_max_errors_length(mut self, max: usize) -> Self {
        self.max_errors_length = max;
        self.trim_errors();
        self
    }

    // ----- identity -----

    pub fn id(&self) -> Option<&TaskId> {
        self.id.as_ref()
    }

    /// Assign the id. Re-assigning the same id is a no-op; a different one is refused.
    pub fn set_id(&mut self, id: impl Into<TaskId>) -> Result<(), CadenceError> {
        let id = id.into();
        match &self.id {
            Some(current) if *current != id => Err(CadenceError::IdConflict {
                current: current.to_string(),
                requested: id.to_string(),
            }),
            _ => {
                self.id = Some(id);
                Ok(())
            }
        }
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// `<keyPrefix>:<id>`, where the serialized record lives.
    pub fn key(&self) -> Option<String> {
        self.id
            .as_ref()
            .map(|id| format!("{}:{}", self.key_prefix, id))
    }

    /// `<key>:ttl`, the expiring trigger pointing back at `key()`.
    pub fn ttl_key(&self) -> Option<String> {
        self.key().map(|key| format!("{key}:ttl"))
    }

    // ----- read-only views -----

    pub fn status(&self) -> Option<TaskStatus> {
        self.status
    }

    pub fn runs(&self) -> u32 {
        self.runs
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn total_errors(&self) -> u32 {
        self.total_errors
    }

    pub fn errors(&self) -> &VecDeque<ErrorRecord> {
        &self.errors
    }

    pub fn max_errors_length(&self) -> usize {
        self.max_errors_length
    }

    pub fn expire(&self) -> u64 {
        self.expire
    }

    pub fn first_run(&self) -> Option<i64> {
        self.first_run
    }

    pub fn last_run(&self) -> Option<i64> {
        self.last_run
    }

    pub fn execution_time(&self) -> Option<u64> {
        self.execution_time
    }

    pub fn execution_average(&self) -> Option<f64> {
        self.execution_average
    }

    // ----- TTL -----

    /// Force the next TTL (milliseconds), bypassing the schedule.
    pub fn set_ttl(&mut self, ms: u64) {
        self.ttl_override = Some(ms);
        self.expire = ms;
    }

    pub fn clear_ttl_override(&mut self) {
        self.ttl_override = None;
    }

    /// Next run as seen from `now`: explicit override, else the schedule.
    pub fn next_run_at(&self, now: DateTime<Utc>) -> Result<NextRun, ScheduleError> {
        if let Some(ms) = self.ttl_override {
            return Ok(NextRun::In(ms));
        }
        self.schedule.next_run(&self.schedule_options, now)
    }

    /// Milliseconds until the next execution (`0` = due now). Pure read.
    pub fn ttl_at(&self, now: DateTime<Utc>) -> Result<u64, ScheduleError> {
        Ok(match self.next_run_at(now)? {
            NextRun::In(ms) => ms,
            NextRun::Exhausted => 0,
        })
    }

    /// Compute the TTL and store it in `expire`.
    pub fn resolve_ttl(&mut self, now: DateTime<Utc>) -> Result<u64, ScheduleError> {
        let ttl = self.ttl_at(now)?;
        self.expire = ttl;
        Ok(ttl)
    }

    // ----- lifecycle -----

    /// Set the status a first persist gives: `delayed` with a positive TTL, else `enqueued`.
    pub(crate) fn mark_submitted(&mut self, ttl: u64) -> TaskStatus {
        let status = if ttl > 0 {
            TaskStatus::Delayed
        } else {
            TaskStatus::Enqueued
        };
        self.status = Some(status);
        status
    }

    /// A TTL trigger fired: the task is due again.
    pub(crate) fn mark_due(&mut self) {
        self.status = Some(TaskStatus::Enqueued);
        self.ttl_override = None;
        self.expire = 0;
    }

    /// Evaluate the next status after an execution.
    ///
    /// - Commit: `runs >= maxRuns` (or an exhausted schedule) completes the task;
    ///   a positive TTL delays it; otherwise it is enqueued again.
    /// - Error: a fatal error, or `errorCount >= maxTries`, fails the task;
    ///   otherwise it is delayed by the error's `retry_after` or by the backoff
    ///   for `errorCount`.
    pub fn update_state(
        &mut self,
        stage: Stage,
        backoff: &BackoffPolicy,
        error: Option<&HandlerError>,
        now: DateTime<Utc>,
    ) -> Result<TaskStatus, ScheduleError> {
        let status = match stage {
            Stage::Commit => {
                if self.max_runs.is_reached_by(self.runs) {
                    TaskStatus::Completed
                } else {
                    match self.next_run_at(now)? {
                        NextRun::Exhausted => TaskStatus::Completed,
                        NextRun::In(0) => {
                            self.expire = 0;
                            TaskStatus::Enqueued
                        }
                        NextRun::In(ms) => {
                            self.expire = ms;
                            TaskStatus::Delayed
                        }
                    }
                }
            }
            Stage::Error => {
                let fatal = error.is_some_and(|e| e.fatal);
                if !fatal && self.max_tries.allows(self.error_count) {
                    let delay = error
                        .and_then(|e| e.retry_after)
                        .map(|wait| wait.as_millis().min(u128::from(u64::MAX)) as u64)
                        .unwrap_or_else(|| backoff.compute(self.error_count));
                    self.set_ttl(delay);
                    TaskStatus::Delayed
                } else {
                    TaskStatus::Failed
                }
            }
        };

        self.status = Some(status);
        Ok(status)
    }

    /// Stamp the start of an execution attempt.
    pub fn start(&mut self, now: DateTime<Utc>) {
        let now_ms = now.timestamp_millis();
        self.execution_start = Some(now_ms);
        self.first_run.get_or_insert(now_ms);
    }

    /// Record timing for a finished attempt; on success bump `runs` and reset `errorCount`.
    pub fn complete(&mut self, successful: bool, now: DateTime<Utc>) {
        let now_ms = now.timestamp_millis();
        let started = *self.execution_start.get_or_insert(now_ms);
        self.first_run.get_or_insert(started);

        let elapsed = (now_ms - started).max(0) as u64;
        self.execution_time = Some(elapsed);
        self.last_run = Some(now_ms);

        if successful {
            let prior_runs = self.runs;
            self.runs = self.runs.saturating_add(1);
            self.error_count = 0;
            self.ttl_override = None;

            let previous = self.execution_average.unwrap_or(0.0);
            let average =
                (previous * f64::from(prior_runs) + elapsed as f64) / f64::from(self.runs);
            self.execution_average = Some(average);
        }
    }

    /// Count a failed attempt and keep its error in the ring.
    pub fn fail(&mut self, error: &HandlerError, now: DateTime<Utc>) {
        self.error_count = self.error_count.saturating_add(1);
        self.total_errors = self.total_errors.saturating_add(1);

        let mut record = error.to_record();
        record.ts.get_or_insert(now.timestamp_millis());
        self.push_error(record);
    }

    fn push_error(&mut self, record: ErrorRecord) {
        self.errors.push_back(record);
        self.trim_errors();
    }

    fn trim_errors(&mut self) {
        while self.errors.len() > self.max_errors_length {
            self.errors.pop_front();
        }
    }

    // ----- wire form -----

    pub fn serialize(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&TaskWire::from(self))
    }

    /// Hydrate from a stored record.
    ///
    /// Malformed input is recorded as a parse error in `errors` and every other
    /// field is left untouched; the error is also returned so callers can
    /// quarantine the record instead of running it half-hydrated.
    pub fn deserialize(&mut self, raw: &str) -> Result<(), serde_json::Error> {
        match serde_json::from_str::<TaskWire>(raw) {
            Ok(wire) => {
                self.apply(wire);
                Ok(())
            }
            Err(e) => {
                self.push_error(ErrorRecord::new(
                    PARSE_ERROR_CODE,
                    format!("malformed task record: {e}"),
                ));
                Err(e)
            }
        }
    }

    /// Build a record from its stored form.
    pub fn from_serialized(raw: &str, defaults: &TaskDefaults) -> Result<Self, serde_json::Error> {
        let mut task = Self::with_defaults(defaults);
        task.deserialize(raw)?;
        Ok(task)
    }

    fn apply(&mut self, wire: TaskWire) {
        if let Some(id) = wire.id {
            self.id = Some(id);
        }
        if let Some(queue) = wire.queue {
            self.queue = queue;
        }
        self.data = wire.data;
        self.runs = wire.runs;
        self.status = wire.status;
        self.schedule = wire.schedule;
        self.schedule_options = wire.schedule_options;
        self.expire = wire.expire;
        self.error_count = wire.error_count;
        self.total_errors = wire.total_errors;
        if let Some(max_runs) = wire.max_runs {
            self.max_runs = max_runs;
        }
        if let Some(max_tries) = wire.max_tries {
            self.max_tries = max_tries;
        }
        self.errors = wire.errors.into();
        self.trim_errors();
        self.first_run = wire.first_run;
        self.last_run = wire.last_run;
        self.execution_time = wire.execution_time;
        self.execution_average = wire.execution_average;
    }
}

/// The allow-listed projection that goes to storage.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskWire {
    #[serde(default)]
    id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(default)]
    queue: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    runs: u32,
    #[serde(default)]
    status: Option<TaskStatus>,
    #[serde(default)]
    schedule: Schedule,
    #[serde(default)]
    schedule_options: ScheduleOptions,
    #[serde(default)]
    expire: u64,
    #[serde(default)]
    errors: Vec<ErrorRecord>,
    #[serde(default)]
    error_count: u32,
    #[serde(default)]
    total_errors: u32,
    #[serde(default)]
    max_runs: Option<Limit>,
    #[serde(default)]
    max_tries: Option<Limit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    first_run: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_run: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    execution_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    execution_average: Option<f64>,
}

impl From<&TaskRecord> for TaskWire {
    fn from(task: &TaskRecord) -> Self {
        Self {
            id: task.id.clone(),
            key: task.key(),
            queue: Some(task.queue.clone()),
            data: task.data.clone(),
            runs: task.runs,
            status: task.status,
            schedule: task.schedule.clone(),
            schedule_options: task.schedule_options.clone(),
            expire: task.expire,
            errors: task.errors.iter().cloned().collect(),
            error_count: task.error_count,
            total_errors: task.total_errors,
            max_runs: Some(task.max_runs),
            max_tries: Some(task.max_tries),
            first_run: task.first_run,
            last_run: task.last_run,
            execution_time: task.execution_time,
            execution_average: task.execution_average,
        }
    }
}
