//! Caller-facing task definitions.
//!
//! A `TaskSpec` is what callers (and the CLI) hand to the scheduler. Anything
//! left out falls back to `TaskDefaults`.

use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::limit::Limit;
use super::schedule::{Schedule, ScheduleOptions};
use super::task::{TaskDefaults, TaskRecord};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,

    pub data: serde_json::Value,

    pub schedule: Schedule,

    pub schedule_options: ScheduleOptions,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<Limit>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tries: Option<Limit>,

    /// Explicit first delay in milliseconds; wins over the schedule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl TaskSpec {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_max_runs(mut self, max_runs: impl Into<Limit>) -> Self {
        self.max_runs = Some(max_runs.into());
        self
    }

    pub fn with_max_tries(mut self, max_tries: impl Into<Limit>) -> Self {
        self.max_tries = Some(max_tries.into());
        self
    }

    pub fn with_ttl(mut self, ms: u64) -> Self {
        self.ttl = Some(ms);
        self
    }

    pub fn into_record(self, defaults: &TaskDefaults) -> TaskRecord {
        let mut task = TaskRecord::with_defaults(defaults)
            .with_data(self.data)
            .with_schedule(self.schedule)
            .with_schedule_options(self.schedule_options);

        if let Some(id) = self.id {
            task = task.with_id(id);
        }
        if let Some(queue) = self.queue {
            task = task.with_queue(queue);
        }
        if let Some(max_runs) = self.max_runs {
            task = task.with_max_runs(max_runs);
        }
        if let Some(max_tries) = self.max_tries {
            task = task.with_max_tries(max_tries);
        }
        if let Some(ttl) = self.ttl {
            task.set_ttl(ttl);
        }
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let spec: TaskSpec = serde_json::from_str(r#"{"data":{"url":"x"}}"#).unwrap();
        let task = spec.into_record(&TaskDefaults::default());

        assert!(task.id().is_none());
        assert_eq!(task.queue, "tasks");
        assert_eq!(task.max_runs, Limit::Bounded(1));
        assert_eq!(task.max_tries, Limit::Bounded(4));
        assert_eq!(task.data, serde_json::json!({"url": "x"}));
    }

    #[test]
    fn explicit_fields_win() {
        let json = r#"{
            "id": "t3",
            "queue": "scrape",
            "data": null,
            "schedule": 5000,
            "maxRuns": -1,
            "maxTries": 2
        }"#;
        let spec: TaskSpec = serde_json::from_str(json).unwrap();
        let task = spec.into_record(&TaskDefaults::default());

        assert_eq!(task.id().map(TaskId::as_str), Some("t3"));
        assert_eq!(task.queue, "scrape");
        assert_eq!(task.schedule, Schedule::Delay(5000));
        assert_eq!(task.max_runs, Limit::Unbounded);
        assert_eq!(task.max_tries, Limit::Bounded(2));
    }

    #[test]
    fn explicit_ttl_overrides_schedule() {
        let task = TaskSpec::new(serde_json::Value::Null)
            .with_schedule(Schedule::Delay(5000))
            .with_ttl(250)
            .into_record(&TaskDefaults::default());
        assert_eq!(task.ttl_at(chrono::Utc::now()).unwrap(), 250);
    }
}
