//! Notifications emitted to collaborators.

use serde::Serialize;

use super::error_record::ErrorRecord;
use super::task::TaskRecord;

/// Running totals of one worker loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerCounters {
    pub runs: u64,
    pub errors: u64,
    pub failed: u64,
}

/// Lifecycle notification.
///
/// Every task-level event carries the record as it was at the time of the
/// event; worker-level events (`Added`, `Ran`) also carry the counters.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A new record was persisted by `add_task`.
    Created { task: TaskRecord },

    /// An execution attempt failed and was recorded on the task.
    Error { task: TaskRecord, error: ErrorRecord },

    /// The task ran out of tries and moved to the failed log.
    Failed { task: TaskRecord },

    /// A worker claimed the task.
    Added {
        task: TaskRecord,
        counters: WorkerCounters,
    },

    /// A worker committed a successful run.
    Ran {
        task: TaskRecord,
        counters: WorkerCounters,
    },

    /// A stored record could not be parsed and was moved aside.
    Quarantined {
        key: String,
        raw: String,
        reason: String,
    },
}

impl TaskEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::Created { .. } => "task.created",
            TaskEvent::Error { .. } => "task.error",
            TaskEvent::Failed { .. } => "task.failed",
            TaskEvent::Added { .. } => "task.added",
            TaskEvent::Ran { .. } => "task.ran",
            TaskEvent::Quarantined { .. } => "task.quarantined",
        }
    }

    pub fn task(&self) -> Option<&TaskRecord> {
        match self {
            TaskEvent::Created { task }
            | TaskEvent::Error { task, .. }
            | TaskEvent::Failed { task }
            | TaskEvent::Added { task, .. }
            | TaskEvent::Ran { task, .. } => Some(task),
            TaskEvent::Quarantined { .. } => None,
        }
    }

    pub fn counters(&self) -> Option<WorkerCounters> {
        match self {
            TaskEvent::Added { counters, .. } | TaskEvent::Ran { counters, .. } => Some(*counters),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_follow_the_dotted_convention() {
        let task = TaskRecord::new().with_id("t1");
        let counters = WorkerCounters {
            runs: 1,
            ..WorkerCounters::default()
        };

        let created = TaskEvent::Created { task: task.clone() };
        assert_eq!(created.name(), "task.created");
        assert!(created.counters().is_none());

        let ran = TaskEvent::Ran { task, counters };
        assert_eq!(ran.name(), "task.ran");
        assert_eq!(ran.counters(), Some(counters));
        assert_eq!(
            ran.task().and_then(|t| t.id()).map(|id| id.as_str()),
            Some("t1")
        );
    }

    #[test]
    fn quarantine_carries_no_record() {
        let event = TaskEvent::Quarantined {
            key: "tasks:bad".to_string(),
            raw: "{".to_string(),
            reason: "EOF".to_string(),
        };
        assert_eq!(event.name(), "task.quarantined");
        assert!(event.task().is_none());
    }
}
