//! Task status and lifecycle stages.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Task status.
///
/// State transitions:
/// - (new) -> Enqueued | Delayed            (first persist)
/// - Enqueued -> Enqueued | Delayed | Completed   (commit)
/// - Enqueued -> Delayed | Failed                 (error)
/// - Delayed -> Enqueued                          (TTL trigger fired)
///
/// A task that has never been persisted has no status (`Option::None` on the record).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Ready for (or sitting in) its queue.
    Enqueued,

    /// Waiting on a TTL trigger.
    Delayed,

    /// Terminal success.
    Completed,

    /// Terminal failure.
    Failed,
}

impl TaskStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Enqueued => "enqueued",
            TaskStatus::Delayed => "delayed",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which outcome `TaskRecord::update_state` is evaluating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// After a successful execution.
    Commit,

    /// After a failed execution.
    Error,
}
