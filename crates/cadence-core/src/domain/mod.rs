//! Domain model: task records, schedules, backoff and the values around them.

pub mod backoff;
pub mod error_record;
pub mod events;
pub mod ids;
pub mod limit;
pub mod schedule;
pub mod spec;
pub mod state;
pub mod task;

pub use backoff::BackoffPolicy;
pub use error_record::{
    DECODE_ERROR_CODE, ErrorCode, ErrorRecord, HandlerError, PARSE_ERROR_CODE, UNKNOWN_ERROR_CODE,
};
pub use events::{TaskEvent, WorkerCounters};
pub use ids::TaskId;
pub use limit::Limit;
pub use schedule::{NextRun, Schedule, ScheduleError, ScheduleOptions};
pub use spec::TaskSpec;
pub use state::{Stage, TaskStatus};
pub use task::{TaskDefaults, TaskRecord};
