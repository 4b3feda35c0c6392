//! cadence-core
//!
//! Task scheduling and worker runtime on top of a KV + list store with key
//! expiration notifications.
//!
//! # Modules
//! - **domain**: task records, schedules, backoff, events
//! - **ports**: `Store`, `Clock`, `IdGenerator`, `EventSink`
//! - **impls**: in-memory and Redis stores, event sinks
//! - **app**: coordinator, scheduler, worker loop, handler registry
//! - **typed**: payload types bound to queues
//! - **config** / **error**: `CadenceConfig`, `CadenceError`

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod typed;

pub use app::{
    Coordinator, HandlerRegistry, PurgeReport, Scheduler, TaskHandler, TrackingCounts,
    TrackingList, Worker, WorkerGroup, handler_fn,
};
pub use config::CadenceConfig;
pub use domain::{
    BackoffPolicy, HandlerError, Limit, Schedule, ScheduleOptions, TaskEvent, TaskId, TaskRecord,
    TaskSpec, TaskStatus, WorkerCounters,
};
pub use error::{CadenceError, RegistryError};
pub use typed::{Handler, TaskPayload};
