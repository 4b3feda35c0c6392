//! App layer: wires the ports into the task lifecycle.
//!
//! # Components
//! - **Coordinator**: lifecycle transitions as atomic store batches
//! - **Scheduler**: public submit/admin/introspection surface, owns the expiration listener
//! - **Worker / WorkerGroup**: queue-draining loops (dequeue, handle, commit or handle_error)
//! - **HandlerRegistry**: queue -> handler
//! - **TrackingList / TrackingCounts**: bookkeeping lists and their sizes

pub mod coordinator;
pub mod registry;
pub mod scheduler;
pub mod status;
pub mod worker_loop;

pub use self::coordinator::Coordinator;
pub use self::registry::{FnHandler, HandlerRegistry, TaskHandler, handler_fn};
pub use self::scheduler::{IntoTask, PurgeReport, Scheduler};
pub use self::status::{TrackingCounts, TrackingList};
pub use self::worker_loop::{Worker, WorkerGroup};
