//! Typed payload API.
//!
//! A `TaskPayload` binds a payload type to the queue it travels on, so
//! submitting and handling it can't disagree on either the queue name or the
//! payload shape.
//!
//! - **Surface (typed)**: `TaskPayload`, `Handler<T>`
//! - **Inside (dyn)**: `TypedHandler<T, H>` erases `T` into a `TaskHandler`

pub mod handler;
pub mod payload;

pub use self::handler::{Handler, TypedHandler};
pub use self::payload::TaskPayload;
