use thiserror::Error;

use crate::domain::ScheduleError;
use crate::ports::StoreError;

#[derive(Debug, Error)]
pub enum CadenceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("task record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("task has no id")]
    MissingId,

    #[error("task id is immutable: has {current}, refused {requested}")]
    IdConflict { current: String, requested: String },

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no handler registered for queue={0}")]
    HandlerNotFound(String),

    #[error("duplicate handler for queue={0}")]
    DuplicateHandler(String),
}
