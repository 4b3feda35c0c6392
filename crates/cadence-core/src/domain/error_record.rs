//! Failure values: what a handler reports and what a record keeps.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Code used when an error carries none of its own.
pub const UNKNOWN_ERROR_CODE: i64 = 599;

/// Code recorded when a stored record cannot be parsed.
pub const PARSE_ERROR_CODE: i64 = 598;

/// Code used when a handler cannot decode the task payload.
pub const DECODE_ERROR_CODE: i64 = 422;

/// Error code as stored on the wire: numeric or symbolic (e.g. `ECONNRESET`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorCode {
    Numeric(i64),
    Named(String),
}

impl Default for ErrorCode {
    fn default() -> Self {
        ErrorCode::Numeric(UNKNOWN_ERROR_CODE)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Numeric(code) => code.fmt(f),
            ErrorCode::Named(code) => code.fmt(f),
        }
    }
}

impl From<i64> for ErrorCode {
    fn from(value: i64) -> Self {
        ErrorCode::Numeric(value)
    }
}

impl From<&str> for ErrorCode {
    fn from(value: &str) -> Self {
        ErrorCode::Named(value.to_string())
    }
}

/// One entry of a task's bounded `errors` ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    #[serde(default)]
    pub code: ErrorCode,

    #[serde(default)]
    pub message: String,

    /// Epoch milliseconds of the failure, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
}

impl ErrorRecord {
    pub fn new(code: impl Into<ErrorCode>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            ts: None,
        }
    }

    pub fn at(mut self, ts: i64) -> Self {
        self.ts = Some(ts);
        self
    }
}

/// What a task handler returns when an execution attempt fails.
///
/// - `retry_after` replaces the backoff delay for the next retry.
/// - `fatal` skips the remaining tries and fails the task right away.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct HandlerError {
    pub code: ErrorCode,
    pub message: String,
    pub retry_after: Option<Duration>,
    pub fatal: bool,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::default(),
            message: message.into(),
            retry_after: None,
            fatal: false,
        }
    }

    pub fn with_code(mut self, code: impl Into<ErrorCode>) -> Self {
        self.code = code.into();
        self
    }

    /// Ask for the next retry after `wait` instead of the backoff delay.
    pub fn retry_after(mut self, wait: Duration) -> Self {
        self.retry_after = Some(wait);
        self
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    /// Wrap any error; the message falls back to "Unknown Error" when empty.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let message = error.to_string();
        if message.is_empty() {
            Self::new("Unknown Error")
        } else {
            Self::new(message)
        }
    }

    /// Normalized entry for the `errors` ring.
    pub fn to_record(&self) -> ErrorRecord {
        let message = if self.message.is_empty() {
            "Unknown Error".to_string()
        } else {
            self.message.clone()
        };
        ErrorRecord {
            code: self.code.clone(),
            message,
            ts: None,
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(format!("json decode: {error}")).with_code(DECODE_ERROR_CODE)
    }
}
