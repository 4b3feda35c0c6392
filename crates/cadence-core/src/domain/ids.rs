//! Task identifiers.
//!
//! Ids are opaque strings. Callers may pick their own; generated ids look like
//! `<timestamp base36>-<random base36 suffix>`, 20 characters in total, so they
//! sort roughly by creation time.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Default length of generated ids.
pub const DEFAULT_UID_LEN: usize = 20;

/// Identifier of a task. Immutable once assigned to a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Render `value` in lowercase base36.
pub fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// Build a uid of (at least) `len` characters from a millisecond timestamp.
///
/// The random suffix fills whatever the timestamp and the `-` separator leave;
/// it is never shorter than one character.
pub fn format_uid<R: Rng + ?Sized>(timestamp_ms: u64, len: usize, rng: &mut R) -> TaskId {
    let timestamp = to_base36(timestamp_ms);
    let suffix_len = len.saturating_sub(timestamp.len() + 1).max(1);
    let suffix: String = (0..suffix_len)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    TaskId(format!("{timestamp}-{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn base36_rendering() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1_700_000_000_000), "loyw3v28");
    }

    #[test]
    fn uid_has_requested_length_and_timestamp_prefix() {
        let mut rng = StdRng::seed_from_u64(1);
        let id = format_uid(1_700_000_000_000, DEFAULT_UID_LEN, &mut rng);

        assert_eq!(id.as_str().len(), DEFAULT_UID_LEN);
        assert!(id.as_str().starts_with("loyw3v28-"));
        assert!(
            id.as_str()
                .chars()
                .all(|c| c == '-' || c.is_ascii_digit() || c.is_ascii_lowercase())
        );
    }

    #[test]
    fn short_lengths_still_get_a_suffix() {
        let mut rng = StdRng::seed_from_u64(1);
        let id = format_uid(1_700_000_000_000, 4, &mut rng);
        assert_eq!(id.as_str().len(), "loyw3v28-".len() + 1);
    }

    #[test]
    fn task_id_serializes_as_plain_string() {
        let id = TaskId::new("t1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"t1\"");
        let back: TaskId = serde_json::from_str("\"t1\"").unwrap();
        assert_eq!(back, id);
    }
}
