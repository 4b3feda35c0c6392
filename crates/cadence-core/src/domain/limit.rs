//! Run/try budgets that may be unbounded.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A count budget (`maxRuns`, `maxTries`).
///
/// JSON cannot carry infinity, so `Unbounded` travels as `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Limit {
    Bounded(u32),
    Unbounded,
}

impl Limit {
    const UNBOUNDED_MARKER: i64 = -1;

    /// Has `count` used up this budget?
    pub fn is_reached_by(self, count: u32) -> bool {
        match self {
            Limit::Bounded(max) => count >= max,
            Limit::Unbounded => false,
        }
    }

    /// Is `count` still under this budget?
    pub fn allows(self, count: u32) -> bool {
        !self.is_reached_by(count)
    }

    pub fn is_unbounded(self) -> bool {
        matches!(self, Limit::Unbounded)
    }
}

impl From<u32> for Limit {
    fn from(value: u32) -> Self {
        Limit::Bounded(value)
    }
}

/// Accepts a count, or `-1` / `unbounded` for no limit.
impl FromStr for Limit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("unbounded") {
            return Ok(Limit::Unbounded);
        }
        let raw: i64 = s.parse().map_err(|_| format!("invalid limit: {s}"))?;
        if raw < 0 {
            return Ok(Limit::Unbounded);
        }
        u32::try_from(raw)
            .map(Limit::Bounded)
            .map_err(|_| format!("limit out of range: {raw}"))
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::Bounded(max) => max.fmt(f),
            Limit::Unbounded => f.write_str("unbounded"),
        }
    }
}

impl Serialize for Limit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Limit::Bounded(max) => serializer.serialize_i64(i64::from(*max)),
            Limit::Unbounded => serializer.serialize_i64(Self::UNBOUNDED_MARKER),
        }
    }
}

impl<'de> Deserialize<'de> for Limit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        if raw < 0 {
            return Ok(Limit::Unbounded);
        }
        u32::try_from(raw)
            .map(Limit::Bounded)
            .map_err(|_| serde::de::Error::custom(format!("limit out of range: {raw}")))
    }
}
