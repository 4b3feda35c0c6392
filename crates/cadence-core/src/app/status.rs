//! Tracking lists and their sizes.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::config::CadenceConfig;

/// The bookkeeping lists kept under the tracking prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackingList {
    /// Ids claimed by a worker.
    Active,
    /// Serialized records that ran out of tries.
    Failed,
    /// Serialized records that finished their runs.
    Completed,
    /// Every id ever submitted (when `track_ids` is on).
    Ids,
    /// Raw records that could not be parsed.
    Quarantine,
}

impl TrackingList {
    pub const ALL: [TrackingList; 5] = [
        TrackingList::Active,
        TrackingList::Failed,
        TrackingList::Completed,
        TrackingList::Ids,
        TrackingList::Quarantine,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TrackingList::Active => "active",
            TrackingList::Failed => "failed",
            TrackingList::Completed => "completed",
            TrackingList::Ids => "ids",
            TrackingList::Quarantine => "quarantine",
        }
    }

    pub fn key(self, config: &CadenceConfig) -> String {
        format!("{}:{}", config.tracking_prefix, self.as_str())
    }
}

impl fmt::Display for TrackingList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackingList {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TrackingList::ALL
            .into_iter()
            .find(|list| list.as_str() == s)
            .ok_or_else(|| format!("unknown tracking list '{s}'"))
    }
}

/// Snapshot of the tracking list lengths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackingCounts {
    pub active: usize,
    pub failed: usize,
    pub completed: usize,
    pub quarantined: usize,
    pub ids: usize,
}

impl TrackingCounts {
    pub(crate) fn set(&mut self, list: TrackingList, len: usize) {
        match list {
            TrackingList::Active => self.active = len,
            TrackingList::Failed => self.failed = len,
            TrackingList::Completed => self.completed = len,
            TrackingList::Ids => self.ids = len,
            TrackingList::Quarantine => self.quarantined = len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_keys_use_the_tracking_prefix() {
        let config = CadenceConfig {
            tracking_prefix: "track".to_string(),
            ..CadenceConfig::default()
        };
        assert_eq!(TrackingList::Active.key(&config), "track:active");
        assert_eq!(TrackingList::Quarantine.key(&config), "track:quarantine");
        assert_eq!(TrackingList::Completed.key(&config), "track:completed");
    }

    #[test]
    fn names_parse_back() {
        for list in TrackingList::ALL {
            assert_eq!(list.as_str().parse::<TrackingList>().unwrap(), list);
        }
        assert!("pending".parse::<TrackingList>().is_err());
    }
}
