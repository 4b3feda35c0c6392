//! Configuration: an explicit struct with documented defaults.
//!
//! Environment variables (all optional):
//! - `CADENCE_KEY_PREFIX`, `CADENCE_TRACKING_PREFIX`, `CADENCE_QUEUE`
//! - `CADENCE_MAX_ERRORS_LENGTH`, `CADENCE_MAX_RUNS`, `CADENCE_MAX_TRIES` (`-1` = unbounded)
//! - `CADENCE_BACKOFF_FACTOR`, `CADENCE_BACKOFF_MIN_MS`, `CADENCE_BACKOFF_MAX_MS`,
//!   `CADENCE_BACKOFF_JITTER` (`0` disables)
//! - `CADENCE_EXPIRED_CHANNEL`, `CADENCE_TRACK_IDS`
//! - `CADENCE_REDIS_URL`, `CADENCE_CONFIGURE_KEYSPACE_EVENTS`

use std::str::FromStr;

use crate::domain::task::{
    DEFAULT_KEY_PREFIX, DEFAULT_MAX_ERRORS_LENGTH, DEFAULT_MAX_RUNS, DEFAULT_MAX_TRIES,
    DEFAULT_QUEUE,
};
use crate::domain::{BackoffPolicy, Limit, TaskDefaults};
use crate::error::CadenceError;

#[derive(Debug, Clone, PartialEq)]
pub struct CadenceConfig {
    /// Prefix of record keys (`<key_prefix>:<id>`).
    pub key_prefix: String,

    /// Prefix of the `active`/`failed`/`completed`/`ids`/`quarantine` lists.
    pub tracking_prefix: String,

    pub default_queue: String,
    pub max_errors_length: usize,
    pub default_max_runs: Limit,
    pub default_max_tries: Limit,
    pub backoff: BackoffPolicy,

    /// Channel announcing expired keys.
    pub expired_key_events: String,

    /// Maintain the `<tracking_prefix>:ids` index.
    pub track_ids: bool,

    pub redis_url: String,
    pub configure_keyspace_events: bool,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            tracking_prefix: DEFAULT_KEY_PREFIX.to_string(),
            default_queue: DEFAULT_QUEUE.to_string(),
            max_errors_length: DEFAULT_MAX_ERRORS_LENGTH,
            default_max_runs: Limit::Bounded(DEFAULT_MAX_RUNS),
            default_max_tries: Limit::Bounded(DEFAULT_MAX_TRIES),
            backoff: BackoffPolicy::default(),
            expired_key_events: "__keyevent@0__:expired".to_string(),
            track_ids: true,
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            configure_keyspace_events: true,
        }
    }
}

impl CadenceConfig {
    pub fn from_env() -> Result<Self, CadenceError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source (the process env in `from_env`).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CadenceError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("CADENCE_KEY_PREFIX") {
            config.key_prefix = v;
        }
        if let Some(v) = lookup("CADENCE_TRACKING_PREFIX") {
            config.tracking_prefix = v;
        }
        if let Some(v) = lookup("CADENCE_QUEUE") {
            config.default_queue = v;
        }
        if let Some(v) = parse_var(&lookup, "CADENCE_MAX_ERRORS_LENGTH")? {
            config.max_errors_length = v;
        }
        if let Some(v) = parse_var::<Limit, _>(&lookup, "CADENCE_MAX_RUNS")? {
            config.default_max_runs = v;
        }
        if let Some(v) = parse_var::<Limit, _>(&lookup, "CADENCE_MAX_TRIES")? {
            config.default_max_tries = v;
        }
        if let Some(v) = parse_var(&lookup, "CADENCE_BACKOFF_FACTOR")? {
            config.backoff.factor = v;
        }
        if let Some(v) = parse_var(&lookup, "CADENCE_BACKOFF_MIN_MS")? {
            config.backoff.min_delay = v;
        }
        if let Some(v) = parse_var(&lookup, "CADENCE_BACKOFF_MAX_MS")? {
            config.backoff.max_delay = v;
        }
        if let Some(v) = parse_var::<f64, _>(&lookup, "CADENCE_BACKOFF_JITTER")? {
            config.backoff.jitter = (v > 0.0).then_some(v);
        }
        if let Some(v) = lookup("CADENCE_EXPIRED_CHANNEL") {
            config.expired_key_events = v;
        }
        if let Some(v) = parse_var(&lookup, "CADENCE_TRACK_IDS")? {
            config.track_ids = v;
        }
        if let Some(v) = lookup("CADENCE_REDIS_URL") {
            config.redis_url = v;
        }
        if let Some(v) = parse_var(&lookup, "CADENCE_CONFIGURE_KEYSPACE_EVENTS")? {
            config.configure_keyspace_events = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CadenceError> {
        if self.key_prefix.is_empty() {
            return Err(CadenceError::Config("key_prefix cannot be empty".into()));
        }
        if self.tracking_prefix.is_empty() {
            return Err(CadenceError::Config(
                "tracking_prefix cannot be empty".into(),
            ));
        }
        if self.default_queue.is_empty() {
            return Err(CadenceError::Config("default_queue cannot be empty".into()));
        }
        if self.backoff.factor.is_nan() || self.backoff.factor <= 0.0 {
            return Err(CadenceError::Config(format!(
                "backoff factor must be positive, got {}",
                self.backoff.factor
            )));
        }
        if self.backoff.min_delay != 0
            && self.backoff.max_delay != 0
            && self.backoff.min_delay > self.backoff.max_delay
        {
            return Err(CadenceError::Config(format!(
                "backoff min_delay ({}) exceeds max_delay ({})",
                self.backoff.min_delay, self.backoff.max_delay
            )));
        }
        if let Some(jitter) = self.backoff.jitter
            && !(0.0..=1.0).contains(&jitter)
        {
            return Err(CadenceError::Config(format!(
                "backoff jitter must be within [0, 1], got {jitter}"
            )));
        }
        Ok(())
    }

    /// Defaults for new records.
    pub fn task_defaults(&self) -> TaskDefaults {
        TaskDefaults {
            key_prefix: self.key_prefix.clone(),
            queue: self.default_queue.clone(),
            max_runs: self.default_max_runs,
            max_tries: self.default_max_tries,
            max_errors_length: self.max_errors_length,
        }
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>, CadenceError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| CadenceError::Config(format!("{name}={raw:?}: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = CadenceConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, CadenceConfig::default());
    }

    #[test]
    fn variables_override_defaults() {
        let config = CadenceConfig::from_lookup(lookup_from(&[
            ("CADENCE_KEY_PREFIX", "jobs"),
            ("CADENCE_TRACKING_PREFIX", "track"),
            ("CADENCE_MAX_TRIES", "-1"),
            ("CADENCE_MAX_RUNS", "3"),
            ("CADENCE_BACKOFF_JITTER", "0"),
            ("CADENCE_TRACK_IDS", "false"),
        ]))
        .unwrap();

        assert_eq!(config.key_prefix, "jobs");
        assert_eq!(config.tracking_prefix, "track");
        assert_eq!(config.default_max_tries, Limit::Unbounded);
        assert_eq!(config.default_max_runs, Limit::Bounded(3));
        assert_eq!(config.backoff.jitter, None);
        assert!(!config.track_ids);

        let defaults = config.task_defaults();
        assert_eq!(defaults.key_prefix, "jobs");
        assert_eq!(defaults.max_runs, Limit::Bounded(3));
    }

    #[test]
    fn unparsable_values_are_rejected() {
        let err = CadenceConfig::from_lookup(lookup_from(&[("CADENCE_MAX_RUNS", "lots")]))
            .unwrap_err();
        assert!(matches!(err, CadenceError::Config(_)));
    }

    #[test]
    fn validation_rejects_inconsistent_backoff() {
        let mut config = CadenceConfig::default();
        config.backoff.min_delay = 10_000;
        config.backoff.max_delay = 1_000;
        assert!(config.validate().is_err());

        let mut config = CadenceConfig::default();
        config.backoff.jitter = Some(1.5);
        assert!(config.validate().is_err());

        let mut config = CadenceConfig::default();
        config.key_prefix.clear();
        assert!(config.validate().is_err());
    }
}
