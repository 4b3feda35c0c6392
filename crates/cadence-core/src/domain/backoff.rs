//! Backoff policy: decides retry delays.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

/// Exponential backoff with a floor, a ceiling and proportional jitter.
///
/// All delays are in milliseconds. The policy holds no state; every call is a
/// pure function of the attempt number (plus randomness when jitter is on).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffPolicy {
    /// Multiplicative growth per attempt.
    pub factor: f64,

    /// Floor. `0` disables the floor.
    pub min_delay: u64,

    /// Ceiling. `0` disables the ceiling.
    pub max_delay: u64,

    /// Proportional random inflation. `None` (or `0`) makes `compute` deterministic.
    pub jitter: Option<f64>,

    /// Starting value for step 1. Falls back to `min_delay` when unset.
    pub base_delay: Option<u64>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            factor: 2.3,
            min_delay: 500,
            max_delay: 60 * 60 * 1000,
            jitter: Some(0.3),
            base_delay: None,
        }
    }
}

impl BackoffPolicy {
    /// Same policy without jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = None;
        self
    }

    /// Delay in milliseconds before retry number `step` (1-indexed).
    pub fn compute(&self, step: u32) -> u64 {
        self.compute_with_rng(step, &mut rand::thread_rng())
    }

    /// Calculate the delay using the given random source.
    ///
    /// delay = base * factor^(step - 1), clamped to `[min_delay - 10, max_delay]`.
    /// The floor sits 10ms under `min_delay` so the jittered sequence stays
    /// increasing after rounding. Jitter then adds `(delay / 10) * (1 + U(0, jitter))`.
    pub fn compute_with_rng<R: Rng + ?Sized>(&self, step: u32, rng: &mut R) -> u64 {
        let start = self
            .base_delay
            .filter(|d| *d > 0)
            .unwrap_or(self.min_delay);
        let mut delay = start as f64;

        if self.factor != 0.0 {
            let exponent = step.max(1) - 1;
            delay *= self.factor.powi(exponent.min(i32::MAX as u32) as i32);
        }

        if self.max_delay != 0 {
            delay = delay.min(self.max_delay as f64);
        }

        if self.min_delay != 0 {
            delay = delay.max(self.min_delay as f64 - 10.0);
        }

        if let Some(jitter) = self.jitter.filter(|j| *j > 0.0) {
            let random_factor = 1.0 + rng.r#gen::<f64>() * jitter;
            delay += ((delay / 10.0) * random_factor).round();
        }

        delay.floor().max(0.0) as u64
    }

    /// Run `callback` once after `compute(step)` has elapsed.
    pub fn execute<F>(&self, step: u32, callback: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let delay = Duration::from_millis(self.compute(step));
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        })
    }
}
