//! IdGenerator port.
//!
//! Generated ids are `<timestamp base36>-<random suffix>`; the timestamp comes
//! from a `Clock` so tests can pin it.

use crate::domain::ids::{DEFAULT_UID_LEN, TaskId, format_uid};
use crate::ports::Clock;

/// Mints ids for tasks submitted without one.
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;
}

/// Timestamp + random suffix ids.
pub struct UidGenerator<C> {
    clock: C,
    len: usize,
}

impl<C: Clock> UidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            len: DEFAULT_UID_LEN,
        }
    }

    pub fn with_len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }
}

impl<C: Clock> IdGenerator for UidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        format_uid(timestamp_ms, self.len, &mut rand::thread_rng())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::to_base36;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn uid_generator_generates_unique_ids() {
        let id_gen = UidGenerator::new(SystemClock);

        let id1 = id_gen.generate_task_id();
        let id2 = id_gen.generate_task_id();
        let id3 = id_gen.generate_task_id();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn uid_generator_with_fixed_clock_shares_the_timestamp_part() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UidGenerator::new(FixedClock::new(fixed_time));

        let id1 = id_gen.generate_task_id();
        let id2 = id_gen.generate_task_id();

        // random suffix differs, timestamp prefix does not
        assert_ne!(id1, id2);
        let prefix = format!("{}-", to_base36(fixed_time.timestamp_millis() as u64));
        assert!(id1.as_str().starts_with(&prefix));
        assert!(id2.as_str().starts_with(&prefix));
        assert_eq!(id1.as_str().len(), DEFAULT_UID_LEN);
    }

    #[test]
    fn custom_length_is_honoured() {
        let id_gen = UidGenerator::new(SystemClock).with_len(32);
        assert_eq!(id_gen.generate_task_id().as_str().len(), 32);
    }
}
