//! Ports: the seams between the task lifecycle and the outside world.
//!
//! The coordinator only ever talks to a `Store` (KV + lists + expiration
//! notifications), reads time from a `Clock`, mints ids through an
//! `IdGenerator` and reports lifecycle events to an `EventSink`.

pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::EventSink;
pub use self::id_generator::{IdGenerator, UidGenerator};
pub use self::store::{Batch, ExpiredKeys, Store, StoreError, StoreOp};
