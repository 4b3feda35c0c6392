//! Port implementations.
//!
//! - `InMemoryStore`: single-process store, used by tests and demos.
//! - `RedisStore`: production store (feature `redis`).
//! - `BroadcastEventSink` / `NoopEventSink`: event delivery.

pub mod event_sink;
pub mod memory_store;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use self::event_sink::{BroadcastEventSink, NoopEventSink};
pub use self::memory_store::InMemoryStore;
#[cfg(feature = "redis")]
pub use self::redis_store::{RedisStore, RedisStoreOptions};
