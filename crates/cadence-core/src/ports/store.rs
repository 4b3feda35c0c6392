//! Store port: key/value + lists + expiration notifications.
//!
//! This is the whole capability set the lifecycle needs from its backing
//! store. Multi-step changes always go through `exec` as one `Batch`, which the
//! store must apply atomically (all ops or none).

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command failed: {0}")]
    Command(String),

    #[error("store is closed")]
    Closed,
}

/// One write inside a `Batch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Set {
        key: String,
        value: String,
    },

    /// Set with an expiry in milliseconds.
    SetPx {
        key: String,
        value: String,
        ttl_ms: u64,
    },

    Del {
        key: String,
    },

    /// Append to the tail of a list.
    RPush {
        key: String,
        value: String,
    },

    /// Remove every occurrence of `value` from a list.
    LRem {
        key: String,
        value: String,
    },
}

/// Ordered list of writes applied atomically by `Store::exec`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    ops: Vec<StoreOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.ops.push(StoreOp::Set {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn set_px(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl_ms: u64,
    ) -> &mut Self {
        self.ops.push(StoreOp::SetPx {
            key: key.into(),
            value: value.into(),
            ttl_ms,
        });
        self
    }

    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(StoreOp::Del { key: key.into() });
        self
    }

    pub fn rpush(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.ops.push(StoreOp::RPush {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn lrem(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.ops.push(StoreOp::LRem {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<StoreOp> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Names of keys whose TTL elapsed, in firing order.
pub type ExpiredKeys = mpsc::UnboundedReceiver<String>;

/// Backing store port (interface).
///
/// Implementations: `InMemoryStore` (tests, single process) and `RedisStore`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Bulk `get`; the result lines up with `keys`.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    /// Inclusive range with Redis index semantics (negative counts from the tail).
    async fn list_range(&self, key: &str, start: isize, stop: isize)
    -> Result<Vec<String>, StoreError>;

    async fn list_len(&self, key: &str) -> Result<usize, StoreError>;

    /// Wait until `source` is non-empty, then atomically move its head onto the
    /// tail of `destination` and return it. Waits indefinitely.
    async fn blocking_move(&self, source: &str, destination: &str) -> Result<String, StoreError>;

    /// Apply every op of `batch`, or none of them.
    async fn exec(&self, batch: Batch) -> Result<(), StoreError>;

    /// Subscribe to key-expiration notifications.
    async fn subscribe_expired(&self) -> Result<ExpiredKeys, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_keeps_insertion_order() {
        let mut batch = Batch::new();
        batch
            .lrem("tasks:active", "t1")
            .set("tasks:t1", "{}")
            .rpush("emails", "t1");

        assert_eq!(batch.len(), 3);
        assert!(matches!(batch.ops()[0], StoreOp::LRem { .. }));
        assert!(matches!(batch.ops()[2], StoreOp::RPush { .. }));
    }
}
