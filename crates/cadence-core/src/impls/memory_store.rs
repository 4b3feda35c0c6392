//! In-process `Store`.
//!
//! Strings and lists live behind one `tokio::sync::Mutex`, so a `Batch` is
//! applied under a single lock and is trivially atomic. Blocking moves park on
//! a `Notify` that every list push wakes. Expiring keys get a timer task; when
//! it fires and the key still holds the same write, the key is dropped and its
//! name is sent to every expiration subscriber.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, mpsc};

use crate::ports::{Batch, ExpiredKeys, Store, StoreError, StoreOp};

struct Entry {
    value: String,
    /// Changes on every write so a stale timer can tell it lost the key.
    generation: u64,
}

#[derive(Default)]
struct StoreState {
    strings: HashMap<String, Entry>,
    lists: HashMap<String, VecDeque<String>>,
    subscribers: Vec<mpsc::UnboundedSender<String>>,
    next_generation: u64,
    closed: bool,
}

impl StoreState {
    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn write(&mut self, key: String, value: String) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.strings.insert(key, Entry { value, generation });
        generation
    }

    fn pop_move(&mut self, source: &str, destination: &str) -> Option<String> {
        let list = self.lists.get_mut(source)?;
        let value = list.pop_front()?;
        if list.is_empty() {
            self.lists.remove(source);
        }
        self.lists
            .entry(destination.to_string())
            .or_default()
            .push_back(value.clone());
        Some(value)
    }
}

struct Inner {
    state: Mutex<StoreState>,
    pushed: Notify,
}

/// In-memory store. Cloning shares the same data.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(StoreState::default()),
                pushed: Notify::new(),
            }),
        }
    }

    /// Refuse every further call; parked `blocking_move` calls return `Closed`
    /// and expiration streams end.
    pub async fn close(&self) {
        let mut state = self.inner.state.lock().await;
        state.closed = true;
        state.subscribers.clear();
        drop(state);
        self.inner.pushed.notify_waiters();
    }

    /// End every expiration stream, as a server restart would. New
    /// subscriptions still work.
    pub async fn drop_subscriptions(&self) {
        self.inner.state.lock().await.subscribers.clear();
    }

    /// Does `key` currently hold a string value?
    pub async fn contains_key(&self, key: &str) -> bool {
        self.inner.state.lock().await.strings.contains_key(key)
    }

    fn arm_expiry(&self, key: String, generation: u64, ttl_ms: u64) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ttl_ms)).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut state = inner.state.lock().await;
            let current = state.strings.get(&key).map(|entry| entry.generation);
            if current != Some(generation) {
                return;
            }
            state.strings.remove(&key);
            tracing::trace!(key = %key, "key expired");
            state
                .subscribers
                .retain(|subscriber| subscriber.send(key.clone()).is_ok());
        });
    }
}

/// Clamp Redis-style inclusive indices to `0..len`.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { len + start } else { start }.max(0);
    let stop = if stop < 0 { len + stop } else { stop }.min(len - 1);
    if len == 0 || start > stop || start >= len {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let state = self.inner.state.lock().await;
        state.check_open()?;
        Ok(state.strings.get(key).map(|entry| entry.value.clone()))
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.inner.state.lock().await;
        state.check_open()?;
        let Some(list) = state.lists.get(key) else {
            return Ok(Vec::new());
        };
        Ok(match resolve_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let state = self.inner.state.lock().await;
        state.check_open()?;
        Ok(state.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn blocking_move(&self, source: &str, destination: &str) -> Result<String, StoreError> {
        loop {
            // Register interest before looking, so a push between the check and
            // the await is not missed.
            let pushed = self.inner.pushed.notified();
            tokio::pin!(pushed);
            pushed.as_mut().enable();

            {
                let mut state = self.inner.state.lock().await;
                state.check_open()?;
                if let Some(value) = state.pop_move(source, destination) {
                    return Ok(value);
                }
            }

            pushed.await;
        }
    }

    async fn exec(&self, batch: Batch) -> Result<(), StoreError> {
        let mut expiring = Vec::new();
        let mut any_push = false;
        {
            let mut state = self.inner.state.lock().await;
            state.check_open()?;
            for op in batch.into_ops() {
                match op {
                    StoreOp::Set { key, value } => {
                        state.write(key, value);
                    }
                    StoreOp::SetPx { key, value, ttl_ms } => {
                        let generation = state.write(key.clone(), value);
                        expiring.push((key, generation, ttl_ms));
                    }
                    StoreOp::Del { key } => {
                        state.strings.remove(&key);
                        state.lists.remove(&key);
                    }
                    StoreOp::RPush { key, value } => {
                        state.lists.entry(key).or_default().push_back(value);
                        any_push = true;
                    }
                    StoreOp::LRem { key, value } => {
                        if let Some(list) = state.lists.get_mut(&key) {
                            list.retain(|item| *item != value);
                            if list.is_empty() {
                                state.lists.remove(&key);
                            }
                        }
                    }
                }
            }
        }

        for (key, generation, ttl_ms) in expiring {
            self.arm_expiry(key, generation, ttl_ms);
        }
        if any_push {
            self.inner.pushed.notify_waiters();
        }
        Ok(())
    }

    async fn subscribe_expired(&self) -> Result<ExpiredKeys, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock().await;
        state.check_open()?;
        state.subscribers.push(tx);
        Ok(rx)
    }
}
