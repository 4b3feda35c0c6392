//! Coordinator: turns task lifecycle transitions into atomic store batches.
//!
//! Key layout (bit-exact with deployed stores):
//! - `<keyPrefix>:<id>`: serialized record
//! - `<keyPrefix>:<id>:ttl`: expiring trigger whose value is the record key
//! - `<trackingPrefix>:{active,failed,completed,ids,quarantine}`: tracking lists
//!
//! Every multi-step change is one `Batch`. Queue pushes are always preceded by
//! an `LREM` of the same id, so a queue never holds an id twice.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app::status::{TrackingCounts, TrackingList};
use crate::config::CadenceConfig;
use crate::domain::{
    HandlerError, Stage, TaskDefaults, TaskEvent, TaskId, TaskRecord, TaskStatus,
};
use crate::error::CadenceError;
use crate::impls::NoopEventSink;
use crate::ports::{
    Batch, Clock, EventSink, ExpiredKeys, IdGenerator, Store, SystemClock, UidGenerator,
};

/// Resubscription attempts before the expiration listener gives up.
pub const RESUBSCRIBE_ATTEMPTS: u32 = 5;

pub struct Coordinator {
    store: Arc<dyn Store>,
    config: CadenceConfig,
    defaults: TaskDefaults,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    events: Arc<dyn EventSink>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn Store>, config: CadenceConfig) -> Self {
        let defaults = config.task_defaults();
        Self {
            store,
            config,
            defaults,
            clock: Arc::new(SystemClock),
            ids: Arc::new(UidGenerator::new(SystemClock)),
            events: Arc::new(NoopEventSink),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &CadenceConfig {
        &self.config
    }

    pub fn task_defaults(&self) -> &TaskDefaults {
        &self.defaults
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    pub(crate) fn emit(&self, event: TaskEvent) {
        self.events.emit(event);
    }

    fn list_key(&self, list: TrackingList) -> String {
        list.key(&self.config)
    }

    fn record_key(&self, id: &TaskId) -> String {
        format!("{}:{}", self.config.key_prefix, id)
    }

    /// Keys of `task` under the configured prefix, whatever prefix the record carries.
    fn keys_of(&self, task: &TaskRecord) -> Result<(TaskId, String, String), CadenceError> {
        let id = task.id().ok_or(CadenceError::MissingId)?.clone();
        let key = self.record_key(&id);
        let ttl_key = format!("{key}:ttl");
        Ok((id, key, ttl_key))
    }

    /// Record key behind an expired trigger, if the name matches `^(<keyPrefix>:.+):ttl$`.
    pub fn record_key_for_trigger<'a>(&self, trigger: &'a str) -> Option<&'a str> {
        let record_key = trigger.strip_suffix(":ttl")?;
        let id = record_key.strip_prefix(self.config.key_prefix.as_str())?;
        let id = id.strip_prefix(':')?;
        (!id.is_empty()).then_some(record_key)
    }

    // ----- submission -----

    /// Persist a new task and make it runnable.
    ///
    /// A task whose key already holds a record is not touched; the stored
    /// record is returned instead.
    pub async fn add_task(&self, mut task: TaskRecord) -> Result<TaskRecord, CadenceError> {
        if task.id().is_none() {
            task.set_id(self.ids.generate_task_id())?;
        }
        task.set_key_prefix(&self.config.key_prefix);
        let (_, key, _) = self.keys_of(&task)?;

        if let Some(raw) = self.store.get(&key).await? {
            if let Some(existing) = self.hydrate(&key, &raw).await? {
                debug!(task_id = ?existing.id(), "duplicate submission, keeping stored record");
                return Ok(existing);
            }
        }

        task.schedule.validate()?;
        let ttl = task.resolve_ttl(self.clock.now())?;
        self.submit(task, ttl).await
    }

    /// Put an already known task back on its queue right away, skipping the
    /// duplicate guard. Used when a TTL trigger fires and by rescues.
    pub async fn resubmit(&self, mut task: TaskRecord) -> Result<TaskRecord, CadenceError> {
        task.mark_due();
        self.submit(task, 0).await
    }

    async fn submit(&self, mut task: TaskRecord, ttl: u64) -> Result<TaskRecord, CadenceError> {
        task.set_key_prefix(&self.config.key_prefix);
        let (id, key, ttl_key) = self.keys_of(&task)?;
        let status = task.mark_submitted(ttl);

        let mut batch = Batch::new();
        batch.set(&key, task.serialize()?);
        match status {
            TaskStatus::Delayed => {
                batch.set_px(&ttl_key, &key, ttl);
            }
            _ => {
                batch
                    .lrem(&task.queue, id.as_str())
                    .rpush(&task.queue, id.as_str());
            }
        }
        if self.config.track_ids {
            let ids = self.list_key(TrackingList::Ids);
            batch.lrem(&ids, id.as_str()).rpush(&ids, id.as_str());
        }
        self.store.exec(batch).await?;

        info!(task_id = %id, queue = %task.queue, status = %status, ttl_ms = ttl, "task submitted");
        self.emit(TaskEvent::Created { task: task.clone() });
        Ok(task)
    }

    // ----- reads -----

    pub async fn get_task(&self, id: &TaskId) -> Result<Option<TaskRecord>, CadenceError> {
        let key = self.record_key(id);
        match self.store.get(&key).await? {
            Some(raw) => self.hydrate(&key, &raw).await,
            None => Ok(None),
        }
    }

    /// Bulk read; ids without a record are skipped.
    pub async fn get_tasks(&self, ids: &[TaskId]) -> Result<Vec<TaskRecord>, CadenceError> {
        let keys: Vec<String> = ids.iter().map(|id| self.record_key(id)).collect();
        let values = self.store.get_many(&keys).await?;

        let mut tasks = Vec::with_capacity(keys.len());
        for (key, raw) in keys.iter().zip(values) {
            let Some(raw) = raw else {
                continue;
            };
            if let Some(task) = self.hydrate(key, &raw).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    /// Parse a stored record. Malformed records are quarantined and `None` is returned.
    async fn hydrate(&self, key: &str, raw: &str) -> Result<Option<TaskRecord>, CadenceError> {
        match TaskRecord::from_serialized(raw, &self.defaults) {
            Ok(task) => Ok(Some(task)),
            Err(e) => {
                self.quarantine(key, raw, &e.to_string()).await?;
                Ok(None)
            }
        }
    }

    async fn quarantine(&self, key: &str, raw: &str, reason: &str) -> Result<(), CadenceError> {
        let mut batch = Batch::new();
        batch
            .rpush(self.list_key(TrackingList::Quarantine), raw)
            .del(key)
            .del(format!("{key}:ttl"));
        if let Some(id) = key
            .strip_prefix(self.config.key_prefix.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
        {
            batch.lrem(self.list_key(TrackingList::Active), id);
        }
        self.store.exec(batch).await?;

        warn!(key = %key, error = %reason, "malformed task record quarantined");
        self.emit(TaskEvent::Quarantined {
            key: key.to_string(),
            raw: raw.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    // ----- worker hand-off -----

    /// Block until `queue` has an id, claim it onto the active list and load it.
    ///
    /// Ids whose record has vanished (or was quarantined) are dropped from the
    /// active list and the wait goes on.
    pub async fn wait_for_task(&self, queue: &str) -> Result<TaskRecord, CadenceError> {
        loop {
            let id = self.claim_next(queue).await?;
            if let Some(task) = self.load_claimed(queue, &id).await? {
                return Ok(task);
            }
        }
    }

    /// Block until `queue` has an id and move it onto the active list.
    ///
    /// The move is a single store command, so dropping this future while it
    /// waits claims nothing on the in-memory store. On Redis a `BLMOVE` already
    /// sent may still land; `purge_tasks` recovers such ids.
    pub async fn claim_next(&self, queue: &str) -> Result<TaskId, CadenceError> {
        let active = self.list_key(TrackingList::Active);
        let raw_id = self.store.blocking_move(queue, &active).await?;
        Ok(TaskId::new(raw_id))
    }

    /// Load a claimed id. A dangling id is dropped from the active list and
    /// `None` is returned.
    pub async fn load_claimed(
        &self,
        queue: &str,
        id: &TaskId,
    ) -> Result<Option<TaskRecord>, CadenceError> {
        if let Some(task) = self.get_task(id).await? {
            debug!(task_id = %id, queue = %queue, "task claimed");
            return Ok(Some(task));
        }

        warn!(task_id = %id, queue = %queue, "dangling id in queue, dropping");
        let mut batch = Batch::new();
        batch.lrem(self.list_key(TrackingList::Active), id.as_str());
        self.store.exec(batch).await?;
        Ok(None)
    }

    /// Book a successful execution.
    pub async fn commit(&self, task: &mut TaskRecord) -> Result<TaskStatus, CadenceError> {
        let now = self.clock.now();
        task.complete(true, now);
        let status = task.update_state(Stage::Commit, &self.config.backoff, None, now)?;
        self.persist_transition(task, status).await?;
        Ok(status)
    }

    /// Book a failed execution.
    pub async fn handle_error(
        &self,
        task: &mut TaskRecord,
        error: &HandlerError,
    ) -> Result<TaskStatus, CadenceError> {
        let now = self.clock.now();
        task.complete(false, now);
        task.fail(error, now);

        let record = task.errors().back().cloned().unwrap_or_else(|| error.to_record());
        self.emit(TaskEvent::Error {
            task: task.clone(),
            error: record,
        });

        let status =
            task.update_state(Stage::Error, &self.config.backoff, Some(error), now)?;
        self.persist_transition(task, status).await?;

        if status == TaskStatus::Failed {
            self.emit(TaskEvent::Failed { task: task.clone() });
        }
        Ok(status)
    }

    async fn persist_transition(
        &self,
        task: &TaskRecord,
        status: TaskStatus,
    ) -> Result<(), CadenceError> {
        let (id, key, ttl_key) = self.keys_of(task)?;
        let raw = task.serialize()?;

        let mut batch = Batch::new();
        batch
            .del(&ttl_key)
            .lrem(self.list_key(TrackingList::Active), id.as_str());

        match status {
            TaskStatus::Enqueued => {
                batch
                    .set(&key, raw)
                    .lrem(&task.queue, id.as_str())
                    .rpush(&task.queue, id.as_str());
            }
            TaskStatus::Delayed => {
                batch
                    .set(&key, raw)
                    .set_px(&ttl_key, &key, task.expire().max(1));
            }
            TaskStatus::Completed => {
                batch
                    .rpush(self.list_key(TrackingList::Completed), raw)
                    .del(&key);
            }
            TaskStatus::Failed => {
                batch
                    .rpush(self.list_key(TrackingList::Failed), raw)
                    .del(&key);
            }
        }

        debug!(task_id = %id, ops = batch.len(), "persist transition");
        self.store.exec(batch).await?;
        info!(
            task_id = %id,
            queue = %task.queue,
            status = %status,
            runs = task.runs(),
            error_count = task.error_count(),
            ttl_ms = task.expire(),
            "task transitioned"
        );
        Ok(())
    }

    // ----- administration -----

    /// Take a task off the active list and drop its trigger; `hard` also deletes
    /// the record and any queued copy of its id.
    pub async fn deactivate_task(&self, task: &TaskRecord, hard: bool) -> Result<(), CadenceError> {
        let (id, key, ttl_key) = self.keys_of(task)?;
        let mut batch = Batch::new();
        batch
            .lrem(self.list_key(TrackingList::Active), id.as_str())
            .del(&ttl_key);
        if hard {
            batch.del(&key).lrem(&task.queue, id.as_str());
        }
        self.store.exec(batch).await?;
        info!(task_id = %id, hard, "task deactivated");
        Ok(())
    }

    /// Like `deactivate_task`, by id. Works even when the record is gone.
    pub async fn deactivate_task_by_id(
        &self,
        id: &TaskId,
        hard: bool,
    ) -> Result<Option<TaskRecord>, CadenceError> {
        if let Some(task) = self.get_task(id).await? {
            self.deactivate_task(&task, hard).await?;
            return Ok(Some(task));
        }

        let key = self.record_key(id);
        let mut batch = Batch::new();
        batch
            .lrem(self.list_key(TrackingList::Active), id.as_str())
            .del(format!("{key}:ttl"));
        if hard {
            batch.del(&key);
        }
        self.store.exec(batch).await?;
        debug!(task_id = %id, "deactivated id without a record");
        Ok(None)
    }

    // ----- expirations -----

    /// Subscribe to expirations and resubmit delayed tasks whose trigger fired.
    ///
    /// When the subscription ends (store restart, dropped connection) the
    /// listener resubscribes with the configured backoff. After
    /// `RESUBSCRIBE_ATTEMPTS` failed attempts it gives up and the task
    /// resolves to the last error. Triggers that fire while unsubscribed are
    /// lost; `purge_tasks` does not see them either.
    pub async fn listen_for_expirations(
        self: &Arc<Self>,
    ) -> Result<JoinHandle<Result<(), CadenceError>>, CadenceError> {
        let mut expired = self.store.subscribe_expired().await?;
        let this = Arc::clone(self);
        info!(channel = %this.config.expired_key_events, "listening for task triggers");

        Ok(tokio::spawn(async move {
            loop {
                while let Some(trigger) = expired.recv().await {
                    if let Err(e) = this.on_trigger(&trigger).await {
                        warn!(key = %trigger, error = %e, "could not resubmit expired task");
                    }
                }
                warn!(channel = %this.config.expired_key_events, "expiration stream ended");
                expired = this.resubscribe().await?;
            }
        }))
    }

    async fn resubscribe(&self) -> Result<ExpiredKeys, CadenceError> {
        let mut attempt = 1;
        loop {
            let delay = self.config.backoff.compute(attempt);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            match self.store.subscribe_expired().await {
                Ok(expired) => {
                    info!(attempt, "resubscribed to task triggers");
                    return Ok(expired);
                }
                Err(e) if attempt < RESUBSCRIBE_ATTEMPTS => {
                    warn!(attempt, error = %e, "resubscribe failed");
                    attempt += 1;
                }
                Err(e) => {
                    error!(attempt, error = %e, "giving up on task triggers");
                    return Err(e.into());
                }
            }
        }
    }

    /// Handle one expired key.
    pub async fn on_trigger(&self, trigger: &str) -> Result<Option<TaskRecord>, CadenceError> {
        let Some(record_key) = self.record_key_for_trigger(trigger) else {
            return Ok(None);
        };
        let Some(raw) = self.store.get(record_key).await? else {
            debug!(key = %record_key, "trigger fired for a missing record");
            return Ok(None);
        };
        let Some(task) = self.hydrate(record_key, &raw).await? else {
            return Ok(None);
        };
        if task.status() != Some(TaskStatus::Delayed) {
            debug!(key = %record_key, status = ?task.status(), "trigger ignored, task not delayed");
            return Ok(None);
        }
        self.resubmit(task).await.map(Some)
    }

    // ----- introspection -----

    pub async fn list_range(
        &self,
        list: TrackingList,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, CadenceError> {
        Ok(self
            .store
            .list_range(&self.list_key(list), start, stop)
            .await?)
    }

    pub async fn list_len(&self, list: TrackingList) -> Result<usize, CadenceError> {
        Ok(self.store.list_len(&self.list_key(list)).await?)
    }

    pub async fn counts(&self) -> Result<TrackingCounts, CadenceError> {
        let mut counts = TrackingCounts::default();
        for list in TrackingList::ALL {
            counts.set(list, self.list_len(list).await?);
        }
        Ok(counts)
    }
}
