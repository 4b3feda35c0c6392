//! Scheduler: the public surface for submitting and managing tasks.
//!
//! A scheduler owns the coordinator that listens for expired TTL triggers;
//! creating one starts that listener, and `shutdown` (or dropping it) stops it.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::app::coordinator::Coordinator;
use crate::app::status::{TrackingCounts, TrackingList};
use crate::config::CadenceConfig;
use crate::domain::{TaskDefaults, TaskEvent, TaskId, TaskRecord, TaskSpec};
use crate::error::CadenceError;
use crate::impls::BroadcastEventSink;
use crate::ports::{Store, StoreError};
use crate::typed::TaskPayload;

/// Anything `add_task` accepts: a ready record or a definition.
pub trait IntoTask {
    fn into_task(self, defaults: &TaskDefaults) -> TaskRecord;
}

impl IntoTask for TaskRecord {
    fn into_task(self, _defaults: &TaskDefaults) -> TaskRecord {
        self
    }
}

impl IntoTask for TaskSpec {
    fn into_task(self, defaults: &TaskDefaults) -> TaskRecord {
        self.into_record(defaults)
    }
}

/// What `purge_tasks` did with the active list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    /// Claimed ids whose record still existed; put back on their queue.
    pub rescued: Vec<TaskId>,
    /// Claimed ids without a record; dropped.
    pub removed: Vec<TaskId>,
}

pub struct Scheduler {
    coordinator: Arc<Coordinator>,
    events: BroadcastEventSink,
    /// `None` once its exit has been reported by `listener_stopped`.
    listener: Option<JoinHandle<Result<(), CadenceError>>>,
}

impl Scheduler {
    /// Scheduler with its own coordinator and event channel.
    pub async fn new(store: Arc<dyn Store>, config: CadenceConfig) -> Result<Self, CadenceError> {
        config.validate()?;
        let events = BroadcastEventSink::default();
        let coordinator =
            Coordinator::new(store, config).with_event_sink(Arc::new(events.clone()));
        Self::start(Arc::new(coordinator), events).await
    }

    /// Scheduler around an existing coordinator; `events` must be the sink the
    /// coordinator emits to for `subscribe` to see anything.
    pub async fn start(
        coordinator: Arc<Coordinator>,
        events: BroadcastEventSink,
    ) -> Result<Self, CadenceError> {
        let listener = coordinator.listen_for_expirations().await?;
        Ok(Self {
            coordinator,
            events,
            listener: Some(listener),
        })
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Stop listening for TTL triggers.
    pub fn shutdown(&self) {
        if let Some(listener) = &self.listener {
            listener.abort();
        }
        info!("scheduler stopped");
    }

    /// Resolves once the expiration listener has stopped on its own, with the
    /// error that stopped it. Without a listener delayed tasks never come back,
    /// so long-running processes should treat this as fatal.
    ///
    /// Never resolves after `shutdown`, or once the exit was already reported.
    pub async fn listener_stopped(&mut self) -> Result<(), CadenceError> {
        let Some(listener) = self.listener.as_mut() else {
            return std::future::pending().await;
        };
        let exit = listener.await;
        self.listener = None;
        match exit {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => std::future::pending().await,
            Err(e) => Err(CadenceError::Store(StoreError::Connection(format!(
                "expiration listener crashed: {e}"
            )))),
        }
    }

    // ----- submission -----

    pub async fn add_task(&self, task: impl IntoTask) -> Result<TaskRecord, CadenceError> {
        let task = task.into_task(self.coordinator.task_defaults());
        self.coordinator.add_task(task).await
    }

    /// Submit to an explicit queue.
    pub async fn add_task_to(
        &self,
        task: impl IntoTask,
        queue: impl Into<String>,
    ) -> Result<TaskRecord, CadenceError> {
        let task = task
            .into_task(self.coordinator.task_defaults())
            .with_queue(queue);
        self.coordinator.add_task(task).await
    }

    /// Submit a typed payload to `T::QUEUE`.
    pub async fn add_payload<T: TaskPayload>(
        &self,
        payload: &T,
    ) -> Result<TaskRecord, CadenceError> {
        let task = TaskRecord::with_defaults(self.coordinator.task_defaults())
            .with_queue(T::QUEUE)
            .with_data(serde_json::to_value(payload)?);
        self.coordinator.add_task(task).await
    }

    // ----- reads -----

    pub async fn get_task(&self, id: &TaskId) -> Result<Option<TaskRecord>, CadenceError> {
        self.coordinator.get_task(id).await
    }

    pub async fn get_tasks(&self, ids: &[TaskId]) -> Result<Vec<TaskRecord>, CadenceError> {
        self.coordinator.get_tasks(ids).await
    }

    // ----- administration -----

    /// Drop the task from the active list and cancel its trigger. The record stays.
    pub async fn deactivate_task(&self, id: &TaskId) -> Result<Option<TaskRecord>, CadenceError> {
        self.coordinator.deactivate_task_by_id(id, false).await
    }

    /// Deactivate and delete the record.
    pub async fn delete_task(&self, id: &TaskId) -> Result<Option<TaskRecord>, CadenceError> {
        self.coordinator.deactivate_task_by_id(id, true).await
    }

    /// Deactivate and put straight back on its queue. `None` if there is no record.
    pub async fn rescue_task(&self, id: &TaskId) -> Result<Option<TaskRecord>, CadenceError> {
        match self.coordinator.deactivate_task_by_id(id, false).await? {
            Some(task) => {
                let task = self.coordinator.resubmit(task).await?;
                info!(task_id = %id, "task rescued");
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// Sweep the active list: rescue claimed tasks that still have a record,
    /// drop ids that don't.
    ///
    /// Meant for recovery after workers crashed; a task a live worker is still
    /// running would be handed out a second time.
    pub async fn purge_tasks(&self) -> Result<PurgeReport, CadenceError> {
        let mut report = PurgeReport::default();
        for raw_id in self
            .coordinator
            .list_range(TrackingList::Active, 0, -1)
            .await?
        {
            let id = TaskId::new(raw_id);
            if self.rescue_task(&id).await?.is_some() {
                report.rescued.push(id);
            } else {
                report.removed.push(id);
            }
        }
        info!(
            rescued = report.rescued.len(),
            removed = report.removed.len(),
            "active list purged"
        );
        Ok(report)
    }

    // ----- introspection -----

    pub async fn get_active_tasks(
        &self,
        start: isize,
        stop: isize,
    ) -> Result<Vec<TaskId>, CadenceError> {
        self.ids_in(TrackingList::Active, start, stop).await
    }

    pub async fn get_all_task_ids(
        &self,
        start: isize,
        stop: isize,
    ) -> Result<Vec<TaskId>, CadenceError> {
        self.ids_in(TrackingList::Ids, start, stop).await
    }

    pub async fn get_failed_tasks(
        &self,
        start: isize,
        stop: isize,
    ) -> Result<Vec<TaskRecord>, CadenceError> {
        self.records_in(TrackingList::Failed, start, stop).await
    }

    pub async fn get_completed_tasks(
        &self,
        start: isize,
        stop: isize,
    ) -> Result<Vec<TaskRecord>, CadenceError> {
        self.records_in(TrackingList::Completed, start, stop).await
    }

    /// Raw text of quarantined records.
    pub async fn get_quarantined(
        &self,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, CadenceError> {
        self.coordinator
            .list_range(TrackingList::Quarantine, start, stop)
            .await
    }

    pub async fn counts(&self) -> Result<TrackingCounts, CadenceError> {
        self.coordinator.counts().await
    }

    async fn ids_in(
        &self,
        list: TrackingList,
        start: isize,
        stop: isize,
    ) -> Result<Vec<TaskId>, CadenceError> {
        Ok(self
            .coordinator
            .list_range(list, start, stop)
            .await?
            .into_iter()
            .map(TaskId::new)
            .collect())
    }

    async fn records_in(
        &self,
        list: TrackingList,
        start: isize,
        stop: isize,
    ) -> Result<Vec<TaskRecord>, CadenceError> {
        let defaults = self.coordinator.task_defaults();
        let mut records = Vec::new();
        for raw in self.coordinator.list_range(list, start, stop).await? {
            match TaskRecord::from_serialized(&raw, defaults) {
                Ok(task) => records.push(task),
                Err(e) => warn!(list = %list, error = %e, "unreadable archived record"),
            }
        }
        Ok(records)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(listener) = &self.listener {
            listener.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Schedule, TaskStatus};
    use crate::impls::InMemoryStore;
    use crate::ports::Batch;
    use serde::Deserialize;

    async fn scheduler() -> (InMemoryStore, Scheduler) {
        let store = InMemoryStore::new();
        let scheduler = Scheduler::new(Arc::new(store.clone()), CadenceConfig::default())
            .await
            .unwrap();
        (store, scheduler)
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Digest {
        to: String,
    }

    impl TaskPayload for Digest {
        const QUEUE: &'static str = "mail.digest";
    }

    #[tokio::test]
    async fn specs_pick_up_configured_defaults() {
        let (store, scheduler) = scheduler().await;
        let task = scheduler
            .add_task(TaskSpec::new(serde_json::json!({"n": 1})).with_id("s1"))
            .await
            .unwrap();

        assert_eq!(task.queue, "tasks");
        assert_eq!(store.list_range("tasks", 0, -1).await.unwrap(), vec!["s1"]);
    }

    #[tokio::test]
    async fn explicit_queue_wins() {
        let (store, scheduler) = scheduler().await;
        scheduler
            .add_task_to(TaskRecord::new().with_id("q1"), "reports")
            .await
            .unwrap();
        assert_eq!(store.list_len("reports").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn payloads_go_to_their_queue() {
        let (store, scheduler) = scheduler().await;
        let task = scheduler
            .add_payload(&Digest {
                to: "ops@example.com".into(),
            })
            .await
            .unwrap();

        assert_eq!(task.queue, "mail.digest");
        assert_eq!(task.data["to"], "ops@example.com");
        assert_eq!(store.list_len("mail.digest").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn subscribers_see_created_events() {
        let (_store, scheduler) = scheduler().await;
        let mut events = scheduler.subscribe();
        scheduler
            .add_task(TaskRecord::new().with_id("e1"))
            .await
            .unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.name(), "task.created");
    }

    #[tokio::test]
    async fn delete_removes_the_record() {
        let (store, scheduler) = scheduler().await;
        scheduler
            .add_task(
                TaskRecord::new()
                    .with_id("d1")
                    .with_schedule(Schedule::Delay(60_000)),
            )
            .await
            .unwrap();

        let deleted = scheduler.delete_task(&TaskId::new("d1")).await.unwrap();
        assert!(deleted.is_some());
        assert!(!store.contains_key("tasks:d1").await);
        assert!(!store.contains_key("tasks:d1:ttl").await);
        assert!(
            scheduler
                .get_task(&TaskId::new("d1"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn rescue_requeues_a_stuck_task() {
        let (store, scheduler) = scheduler().await;
        scheduler
            .add_task(TaskRecord::new().with_id("stuck"))
            .await
            .unwrap();
        scheduler
            .coordinator()
            .wait_for_task("tasks")
            .await
            .unwrap();
        assert_eq!(
            scheduler.get_active_tasks(0, -1).await.unwrap(),
            vec![TaskId::new("stuck")]
        );

        let rescued = scheduler
            .rescue_task(&TaskId::new("stuck"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(rescued.status(), Some(TaskStatus::Enqueued));
        assert!(scheduler.get_active_tasks(0, -1).await.unwrap().is_empty());
        assert_eq!(store.list_range("tasks", 0, -1).await.unwrap(), vec!["stuck"]);
    }

    #[tokio::test]
    async fn purge_rescues_and_removes() {
        let (store, scheduler) = scheduler().await;
        scheduler
            .add_task(TaskRecord::new().with_id("alive"))
            .await
            .unwrap();
        scheduler
            .coordinator()
            .wait_for_task("tasks")
            .await
            .unwrap();
        let mut batch = Batch::new();
        batch.rpush("tasks:active", "ghost");
        store.exec(batch).await.unwrap();

        let report = scheduler.purge_tasks().await.unwrap();

        assert_eq!(report.rescued, vec![TaskId::new("alive")]);
        assert_eq!(report.removed, vec![TaskId::new("ghost")]);
        assert_eq!(scheduler.counts().await.unwrap().active, 0);
        assert_eq!(store.list_range("tasks", 0, -1).await.unwrap(), vec!["alive"]);
    }

    #[tokio::test]
    async fn archived_logs_are_parsed() {
        let (_store, scheduler) = scheduler().await;
        scheduler
            .add_task(TaskRecord::new().with_id("done"))
            .await
            .unwrap();
        let mut task = scheduler
            .coordinator()
            .wait_for_task("tasks")
            .await
            .unwrap();
        scheduler.coordinator().commit(&mut task).await.unwrap();

        let completed = scheduler.get_completed_tasks(0, -1).await.unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id().map(TaskId::as_str), Some("done"));
        assert!(scheduler.get_failed_tasks(0, -1).await.unwrap().is_empty());
        assert_eq!(
            scheduler.get_all_task_ids(0, -1).await.unwrap(),
            vec![TaskId::new("done")]
        );
    }

    #[tokio::test]
    async fn plain_records_follow_the_configured_prefix() {
        let store = InMemoryStore::new();
        let config = CadenceConfig {
            key_prefix: "jobs".to_string(),
            ..CadenceConfig::default()
        };
        let scheduler = Scheduler::new(Arc::new(store.clone()), config)
            .await
            .unwrap();

        scheduler
            .add_task_to(TaskRecord::new().with_id("p1"), "reports")
            .await
            .unwrap();

        assert!(store.contains_key("jobs:p1").await);
        assert!(!store.contains_key("tasks:p1").await);
        let task = scheduler.get_task(&TaskId::new("p1")).await.unwrap().unwrap();
        assert_eq!(task.queue, "reports");
        let claimed = scheduler.coordinator().wait_for_task("reports").await.unwrap();
        assert_eq!(claimed.id().map(TaskId::as_str), Some("p1"));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_trigger_stream_is_reported() {
        let (store, mut scheduler) = scheduler().await;

        store.close().await;

        let result = scheduler.listener_stopped().await;
        assert!(matches!(
            result,
            Err(CadenceError::Store(StoreError::Closed))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_stream_is_resubscribed() {
        let (store, scheduler) = scheduler().await;
        let mut events = scheduler.subscribe();

        store.drop_subscriptions().await;
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;

        scheduler
            .add_task(
                TaskRecord::new()
                    .with_id("later")
                    .with_schedule(Schedule::Delay(1000)),
            )
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap().name(), "task.created");

        // the resubmission after the trigger fires is a second `task.created`
        let resubmitted = events.recv().await.unwrap();
        assert_eq!(resubmitted.name(), "task.created");
        assert_eq!(
            resubmitted.task().and_then(TaskRecord::status),
            Some(TaskStatus::Enqueued)
        );
        assert_eq!(store.list_range("tasks", 0, -1).await.unwrap(), vec!["later"]);
    }

    #[tokio::test]
    async fn invalid_config_is_refused() {
        let config = CadenceConfig {
            key_prefix: String::new(),
            ..CadenceConfig::default()
        };
        let result = Scheduler::new(Arc::new(InMemoryStore::new()), config).await;
        assert!(matches!(result, Err(CadenceError::Config(_))));
    }
}
