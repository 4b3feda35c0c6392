//! Worker runtime: drain one queue, one task at a time.
//!
//! Loop: claim -> load -> `task.added` -> handler -> `commit` + `task.ran`,
//! or `handle_error` on failure. A failing handler never stops the loop; only
//! a failure to dequeue does.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::app::coordinator::Coordinator;
use crate::app::registry::{HandlerRegistry, TaskHandler};
use crate::domain::{TaskEvent, TaskRecord, TaskStatus, WorkerCounters};
use crate::error::CadenceError;

pub struct Worker {
    coordinator: Arc<Coordinator>,
    queue: String,
    handler: Arc<dyn TaskHandler>,
    counters: WorkerCounters,
}

impl Worker {
    pub fn new(
        coordinator: Arc<Coordinator>,
        queue: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        Self {
            coordinator,
            queue: queue.into(),
            handler,
            counters: WorkerCounters::default(),
        }
    }

    /// Worker for `queue` using the handler registered for it.
    pub fn from_registry(
        coordinator: Arc<Coordinator>,
        registry: &HandlerRegistry,
        queue: &str,
    ) -> Result<Self, CadenceError> {
        let handler = registry.require(queue)?;
        Ok(Self::new(coordinator, queue, handler))
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn counters(&self) -> WorkerCounters {
        self.counters
    }

    /// Process tasks until dequeuing fails.
    pub async fn run(&mut self) -> Result<(), CadenceError> {
        info!(queue = %self.queue, "worker started");
        loop {
            let task = self.dequeue().await?;
            self.process(task).await;
        }
    }

    /// Like `run`, but also return once `shutdown` turns `true`.
    ///
    /// The signal only races the claim itself. Once an id sits on the active
    /// list its record is loaded and its handler finished and booked.
    pub async fn run_until(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<WorkerCounters, CadenceError> {
        info!(queue = %self.queue, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let claimed = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // sender gone, nobody can stop us anymore
                        break;
                    }
                    continue;
                }
                claimed = self.coordinator.claim_next(&self.queue) => claimed,
            };
            let id = claimed
                .inspect_err(|e| error!(queue = %self.queue, error = %e, "dequeue failed"))?;

            let loaded = self
                .coordinator
                .load_claimed(&self.queue, &id)
                .await
                .inspect_err(|e| {
                    error!(task_id = %id, queue = %self.queue, error = %e, "load failed");
                })?;
            if let Some(task) = loaded {
                self.process(task).await;
            }
        }

        info!(
            queue = %self.queue,
            runs = self.counters.runs,
            errors = self.counters.errors,
            failed = self.counters.failed,
            "worker stopped"
        );
        Ok(self.counters)
    }

    async fn dequeue(&self) -> Result<TaskRecord, CadenceError> {
        self.coordinator
            .wait_for_task(&self.queue)
            .await
            .inspect_err(|e| error!(queue = %self.queue, error = %e, "dequeue failed"))
    }

    async fn process(&mut self, task: TaskRecord) {
        let task_id = task.id().cloned();
        if let Err(e) = self.execute(task).await {
            // record stays on the active list; purge_tasks can rescue it
            error!(task_id = ?task_id, queue = %self.queue, error = %e, "task bookkeeping failed");
        }
    }

    async fn execute(&mut self, mut task: TaskRecord) -> Result<(), CadenceError> {
        self.coordinator.emit(TaskEvent::Added {
            task: task.clone(),
            counters: self.counters,
        });
        self.counters.runs += 1;
        task.start(self.coordinator.now());

        match self.handler.handle(&task).await {
            Ok(()) => {
                self.coordinator.commit(&mut task).await?;
                self.coordinator.emit(TaskEvent::Ran {
                    task,
                    counters: self.counters,
                });
            }
            Err(failure) => {
                self.counters.errors += 1;
                warn!(
                    task_id = ?task.id(),
                    queue = %self.queue,
                    error = %failure,
                    "handler failed"
                );
                let status = self.coordinator.handle_error(&mut task, &failure).await?;
                if status == TaskStatus::Failed {
                    self.counters.failed += 1;
                }
            }
        }
        Ok(())
    }
}

/// A set of workers sharing one coordinator and one shutdown signal.
///
/// Dropping the group without `shutdown_and_join` aborts every worker.
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: JoinSet<Result<WorkerCounters, CadenceError>>,
}

impl WorkerGroup {
    /// Start `concurrency` workers for every queue in `registry`.
    pub fn spawn(
        coordinator: Arc<Coordinator>,
        registry: Arc<HandlerRegistry>,
        concurrency: usize,
    ) -> Result<Self, CadenceError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut joins = JoinSet::new();

        for queue in registry.queues() {
            for _ in 0..concurrency.max(1) {
                let mut worker =
                    Worker::from_registry(Arc::clone(&coordinator), &registry, &queue)?;
                let rx = shutdown_rx.clone();
                joins.spawn(async move { worker.run_until(rx).await });
            }
        }

        info!(
            queues = registry.len(),
            workers = joins.len(),
            "worker group started"
        );
        Ok(Self { shutdown_tx, joins })
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Ask every worker to stop once it is idle.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the next worker to exit. `None` once all have exited.
    pub async fn next_exit(&mut self) -> Option<Result<WorkerCounters, CadenceError>> {
        loop {
            match self.joins.join_next().await? {
                Ok(result) => return Some(result),
                Err(e) => error!(error = %e, "worker task aborted"),
            }
        }
    }

    /// Stop all workers and return their summed counters, or the first error.
    pub async fn shutdown_and_join(mut self) -> Result<WorkerCounters, CadenceError> {
        self.request_shutdown();
        let mut total = WorkerCounters::default();
        let mut first_error = None;
        while let Some(result) = self.next_exit().await {
            match result {
                Ok(counters) => {
                    total.runs += counters.runs;
                    total.errors += counters.errors;
                    total.failed += counters.failed;
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    use crate::app::registry::handler_fn;
    use crate::app::scheduler::Scheduler;
    use crate::config::CadenceConfig;
    use crate::domain::{HandlerError, Limit, Schedule, TaskId};
    use crate::impls::{BroadcastEventSink, InMemoryStore};
    use crate::ports::Store;
    use tokio::sync::{Mutex, broadcast};

    struct Harness {
        store: InMemoryStore,
        events: BroadcastEventSink,
        scheduler: Scheduler,
    }

    async fn harness() -> Harness {
        let store = InMemoryStore::new();
        let events = BroadcastEventSink::default();
        let mut config = CadenceConfig::default();
        config.backoff = config.backoff.without_jitter();
        let coordinator = Coordinator::new(Arc::new(store.clone()), config)
            .with_event_sink(Arc::new(events.clone()));
        let scheduler = Scheduler::start(Arc::new(coordinator), events.clone())
            .await
            .unwrap();
        Harness {
            store,
            events,
            scheduler,
        }
    }

    fn ok_handler() -> Arc<dyn TaskHandler> {
        Arc::new(handler_fn(|_task: TaskRecord| async { Ok(()) }))
    }

    fn failing_handler() -> Arc<dyn TaskHandler> {
        Arc::new(handler_fn(|_task: TaskRecord| async {
            Err(HandlerError::new("boom"))
        }))
    }

    async fn next_named(rx: &mut broadcast::Receiver<TaskEvent>, name: &str) -> TaskEvent {
        loop {
            let event = rx.recv().await.unwrap();
            if event.name() == name {
                return event;
            }
        }
    }

    fn spawn_worker(
        h: &Harness,
        handler: Arc<dyn TaskHandler>,
    ) -> tokio::task::JoinHandle<Result<(), CadenceError>> {
        let mut worker = Worker::new(Arc::clone(h.scheduler.coordinator()), "tasks", handler);
        tokio::spawn(async move { worker.run().await })
    }

    #[tokio::test]
    async fn single_run_task_is_completed() {
        let h = harness().await;
        let mut events = h.events.subscribe();
        let worker = spawn_worker(&h, ok_handler());

        h.scheduler
            .add_task(
                TaskRecord::new()
                    .with_id("t1")
                    .with_max_runs(1)
                    .with_max_tries(3),
            )
            .await
            .unwrap();

        let ran = next_named(&mut events, "task.ran").await;
        assert_eq!(ran.counters().unwrap().runs, 1);
        assert_eq!(ran.task().unwrap().status(), Some(TaskStatus::Completed));

        assert!(!h.store.contains_key("tasks:t1").await);
        let completed = h.scheduler.get_completed_tasks(0, -1).await.unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].runs(), 1);
        assert!(h.scheduler.get_active_tasks(0, -1).await.unwrap().is_empty());

        worker.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn task_fails_after_max_tries() {
        let h = harness().await;
        let mut events = h.events.subscribe();
        let worker = spawn_worker(&h, failing_handler());

        h.scheduler
            .add_task(TaskRecord::new().with_id("t2").with_max_tries(2))
            .await
            .unwrap();

        // first failure is retried after the backoff, second one is final
        let first = next_named(&mut events, "task.error").await;
        assert_eq!(first.task().unwrap().error_count(), 1);
        let failed = next_named(&mut events, "task.failed").await;
        assert_eq!(failed.task().unwrap().total_errors(), 2);

        let archived = h.scheduler.get_failed_tasks(0, -1).await.unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].total_errors(), 2);
        assert_eq!(archived[0].status(), Some(TaskStatus::Failed));
        assert!(!h.store.contains_key("tasks:t2").await);
        assert!(h.scheduler.get_active_tasks(0, -1).await.unwrap().is_empty());

        worker.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_schedule_reruns_after_its_trigger() {
        let h = harness().await;
        let mut events = h.events.subscribe();
        let worker = spawn_worker(&h, ok_handler());

        let task = h
            .scheduler
            .add_task(
                TaskRecord::new()
                    .with_id("t3")
                    .with_schedule(Schedule::Delay(5000))
                    .with_max_runs(Limit::Unbounded),
            )
            .await
            .unwrap();
        assert_eq!(task.status(), Some(TaskStatus::Delayed));

        let first = next_named(&mut events, "task.ran").await;
        assert_eq!(first.task().unwrap().status(), Some(TaskStatus::Delayed));
        assert!(h.store.contains_key("tasks:t3:ttl").await);

        let second = next_named(&mut events, "task.ran").await;
        assert_eq!(second.task().unwrap().runs(), 2);
        assert_eq!(second.counters().unwrap().runs, 2);

        worker.abort();
    }

    #[tokio::test]
    async fn two_workers_never_share_a_task() {
        let h = harness().await;
        let seen = Arc::new(Mutex::new(Vec::<TaskId>::new()));
        let handler: Arc<dyn TaskHandler> = {
            let seen = Arc::clone(&seen);
            Arc::new(handler_fn(move |task: TaskRecord| {
                let seen = Arc::clone(&seen);
                async move {
                    if let Some(id) = task.id() {
                        seen.lock().await.push(id.clone());
                    }
                    tokio::task::yield_now().await;
                    Ok(())
                }
            }))
        };
        let mut registry = HandlerRegistry::new();
        registry.register("tasks", handler).unwrap();
        let group = WorkerGroup::spawn(
            Arc::clone(h.scheduler.coordinator()),
            Arc::new(registry),
            2,
        )
        .unwrap();
        assert_eq!(group.len(), 2);

        for n in 0..20 {
            h.scheduler
                .add_task(TaskRecord::new().with_id(format!("c{n}")))
                .await
                .unwrap();
        }

        while h.scheduler.counts().await.unwrap().completed < 20 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let counters = group.shutdown_and_join().await.unwrap();
        assert_eq!(counters.runs, 20);

        let seen = seen.lock().await;
        let unique: HashSet<_> = seen.iter().collect();
        assert_eq!(seen.len(), 20);
        assert_eq!(unique.len(), 20);
    }

    #[tokio::test]
    async fn dequeue_failure_ends_the_loop() {
        let h = harness().await;
        let worker = spawn_worker(&h, ok_handler());
        tokio::task::yield_now().await;

        h.store.close().await;

        let result = worker.await.unwrap();
        assert!(matches!(result, Err(CadenceError::Store(_))));
    }

    #[tokio::test]
    async fn shutdown_stops_idle_workers() {
        let h = harness().await;
        let mut registry = HandlerRegistry::new();
        registry.register("tasks", ok_handler()).unwrap();
        registry.register("reports", failing_handler()).unwrap();

        let group = WorkerGroup::spawn(
            Arc::clone(h.scheduler.coordinator()),
            Arc::new(registry),
            1,
        )
        .unwrap();
        assert_eq!(group.len(), 2);

        let counters = group.shutdown_and_join().await.unwrap();
        assert_eq!(counters, WorkerCounters::default());
    }

    #[tokio::test]
    async fn shutdown_racing_a_new_task_never_strands_it() {
        for round in 0..20 {
            let h = harness().await;
            let (tx, rx) = watch::channel(false);
            let mut worker =
                Worker::new(Arc::clone(h.scheduler.coordinator()), "tasks", ok_handler());
            let join = tokio::spawn(async move { worker.run_until(rx).await });
            tokio::task::yield_now().await;

            h.scheduler
                .add_task(TaskRecord::new().with_id(format!("r{round}")))
                .await
                .unwrap();
            tx.send(true).unwrap();

            let counters = join.await.unwrap().unwrap();
            assert!(h.scheduler.get_active_tasks(0, -1).await.unwrap().is_empty());
            let queued = h.store.list_len("tasks").await.unwrap();
            let completed = h.scheduler.counts().await.unwrap().completed;
            assert_eq!(queued + completed, 1);
            assert_eq!(counters.runs, completed as u64);
        }
    }

    #[tokio::test]
    async fn tasks_added_after_shutdown_stay_queued() {
        let h = harness().await;
        let (tx, rx) = watch::channel(false);
        let mut worker = Worker::new(Arc::clone(h.scheduler.coordinator()), "tasks", ok_handler());
        let join = tokio::spawn(async move { worker.run_until(rx).await });
        tokio::task::yield_now().await;

        tx.send(true).unwrap();
        let counters = join.await.unwrap().unwrap();
        assert_eq!(counters, WorkerCounters::default());

        h.scheduler
            .add_task(TaskRecord::new().with_id("late"))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(raw_queue(&h.store, "tasks").await, vec!["late"]);
        assert!(h.scheduler.get_active_tasks(0, -1).await.unwrap().is_empty());
    }

    async fn raw_queue(store: &InMemoryStore, key: &str) -> Vec<String> {
        store.list_range(key, 0, -1).await.unwrap()
    }

    #[tokio::test]
    async fn unknown_queue_is_a_registry_error() {
        let h = harness().await;
        let registry = HandlerRegistry::new();
        let result = Worker::from_registry(
            Arc::clone(h.scheduler.coordinator()),
            &registry,
            "nowhere",
        );
        assert!(matches!(result, Err(CadenceError::Registry(_))));
    }

    #[tokio::test]
    async fn failed_handler_does_not_stop_the_worker() {
        let h = harness().await;
        let mut events = h.events.subscribe();
        let handler: Arc<dyn TaskHandler> = Arc::new(handler_fn(|task: TaskRecord| async move {
            if task.data["ok"] == true {
                Ok(())
            } else {
                Err(HandlerError::new("bad input").fatal())
            }
        }));
        let worker = spawn_worker(&h, handler);

        h.scheduler
            .add_task(TaskRecord::new().with_id("bad"))
            .await
            .unwrap();
        h.scheduler
            .add_task(
                TaskRecord::new()
                    .with_id("good")
                    .with_data(serde_json::json!({"ok": true})),
            )
            .await
            .unwrap();

        let failed = next_named(&mut events, "task.failed").await;
        assert_eq!(failed.task().unwrap().id().map(TaskId::as_str), Some("bad"));
        let ran = next_named(&mut events, "task.ran").await;
        let counters = ran.counters().unwrap();
        assert_eq!(counters.runs, 2);
        assert_eq!(counters.errors, 1);
        assert_eq!(counters.failed, 1);
        assert_eq!(h.store.list_len("tasks:failed").await.unwrap(), 1);

        worker.abort();
    }
}
