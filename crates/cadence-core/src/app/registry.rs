use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{HandlerError, TaskRecord};
use crate::error::RegistryError;
use crate::typed::{Handler, TaskPayload, TypedHandler};

/// Executes one task. Returning `Err` counts as a failed attempt.
///
/// The handler sees the hydrated record; `task.data` is the caller's payload,
/// untouched.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &TaskRecord) -> Result<(), HandlerError>;
}

/// Registry of handlers (queue -> handler).
///
/// Design:
/// - Built during initialization (mutable).
/// - Used during runtime (immutable, shared behind `Arc`).
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register the handler draining `queue`.
    pub fn register(
        &mut self,
        queue: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RegistryError> {
        let queue = queue.into();
        if self.handlers.contains_key(&queue) {
            return Err(RegistryError::DuplicateHandler(queue));
        }
        self.handlers.insert(queue, handler);
        Ok(())
    }

    /// Register a typed handler on `T::QUEUE`.
    pub fn register_typed<T, H>(&mut self, handler: H) -> Result<(), RegistryError>
    where
        T: TaskPayload,
        H: Handler<T> + 'static,
    {
        self.register(T::QUEUE, Arc::new(TypedHandler::<T, H>::new(handler)))
    }

    pub fn get(&self, queue: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(queue)
    }

    pub fn require(&self, queue: &str) -> Result<Arc<dyn TaskHandler>, RegistryError> {
        self.get(queue)
            .cloned()
            .ok_or_else(|| RegistryError::HandlerNotFound(queue.to_string()))
    }

    /// Registered queue names, sorted.
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.handlers.keys().cloned().collect();
        queues.sort_unstable();
        queues
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Handler built from an async closure. See `handler_fn`.
pub struct FnHandler<F> {
    f: F,
}

/// Adapt `Fn(TaskRecord) -> impl Future<Output = Result<(), HandlerError>>` into a `TaskHandler`.
///
/// The closure receives its own copy of the record.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskRecord) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskRecord) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, task: &TaskRecord) -> Result<(), HandlerError> {
        (self.f)(task.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OkHandler;

    #[async_trait]
    impl TaskHandler for OkHandler {
        async fn handle(&self, _task: &TaskRecord) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn registered_handler_runs() {
        let mut reg = HandlerRegistry::new();
        reg.register("ok", Arc::new(OkHandler)).unwrap();

        let handler = reg.require("ok").unwrap();
        handler.handle(&TaskRecord::new()).await.unwrap();
        assert_eq!(reg.queues(), vec!["ok"]);
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let mut reg = HandlerRegistry::new();
        reg.register("ok", Arc::new(OkHandler)).unwrap();
        let err = reg.register("ok", Arc::new(OkHandler)).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateHandler("ok".to_string()));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn missing_handler_is_reported() {
        let reg = HandlerRegistry::new();
        let err = reg.require("missing").err().unwrap();
        assert!(err.to_string().contains("missing"));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn closures_become_handlers() {
        let handler = handler_fn(|task: TaskRecord| async move {
            if task.data.is_null() {
                Err(HandlerError::new("no payload"))
            } else {
                Ok(())
            }
        });

        assert!(handler.handle(&TaskRecord::new()).await.is_err());
        let with_data = TaskRecord::new().with_data(serde_json::json!({"n": 1}));
        assert!(handler.handle(&with_data).await.is_ok());
    }
}
