//! Handler<T>: typed handlers and their type-erased adapter.

use std::marker::PhantomData;

use async_trait::async_trait;

use super::payload::TaskPayload;
use crate::app::registry::TaskHandler;
use crate::domain::{HandlerError, TaskRecord};

/// Handles payloads of one type.
///
/// # Example
/// ```ignore
/// struct FetchPageHandler;
///
/// #[async_trait]
/// impl Handler<FetchPage> for FetchPageHandler {
///     async fn handle(&self, page: FetchPage, _task: &TaskRecord) -> Result<(), HandlerError> {
///         println!("fetching {}", page.url);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: TaskPayload>: Send + Sync {
    async fn handle(&self, payload: T, task: &TaskRecord) -> Result<(), HandlerError>;
}

/// Decodes `task.data` into `T` before calling the typed handler.
///
/// A payload that doesn't decode fails the attempt with code 422.
pub struct TypedHandler<T: TaskPayload, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: TaskPayload, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: TaskPayload, H: Handler<T>> TaskHandler for TypedHandler<T, H> {
    async fn handle(&self, task: &TaskRecord) -> Result<(), HandlerError> {
        let payload: T = serde_json::from_value(task.data.clone())?;
        self.handler.handle(payload, task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DECODE_ERROR_CODE, ErrorCode};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct FetchPage {
        url: String,
    }

    impl TaskPayload for FetchPage {
        const QUEUE: &'static str = "test.fetch";
    }

    struct FetchPageHandler;

    #[async_trait]
    impl Handler<FetchPage> for FetchPageHandler {
        async fn handle(&self, page: FetchPage, _task: &TaskRecord) -> Result<(), HandlerError> {
            if page.url.starts_with("https://") {
                Ok(())
            } else {
                Err(HandlerError::new("insecure url").fatal())
            }
        }
    }

    #[tokio::test]
    async fn typed_handler_decodes_the_payload() {
        let handler = TypedHandler::<FetchPage, _>::new(FetchPageHandler);
        let task = TaskRecord::new().with_data(json!({ "url": "https://example.com" }));
        handler.handle(&task).await.unwrap();

        let task = TaskRecord::new().with_data(json!({ "url": "http://example.com" }));
        let err = handler.handle(&task).await.unwrap_err();
        assert!(err.fatal);
    }

    #[tokio::test]
    async fn undecodable_payload_fails_with_422() {
        let handler = TypedHandler::<FetchPage, _>::new(FetchPageHandler);
        let task = TaskRecord::new().with_data(json!({ "href": 1 }));

        let err = handler.handle(&task).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Numeric(DECODE_ERROR_CODE));
        assert!(!err.fatal);
    }
}
