use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::TaskType;
use crate::error::{DroverError, HandlerError};

/// A handler for a specific task type.
///
/// Gets the raw payload so it can decode it however it likes (JSON, bytes...).
/// `cancel` is the pool's shutdown token; long handlers may watch it, but the
/// pool never interrupts them.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<(), HandlerError>;
}

/// Adapts an async closure into a [`TaskHandler`].
///
/// ```ignore
/// FnHandler::new(|payload, _cancel| async move {
///     println!("{}", String::from_utf8_lossy(&payload));
///     Ok(())
/// })
/// ```
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(Vec<u8>, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Vec<u8>, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<(), HandlerError> {
        (self.f)(payload.to_vec(), cancel.clone()).await
    }
}

/// Registry of handlers (task_type -> handler).
///
/// Design:
/// - Built during initialization (mutable).
/// - Shared read-only by every worker once the pool starts.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a task type. A second handler for the same
    /// type is rejected.
    pub fn register(
        &mut self,
        task_type: TaskType,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), DroverError> {
        if self.handlers.contains_key(&task_type) {
            return Err(DroverError::DuplicateHandler(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn get(&self, task_type: &TaskType) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(task_type)
    }

    /// Registered types, sorted.
    pub fn task_types(&self) -> Vec<&TaskType> {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
