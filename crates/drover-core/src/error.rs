use thiserror::Error;

use crate::domain::{TaskStatus, TaskType};
use crate::ports::StoreError;

#[derive(Debug, Error)]
pub enum DroverError {
    #[error("invalid task: {0}")]
    Validation(String),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("handler failed for task_type={task_type}: {source}")]
    Handler {
        task_type: TaskType,
        #[source]
        source: HandlerError,
    },

    #[error("handler not found for task_type={0}")]
    UnregisteredType(TaskType),

    #[error("duplicate handler for task_type={0}")]
    DuplicateHandler(TaskType),

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("task codec: {0}")]
    Codec(#[from] serde_json::Error),
}

impl DroverError {
    /// Shutdown is not an application failure; callers usually just stop.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DroverError::Cancelled)
    }
}

impl From<StoreError> for DroverError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Cancelled => DroverError::Cancelled,
            StoreError::Unavailable(msg) => DroverError::BrokerUnavailable(msg),
        }
    }
}

/// Error returned by a task handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self(format!("json decode: {err}"))
    }
}
