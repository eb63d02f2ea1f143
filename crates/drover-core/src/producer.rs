use std::sync::Arc;

use tracing::info;

use crate::broker::Broker;
use crate::domain::{Priority, Task, TaskId, TaskType};
use crate::error::DroverError;
use crate::ports::{Clock, IdGenerator};

/// Builds tasks and hands them to the broker.
///
/// Ids and `created_at` come from the injected generator and clock, so the
/// aging order of submitted tasks is reproducible in tests.
pub struct Producer {
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl Producer {
    pub fn new(broker: Arc<dyn Broker>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { broker, clock, ids }
    }

    pub async fn submit(
        &self,
        task_type: impl Into<String>,
        priority: Priority,
        payload: impl Into<Vec<u8>>,
    ) -> Result<TaskId, DroverError> {
        let task = Task::new_at(
            self.ids.generate_task_id(),
            TaskType::new(task_type)?,
            priority,
            payload,
            self.clock.now(),
        );
        self.broker.enqueue(&task).await?;
        info!(
            task_id = %task.id(),
            task_type = %task.task_type(),
            priority = %task.priority(),
            "task enqueued"
        );
        Ok(task.id())
    }

    /// Submit a JSON payload.
    pub async fn submit_json<T: serde::Serialize>(
        &self,
        task_type: impl Into<String>,
        priority: Priority,
        payload: &T,
    ) -> Result<TaskId, DroverError> {
        let bytes = serde_json::to_vec(payload)?;
        self.submit(task_type, priority, bytes).await
    }
}
