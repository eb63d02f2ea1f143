use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::Broker;
use crate::domain::{Task, TaskStatus, codec};
use crate::error::DroverError;
use crate::ports::StoreAdapter;

/// Strict insertion order over a fifo collection.
pub struct FifoBroker {
    store: Arc<dyn StoreAdapter>,
    collection: String,
    closed: AtomicBool,
}

impl FifoBroker {
    pub fn new(store: Arc<dyn StoreAdapter>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), DroverError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DroverError::BrokerUnavailable("broker closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for FifoBroker {
    async fn enqueue(&self, task: &Task) -> Result<(), DroverError> {
        self.ensure_open()?;
        task.validate()?;
        let record = codec::encode(task)?;
        self.store.push_fifo(&self.collection, &record).await?;
        debug!(task_id = %task.id(), task_type = %task.task_type(), "enqueued (fifo)");
        Ok(())
    }

    async fn dequeue(
        &self,
        consumer_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Task, DroverError> {
        self.ensure_open()?;
        let record = self
            .store
            .pop_fifo_blocking(&self.collection, cancel)
            .await?;
        let mut task = codec::decode(&record).inspect_err(|e| {
            error!(consumer = consumer_id, error = %e, "dropping undecodable record");
        })?;
        task.transition(TaskStatus::Active)?;
        debug!(consumer = consumer_id, task_id = %task.id(), "dequeued (fifo)");
        Ok(task)
    }

    async fn pending(&self) -> Result<usize, DroverError> {
        Ok(self.store.len(&self.collection).await?)
    }

    async fn close(&self) -> Result<(), DroverError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.store.close().await?;
        Ok(())
    }
}
