//! Broker: the queue abstraction between producers and the worker pool.
//!
//! Two strategies share one contract:
//! - [`FifoBroker`]: strict insertion order.
//! - [`PriorityAgingBroker`]: highest effective priority first, where waiting
//!   raises priority over time (see [`AgingPolicy`]).
//!
//! The strategy is picked once, when [`QueueBroker::from_config`] builds the
//! broker; call sites only see `dyn Broker`.

mod aging;
mod fifo;
mod scheduler;

pub use self::aging::{AgingPolicy, PriorityAgingBroker};
pub use self::fifo::FifoBroker;
pub use self::scheduler::{AgingScheduler, RescoreStats};

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{BrokerConfig, BrokerStrategy};
use crate::domain::Task;
use crate::error::DroverError;
use crate::ports::{Clock, StoreAdapter};

/// Broker port.
///
/// - `enqueue` は複数 producer から同時に呼んでよい。Ok を返したタスクは失われない
/// - `dequeue` はタスクが来るか `cancel` が発火するまで待つ
/// - `close` は冪等
#[async_trait]
pub trait Broker: Send + Sync {
    /// Validate and store a pending task.
    async fn enqueue(&self, task: &Task) -> Result<(), DroverError>;

    /// Wait for the next task in strategy order. The returned task is Active.
    ///
    /// Fails with `Cancelled` when `cancel` fires first and with
    /// `BrokerUnavailable` when the store cannot be reached.
    async fn dequeue(
        &self,
        consumer_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Task, DroverError>;

    /// Number of tasks still waiting.
    async fn pending(&self) -> Result<usize, DroverError>;

    /// Release store resources and stop background work. Idempotent.
    async fn close(&self) -> Result<(), DroverError>;
}

/// The two broker strategies as one closed type.
pub enum QueueBroker {
    Fifo(FifoBroker),
    PriorityAging(PriorityAgingBroker),
}

impl QueueBroker {
    /// Build the configured strategy over `store`.
    ///
    /// The aging scheduler (priority strategy only) stops when `shutdown`
    /// fires or the broker is closed. Must be called inside a tokio runtime.
    pub fn from_config(
        config: &BrokerConfig,
        collection: impl Into<String>,
        store: Arc<dyn StoreAdapter>,
        clock: Arc<dyn Clock>,
        shutdown: &CancellationToken,
    ) -> Self {
        match config.strategy {
            BrokerStrategy::Fifo => QueueBroker::Fifo(FifoBroker::new(store, collection)),
            BrokerStrategy::PriorityAging => {
                QueueBroker::PriorityAging(PriorityAgingBroker::start(
                    store,
                    collection,
                    AgingPolicy::from_config(config),
                    clock,
                    shutdown,
                ))
            }
        }
    }

    /// Build the configured strategy for a process that only enqueues.
    ///
    /// No aging scheduler is started, so a short-lived producer does not
    /// rescan the shared collection. Needs no runtime.
    pub fn for_producer(
        config: &BrokerConfig,
        collection: impl Into<String>,
        store: Arc<dyn StoreAdapter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        match config.strategy {
            BrokerStrategy::Fifo => QueueBroker::Fifo(FifoBroker::new(store, collection)),
            BrokerStrategy::PriorityAging => {
                QueueBroker::PriorityAging(PriorityAgingBroker::without_scheduler(
                    store,
                    collection,
                    AgingPolicy::from_config(config),
                    clock,
                ))
            }
        }
    }

    pub fn strategy(&self) -> BrokerStrategy {
        match self {
            QueueBroker::Fifo(_) => BrokerStrategy::Fifo,
            QueueBroker::PriorityAging(_) => BrokerStrategy::PriorityAging,
        }
    }

    fn inner(&self) -> &dyn Broker {
        match self {
            QueueBroker::Fifo(b) => b,
            QueueBroker::PriorityAging(b) => b,
        }
    }
}

#[async_trait]
impl Broker for QueueBroker {
    async fn enqueue(&self, task: &Task) -> Result<(), DroverError> {
        self.inner().enqueue(task).await
    }

    async fn dequeue(
        &self,
        consumer_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Task, DroverError> {
        self.inner().dequeue(consumer_id, cancel).await
    }

    async fn pending(&self) -> Result<usize, DroverError> {
        self.inner().pending().await
    }

    async fn close(&self) -> Result<(), DroverError> {
        self.inner().close().await
    }
}
