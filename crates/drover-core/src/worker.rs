//! Worker pool: N consumer loops sharing one broker and one handler registry.
//!
//! Each slot runs `Idle → Dequeuing → Dispatching → Idle` until the shutdown
//! token fires, then ends in `Stopped`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::config::WorkerConfig;
use crate::domain::{Task, TaskType};
use crate::error::DroverError;
use crate::observability::{PoolCounts, StatusBoard};
use crate::runtime::{HandlerRegistry, TaskHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Dequeuing = 1,
    Dispatching = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Idle,
            1 => WorkerState::Dequeuing,
            2 => WorkerState::Dispatching,
            _ => WorkerState::Stopped,
        }
    }
}

/// What `start` returns once every loop has exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolReport {
    pub workers: usize,
    /// Loops still running after the shutdown grace period.
    pub aborted: usize,
    pub counts: PoolCounts,
}

/// State shared by every loop of one pool.
struct Shared {
    pool_id: String,
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    board: Arc<StatusBoard>,
    states: Vec<AtomicU8>,
    error_backoff: Duration,
}

impl Shared {
    fn set_state(&self, slot: usize, state: WorkerState) {
        self.states[slot].store(state as u8, Ordering::SeqCst);
    }

    async fn dispatch(&self, worker: &str, task: Task, cancel: &CancellationToken) {
        note(self.board.track(&task));

        let Some(handler) = self.registry.get(task.task_type()) else {
            let err = DroverError::UnregisteredType(task.task_type().clone());
            warn!(
                worker,
                task_id = %task.id(),
                task_type = %task.task_type(),
                "dropping task: no handler registered"
            );
            note(self.board.drop_task(task.id(), err.to_string()));
            return;
        };

        // in-flight handlers are never interrupted; they get the token to watch
        match handler.handle(cancel, task.payload()).await {
            Ok(()) => {
                debug!(worker, task_id = %task.id(), "task completed");
                note(self.board.complete(task.id()));
            }
            Err(source) => {
                let err = DroverError::Handler {
                    task_type: task.task_type().clone(),
                    source,
                };
                warn!(worker, task_id = %task.id(), error = %err, "task failed");
                note(self.board.fail(task.id(), err.to_string()));
            }
        }
    }
}

fn note(res: Result<(), DroverError>) {
    if let Err(e) = res {
        warn!(error = %e, "status board rejected update");
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    shutdown_grace: Duration,
}

impl WorkerPool {
    /// `concurrency` below 1 is raised to 1.
    pub fn new(
        id: impl Into<String>,
        broker: Arc<dyn Broker>,
        concurrency: usize,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self::assemble(
            id.into(),
            broker,
            concurrency,
            registry,
            WorkerConfig::DEFAULT_SHUTDOWN_GRACE,
            WorkerConfig::DEFAULT_ERROR_BACKOFF,
        )
    }

    fn assemble(
        pool_id: String,
        broker: Arc<dyn Broker>,
        concurrency: usize,
        registry: Arc<HandlerRegistry>,
        shutdown_grace: Duration,
        error_backoff: Duration,
    ) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            shared: Arc::new(Shared {
                pool_id,
                broker,
                registry,
                board: Arc::new(StatusBoard::new()),
                states: (0..concurrency)
                    .map(|_| AtomicU8::new(WorkerState::Idle as u8))
                    .collect(),
                error_backoff,
            }),
            shutdown_grace,
        }
    }

    pub fn builder(id: impl Into<String>, broker: Arc<dyn Broker>) -> WorkerPoolBuilder {
        WorkerPoolBuilder::new(id, broker)
    }

    pub fn id(&self) -> &str {
        &self.shared.pool_id
    }

    pub fn concurrency(&self) -> usize {
        self.shared.states.len()
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.shared.registry
    }

    pub fn status_board(&self) -> Arc<StatusBoard> {
        Arc::clone(&self.shared.board)
    }

    /// Current state of every slot, in slot order.
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.shared
            .states
            .iter()
            .map(|s| WorkerState::from_u8(s.load(Ordering::SeqCst)))
            .collect()
    }

    /// Run every loop until `cancel` fires, then drain.
    ///
    /// Loops that are still inside a handler get `shutdown_grace` to finish;
    /// after that they are aborted and counted in `PoolReport::aborted`.
    pub async fn start(&self, cancel: CancellationToken) -> PoolReport {
        let workers = self.concurrency();
        info!(
            pool = %self.shared.pool_id,
            workers,
            handlers = self.shared.registry.len(),
            "worker pool started"
        );

        let mut joins = Vec::with_capacity(workers);
        for slot in 0..workers {
            let shared = Arc::clone(&self.shared);
            let cancel = cancel.clone();
            joins.push(tokio::spawn(worker_loop(shared, slot, cancel)));
        }

        cancel.cancelled().await;
        info!(pool = %self.shared.pool_id, "shutdown requested, draining");

        let deadline = Instant::now() + self.shutdown_grace;
        let mut aborted = 0;
        for (slot, mut join) in joins.into_iter().enumerate() {
            match tokio::time::timeout_at(deadline, &mut join).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(pool = %self.shared.pool_id, slot, error = %e, "worker ended abnormally");
                    self.shared.set_state(slot, WorkerState::Stopped);
                }
                Err(_) => {
                    join.abort();
                    aborted += 1;
                    self.shared.set_state(slot, WorkerState::Stopped);
                    warn!(pool = %self.shared.pool_id, slot, "worker aborted after shutdown grace");
                }
            }
        }

        let counts = self.shared.board.counts();
        info!(
            pool = %self.shared.pool_id,
            completed = counts.completed,
            failed = counts.failed,
            dropped = counts.dropped,
            aborted,
            "worker pool stopped"
        );
        PoolReport {
            workers,
            aborted,
            counts,
        }
    }
}

async fn worker_loop(shared: Arc<Shared>, slot: usize, cancel: CancellationToken) {
    let worker = format!("{}-{}", shared.pool_id, slot);
    debug!(worker = %worker, "worker started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        shared.set_state(slot, WorkerState::Dequeuing);
        let task = match shared.broker.dequeue(&worker, &cancel).await {
            Ok(task) => task,
            Err(DroverError::Cancelled) => break,
            Err(e @ DroverError::Codec(_)) => {
                // the record is already gone from the store; nothing to retry
                warn!(worker = %worker, error = %e, "skipping undecodable task");
                shared.set_state(slot, WorkerState::Idle);
                continue;
            }
            Err(e) => {
                warn!(worker = %worker, error = %e, "dequeue failed, backing off");
                shared.set_state(slot, WorkerState::Idle);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(shared.error_backoff) => {}
                }
                continue;
            }
        };

        shared.set_state(slot, WorkerState::Dispatching);
        shared.dispatch(&worker, task, &cancel).await;
        shared.set_state(slot, WorkerState::Idle);
    }

    shared.set_state(slot, WorkerState::Stopped);
    debug!(worker = %worker, "worker stopped");
}

/// Collects handlers and options before the pool exists.
///
/// Registration is only possible here; a built pool's registry is frozen.
pub struct WorkerPoolBuilder {
    id: String,
    broker: Arc<dyn Broker>,
    registry: HandlerRegistry,
    concurrency: usize,
    shutdown_grace: Duration,
    error_backoff: Duration,
}

impl WorkerPoolBuilder {
    pub fn new(id: impl Into<String>, broker: Arc<dyn Broker>) -> Self {
        Self {
            id: id.into(),
            broker,
            registry: HandlerRegistry::new(),
            concurrency: WorkerConfig::DEFAULT_CONCURRENCY,
            shutdown_grace: WorkerConfig::DEFAULT_SHUTDOWN_GRACE,
            error_backoff: WorkerConfig::DEFAULT_ERROR_BACKOFF,
        }
    }

    /// Take id, concurrency and timings from a config section.
    pub fn from_config(config: &WorkerConfig, broker: Arc<dyn Broker>) -> Self {
        Self::new(config.id.clone(), broker)
            .concurrency(config.concurrency)
            .shutdown_grace(config.shutdown_grace())
            .error_backoff(config.error_backoff())
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn register_task(
        mut self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self, DroverError> {
        self.registry.register(TaskType::new(task_type)?, handler)?;
        Ok(self)
    }

    pub fn build(self) -> WorkerPool {
        WorkerPool::assemble(
            self.id,
            self.broker,
            self.concurrency,
            Arc::new(self.registry),
            self.shutdown_grace,
            self.error_backoff,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::FifoBroker;
    use crate::domain::Priority;
    use crate::error::HandlerError;
    use crate::impls::MemoryStore;
    use crate::runtime::FnHandler;
    use std::sync::atomic::AtomicUsize;

    fn fifo() -> (Arc<MemoryStore>, Arc<dyn Broker>) {
        let store = Arc::new(MemoryStore::new());
        let broker: Arc<dyn Broker> = Arc::new(FifoBroker::new(store.clone(), "q"));
        (store, broker)
    }

    fn task(ty: &str, payload: &[u8]) -> Task {
        Task::new(TaskType::new(ty).unwrap(), Priority::MEDIUM, payload.to_vec())
    }

    async fn wait_until(pool: &WorkerPool, done: impl Fn(PoolCounts) -> bool) {
        let board = pool.status_board();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done(board.counts()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pool did not reach expected counts");
    }

    #[tokio::test]
    async fn runs_handlers_and_reports_outcomes() {
        let (_store, broker) = fifo();
        let pool = Arc::new(
            WorkerPool::builder("w", broker.clone())
                .concurrency(2)
                .register_task(
                    "echo",
                    Arc::new(FnHandler::new(|payload: Vec<u8>, _| async move {
                        if payload == b"bad" {
                            Err(HandlerError::new("bad payload"))
                        } else {
                            Ok(())
                        }
                    })),
                )
                .unwrap()
                .build(),
        );

        broker.enqueue(&task("echo", b"a")).await.unwrap();
        broker.enqueue(&task("echo", b"bad")).await.unwrap();
        broker.enqueue(&task("unknown", b"")).await.unwrap();

        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let pool = pool.clone();
            let cancel = cancel.clone();
            async move { pool.start(cancel).await }
        });

        wait_until(&pool, |c| c.completed + c.failed + c.dropped == 3).await;
        cancel.cancel();
        let report = run.await.unwrap();

        assert_eq!(report.workers, 2);
        assert_eq!(report.aborted, 0);
        assert_eq!(
            report.counts,
            PoolCounts {
                active: 0,
                completed: 1,
                failed: 1,
                dropped: 1
            }
        );
        assert!(
            pool.worker_states()
                .iter()
                .all(|s| *s == WorkerState::Stopped)
        );
    }

    #[tokio::test]
    async fn idle_workers_wait_in_dequeue() {
        let (_store, broker) = fifo();
        let pool = Arc::new(WorkerPool::new("w", broker, 3, Arc::new(HandlerRegistry::new())));
        assert_eq!(pool.worker_states(), vec![WorkerState::Idle; 3]);

        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let pool = pool.clone();
            let cancel = cancel.clone();
            async move { pool.start(cancel).await }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while pool.worker_states() != vec![WorkerState::Dequeuing; 3] {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        run.await.unwrap();
        assert_eq!(pool.worker_states(), vec![WorkerState::Stopped; 3]);
    }

    #[tokio::test]
    async fn backs_off_during_outage_and_recovers() {
        let (store, broker) = fifo();
        let ran = Arc::new(AtomicUsize::new(0));
        let pool = Arc::new(
            WorkerPool::builder("w", broker.clone())
                .concurrency(1)
                .error_backoff(Duration::from_millis(10))
                .register_task(
                    "echo",
                    Arc::new(FnHandler::new({
                        let ran = ran.clone();
                        move |_, _| {
                            let ran = ran.clone();
                            async move {
                                ran.fetch_add(1, Ordering::SeqCst);
                                Ok::<(), HandlerError>(())
                            }
                        }
                    })),
                )
                .unwrap()
                .build(),
        );

        broker.enqueue(&task("echo", b"x")).await.unwrap();
        store.set_unavailable(true);

        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let pool = pool.clone();
            let cancel = cancel.clone();
            async move { pool.start(cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        store.set_unavailable(false);
        wait_until(&pool, |c| c.completed == 1).await;
        cancel.cancel();
        run.await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stragglers_are_aborted_after_grace() {
        let (_store, broker) = fifo();
        let pool = Arc::new(
            WorkerPool::builder("w", broker.clone())
                .concurrency(1)
                .shutdown_grace(Duration::from_millis(20))
                .register_task(
                    "slow",
                    Arc::new(FnHandler::new(|_, _| async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok::<(), HandlerError>(())
                    })),
                )
                .unwrap()
                .build(),
        );
        broker.enqueue(&task("slow", b"")).await.unwrap();

        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let pool = pool.clone();
            let cancel = cancel.clone();
            async move { pool.start(cancel).await }
        });
        wait_until(&pool, |c| c.active == 1).await;

        cancel.cancel();
        let report = run.await.unwrap();
        assert_eq!(report.aborted, 1);
        assert_eq!(report.counts.active, 1);
        assert_eq!(pool.worker_states(), vec![WorkerState::Stopped]);
    }

    #[test]
    fn duplicate_registration_fails_the_builder() {
        let (_store, broker) = fifo();
        let handler: Arc<dyn TaskHandler> =
            Arc::new(FnHandler::new(|_, _| async { Ok::<(), HandlerError>(()) }));
        let res = WorkerPool::builder("w", broker)
            .register_task("echo", handler.clone())
            .unwrap()
            .register_task("echo", handler);
        assert!(matches!(res, Err(DroverError::DuplicateHandler(_))));
    }
}
