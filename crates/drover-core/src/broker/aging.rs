//! Priority-aging broker.
//!
//! effective priority = base priority + waited seconds × aging factor
//!
//! Any waiting task's score grows without bound, so it eventually outranks
//! fresher tasks of any base priority: no starvation.
//!
//! Scores live in the store, so they are only as fresh as the last rescore
//! tick (see [`AgingScheduler`]). The staleness bound is
//! `aging_factor × rescore_interval`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{AgingScheduler, Broker};
use crate::config::BrokerConfig;
use crate::domain::{Task, TaskStatus, codec};
use crate::error::DroverError;
use crate::ports::{Clock, StoreAdapter};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgingPolicy {
    /// Priority gained per second of waiting. Never negative.
    pub aging_factor: f64,

    /// Rescore tick interval (Δt).
    pub rescore_interval: Duration,
}

impl AgingPolicy {
    pub fn new(aging_factor: f64, rescore_interval: Duration) -> Self {
        Self {
            aging_factor: aging_factor.max(0.0),
            rescore_interval,
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(config.aging_factor, config.rescore_interval())
    }

    pub fn effective_priority(&self, task: &Task, now: DateTime<Utc>) -> f64 {
        task.priority().base_score() + task.waited_seconds(now) * self.aging_factor
    }

    /// Maximum gap between a stored score and the exact effective priority.
    pub fn staleness_bound(&self) -> f64 {
        self.aging_factor * self.rescore_interval.as_secs_f64()
    }
}

impl Default for AgingPolicy {
    fn default() -> Self {
        Self::new(0.1, Duration::from_secs(1))
    }
}

/// Sorted-collection member: `<order key>|<task record>`.
///
/// Sorted collections break score ties by member bytes, greatest first. The
/// order key is a fixed-width decimal that is larger for older tasks, so
/// equal scores pop oldest first.
pub(crate) fn encode_member(task: &Task) -> Result<String, DroverError> {
    Ok(format!(
        "{:020}|{}",
        order_key(task.created_at()),
        codec::encode(task)?
    ))
}

/// Strictly decreasing in `created_at` over the nanosecond range
/// (1677-09-21 to 2262-04-11). Times outside it clamp to the nearest end.
fn order_key(created_at: DateTime<Utc>) -> u64 {
    let nanos = match created_at.timestamp_nanos_opt() {
        Some(nanos) => nanos,
        None if created_at.timestamp() < 0 => i64::MIN,
        None => i64::MAX,
    };
    // flip the sign bit: i64 order becomes u64 order
    let biased = (nanos as u64) ^ (1 << 63);
    u64::MAX - biased
}

pub(crate) fn decode_member(member: &str) -> Result<Task, DroverError> {
    let record = member.split_once('|').map_or(member, |(_, record)| record);
    codec::decode(record)
}

pub struct PriorityAgingBroker {
    store: Arc<dyn StoreAdapter>,
    collection: String,
    policy: AgingPolicy,
    scheduler: Arc<AgingScheduler>,
    scheduler_cancel: CancellationToken,
    scheduler_join: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PriorityAgingBroker {
    /// Build the broker and spawn its aging scheduler.
    ///
    /// The scheduler stops on `close()` or when `shutdown` fires.
    pub fn start(
        store: Arc<dyn StoreAdapter>,
        collection: impl Into<String>,
        policy: AgingPolicy,
        clock: Arc<dyn Clock>,
        shutdown: &CancellationToken,
    ) -> Self {
        let broker = Self::assemble(
            store,
            collection.into(),
            policy,
            clock,
            shutdown.child_token(),
        );
        let join = tokio::spawn(
            Arc::clone(&broker.scheduler).run(broker.scheduler_cancel.clone()),
        );
        *broker
            .scheduler_join
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(join);
        info!(
            collection = %broker.collection,
            aging_factor = policy.aging_factor,
            interval_ms = policy.rescore_interval.as_millis() as u64,
            "priority-aging broker started"
        );
        broker
    }

    /// Build the broker with no background scheduler.
    ///
    /// For processes that only enqueue, such as a one-shot submit. Scores
    /// change only through [`rescore_now`](Self::rescore_now); the workers'
    /// scheduler keeps the shared collection aged.
    pub fn without_scheduler(
        store: Arc<dyn StoreAdapter>,
        collection: impl Into<String>,
        policy: AgingPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::assemble(
            store,
            collection.into(),
            policy,
            clock,
            CancellationToken::new(),
        )
    }

    fn assemble(
        store: Arc<dyn StoreAdapter>,
        collection: String,
        policy: AgingPolicy,
        clock: Arc<dyn Clock>,
        scheduler_cancel: CancellationToken,
    ) -> Self {
        let scheduler = Arc::new(AgingScheduler::new(
            Arc::clone(&store),
            collection.clone(),
            policy,
            clock,
        ));
        Self {
            store,
            collection,
            policy,
            scheduler,
            scheduler_cancel,
            scheduler_join: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Whether a background scheduler is attached.
    pub fn has_scheduler(&self) -> bool {
        self.scheduler_join
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    pub fn policy(&self) -> AgingPolicy {
        self.policy
    }

    /// Run one rescore pass now instead of waiting for the next tick.
    pub async fn rescore_now(&self) -> Result<super::RescoreStats, DroverError> {
        self.ensure_open()?;
        self.scheduler.tick().await
    }

    /// Pending members with their stored scores, highest first.
    pub async fn ranking(&self) -> Result<Vec<(Task, f64)>, DroverError> {
        let members = self.store.snapshot(&self.collection).await?;
        members
            .into_iter()
            .map(|(member, score)| Ok((decode_member(&member)?, score)))
            .collect()
    }

    fn ensure_open(&self) -> Result<(), DroverError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DroverError::BrokerUnavailable("broker closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for PriorityAgingBroker {
    async fn enqueue(&self, task: &Task) -> Result<(), DroverError> {
        self.ensure_open()?;
        task.validate()?;
        let member = encode_member(task)?;
        // wait time is zero at enqueue; the next tick folds in age
        let score = task.priority().base_score();
        self.store
            .push_sorted(&self.collection, &member, score)
            .await?;
        debug!(
            task_id = %task.id(),
            task_type = %task.task_type(),
            score,
            "enqueued (priority-aging)"
        );
        Ok(())
    }

    async fn dequeue(
        &self,
        consumer_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Task, DroverError> {
        self.ensure_open()?;
        let (member, score) = self
            .store
            .pop_max_blocking(&self.collection, cancel)
            .await?;
        let mut task = decode_member(&member).inspect_err(|e| {
            error!(consumer = consumer_id, error = %e, "dropping undecodable member");
        })?;
        task.transition(TaskStatus::Active)?;
        debug!(consumer = consumer_id, task_id = %task.id(), score, "dequeued (priority-aging)");
        Ok(task)
    }

    async fn pending(&self) -> Result<usize, DroverError> {
        Ok(self.store.len(&self.collection).await?)
    }

    async fn close(&self) -> Result<(), DroverError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.scheduler_cancel.cancel();
        let join = self
            .scheduler_join
            .lock()
            .map(|mut slot| slot.take())
            .unwrap_or_default();
        if let Some(join) = join
            && let Err(e) = join.await
        {
            warn!(error = %e, "aging scheduler ended abnormally");
        }
        self.store.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Priority, TaskId, TaskType};
    use crate::impls::MemoryStore;
    use crate::ports::ManualClock;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn task_at(priority: Priority, created_at: DateTime<Utc>) -> Task {
        Task::new_at(
            TaskId::from_ulid(Ulid::new()),
            TaskType::new("report").unwrap(),
            priority,
            Vec::new(),
            created_at,
        )
    }

    /// Broker whose background ticks never fire during a test.
    fn broker(clock: Arc<ManualClock>, factor: f64) -> PriorityAgingBroker {
        PriorityAgingBroker::start(
            Arc::new(MemoryStore::new()),
            "q",
            AgingPolicy::new(factor, Duration::from_secs(3600)),
            clock,
            &CancellationToken::new(),
        )
    }

    #[test]
    fn effective_priority_grows_linearly() {
        let policy = AgingPolicy::new(0.1, Duration::from_secs(1));
        let task = task_at(Priority::LOW, t0());
        assert_eq!(policy.effective_priority(&task, t0()), 1.0);
        let later = t0() + ChronoDuration::seconds(90);
        assert!((policy.effective_priority(&task, later) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn negative_factor_is_clamped() {
        assert_eq!(AgingPolicy::new(-1.0, Duration::from_secs(1)).aging_factor, 0.0);
    }

    #[test]
    fn older_members_sort_higher() {
        let old = encode_member(&task_at(Priority::LOW, t0())).unwrap();
        let new = encode_member(&task_at(Priority::LOW, t0() + ChronoDuration::nanoseconds(1)))
            .unwrap();
        assert!(old > new);
    }

    #[test]
    fn order_key_holds_before_the_epoch() {
        let epoch = Utc.timestamp_opt(0, 0).unwrap();
        let older = task_at(Priority::LOW, epoch - ChronoDuration::days(365));
        let newer = task_at(Priority::LOW, epoch - ChronoDuration::days(1));
        let after = task_at(Priority::LOW, epoch + ChronoDuration::days(1));
        let (older, newer, after) = (
            encode_member(&older).unwrap(),
            encode_member(&newer).unwrap(),
            encode_member(&after).unwrap(),
        );
        assert!(older > newer);
        assert!(newer > after);
    }

    #[test]
    fn out_of_range_times_clamp_to_the_ends() {
        let ancient = Utc.with_ymd_and_hms(1000, 1, 1, 0, 0, 0).unwrap();
        let far = Utc.with_ymd_and_hms(3000, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(order_key(ancient), u64::MAX);
        assert_eq!(order_key(far), 0);
        // still ordered against in-range times
        assert!(order_key(ancient) > order_key(t0()));
        assert!(order_key(t0()) > order_key(far));
        assert_eq!(format!("{:020}", order_key(ancient)).len(), 20);
    }

    #[test]
    fn member_roundtrip() {
        let task = task_at(Priority::HIGH, t0());
        assert_eq!(decode_member(&encode_member(&task).unwrap()).unwrap(), task);
    }

    #[tokio::test]
    async fn higher_priority_first_without_aging() {
        let clock = Arc::new(ManualClock::new(t0()));
        let broker = broker(clock, 0.0);
        let cancel = CancellationToken::new();
        let low = task_at(Priority::LOW, t0());
        let high = task_at(Priority::HIGH, t0() + ChronoDuration::seconds(1));
        broker.enqueue(&low).await.unwrap();
        broker.enqueue(&high).await.unwrap();

        assert_eq!(broker.dequeue("c", &cancel).await.unwrap().id(), high.id());
        assert_eq!(broker.dequeue("c", &cancel).await.unwrap().id(), low.id());
    }

    #[tokio::test]
    async fn ties_go_to_the_oldest_task() {
        let clock = Arc::new(ManualClock::new(t0()));
        let broker = broker(clock, 0.0);
        let cancel = CancellationToken::new();
        let newer = task_at(Priority::MEDIUM, t0() + ChronoDuration::milliseconds(5));
        let older = task_at(Priority::MEDIUM, t0());
        broker.enqueue(&newer).await.unwrap();
        broker.enqueue(&older).await.unwrap();

        assert_eq!(broker.dequeue("c", &cancel).await.unwrap().id(), older.id());
        assert_eq!(broker.dequeue("c", &cancel).await.unwrap().id(), newer.id());
    }

    #[tokio::test]
    async fn rescore_folds_in_wait_time() {
        let clock = Arc::new(ManualClock::new(t0()));
        let broker = broker(Arc::clone(&clock), 0.5);
        broker.enqueue(&task_at(Priority::LOW, t0())).await.unwrap();

        clock.advance(ChronoDuration::seconds(4));
        let stats = broker.rescore_now().await.unwrap();
        assert_eq!(stats.scanned, 1);
        assert_eq!(stats.updated, 1);

        let ranking = broker.ranking().await.unwrap();
        assert_eq!(ranking.len(), 1);
        assert!((ranking[0].1 - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn enqueue_only_broker_never_rescores_on_its_own() {
        let clock = Arc::new(ManualClock::new(t0()));
        let broker = PriorityAgingBroker::without_scheduler(
            Arc::new(MemoryStore::new()),
            "q",
            AgingPolicy::new(1.0, Duration::from_millis(10)),
            clock.clone(),
        );
        assert!(!broker.has_scheduler());
        broker.enqueue(&task_at(Priority::LOW, t0())).await.unwrap();

        clock.advance(ChronoDuration::seconds(30));
        // several intervals pass with nothing rescoring
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.ranking().await.unwrap()[0].1, 1.0);

        broker.rescore_now().await.unwrap();
        assert!((broker.ranking().await.unwrap()[0].1 - 31.0).abs() < 1e-9);
        broker.close().await.unwrap();
    }

    #[tokio::test]
    async fn closed_broker_refuses_rescore() {
        let clock = Arc::new(ManualClock::new(t0()));
        let broker = broker(clock, 0.1);
        broker.close().await.unwrap();
        broker.close().await.unwrap();
        assert!(matches!(
            broker.rescore_now().await,
            Err(DroverError::BrokerUnavailable(_))
        ));
    }
}
