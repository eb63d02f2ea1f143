use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::AgingPolicy;
use super::aging::decode_member;
use crate::error::DroverError;
use crate::ports::{Clock, StoreAdapter};

/// Result of one rescore pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RescoreStats {
    /// Members seen in the snapshot.
    pub scanned: usize,
    /// Members whose stored score changed.
    pub updated: usize,
    /// Members that could not be decoded and kept their old score.
    pub skipped: usize,
}

/// Periodically rewrites every pending member's score to its effective
/// priority at tick time.
///
/// Only members still present are rewritten, so a task popped between the
/// snapshot and the write is never put back.
pub struct AgingScheduler {
    store: Arc<dyn StoreAdapter>,
    collection: String,
    policy: AgingPolicy,
    clock: Arc<dyn Clock>,
}

impl AgingScheduler {
    pub fn new(
        store: Arc<dyn StoreAdapter>,
        collection: impl Into<String>,
        policy: AgingPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            policy,
            clock,
        }
    }

    /// One snapshot → recompute → batch update pass.
    pub async fn tick(&self) -> Result<RescoreStats, DroverError> {
        let now = self.clock.now();
        let members = self.store.snapshot(&self.collection).await?;

        let mut stats = RescoreStats {
            scanned: members.len(),
            ..RescoreStats::default()
        };
        let mut updates = Vec::with_capacity(members.len());
        for (member, _) in members {
            match decode_member(&member) {
                Ok(task) => {
                    let score = self.policy.effective_priority(&task, now);
                    updates.push((member, score));
                }
                Err(e) => {
                    stats.skipped += 1;
                    warn!(collection = %self.collection, error = %e, "skipping undecodable member");
                }
            }
        }

        stats.updated = self
            .store
            .rescore_batch(&self.collection, &updates)
            .await?;
        Ok(stats)
    }

    /// Tick every `rescore_interval` until `cancel` fires.
    ///
    /// A failed tick is logged and the loop keeps going; the next tick
    /// catches up because scores are recomputed from `created_at`.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.policy.rescore_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let tick = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = self.tick() => res,
            };
            match tick {
                Ok(stats) if stats.scanned > 0 => {
                    debug!(
                        collection = %self.collection,
                        scanned = stats.scanned,
                        updated = stats.updated,
                        skipped = stats.skipped,
                        "rescored"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(collection = %self.collection, error = %e, "rescore tick failed"),
            }
        }
        info!(collection = %self.collection, "aging scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::aging::encode_member;
    use crate::domain::{Priority, Task, TaskId, TaskType};
    use crate::impls::MemoryStore;
    use crate::ports::ManualClock;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::time::Duration;
    use ulid::Ulid;

    fn setup(factor: f64) -> (Arc<MemoryStore>, Arc<ManualClock>, AgingScheduler) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let scheduler = AgingScheduler::new(
            store.clone(),
            "q",
            AgingPolicy::new(factor, Duration::from_millis(10)),
            clock.clone(),
        );
        (store, clock, scheduler)
    }

    async fn push(store: &MemoryStore, clock: &ManualClock, priority: Priority) -> String {
        let task = Task::new_at(
            TaskId::from_ulid(Ulid::new()),
            TaskType::new("report").unwrap(),
            priority,
            Vec::new(),
            clock.now(),
        );
        let member = encode_member(&task).unwrap();
        store
            .push_sorted("q", &member, priority.base_score())
            .await
            .unwrap();
        member
    }

    #[tokio::test]
    async fn undecodable_members_are_skipped() {
        let (store, clock, scheduler) = setup(1.0);
        push(&store, &clock, Priority::LOW).await;
        store.push_sorted("q", "garbage", 3.0).await.unwrap();

        clock.advance(ChronoDuration::seconds(2));
        let stats = scheduler.tick().await.unwrap();
        assert_eq!(
            stats,
            RescoreStats {
                scanned: 2,
                updated: 1,
                skipped: 1
            }
        );
    }

    #[tokio::test]
    async fn popped_members_are_not_resurrected() {
        let (store, clock, scheduler) = setup(1.0);
        let member = push(&store, &clock, Priority::LOW).await;
        let cancel = CancellationToken::new();

        // pop lands between snapshot and write
        let snapshot = store.snapshot("q").await.unwrap();
        let (popped, _) = store.pop_max_blocking("q", &cancel).await.unwrap();
        assert_eq!(popped, member);
        let updated = store
            .rescore_batch("q", &[(snapshot[0].0.clone(), 99.0)])
            .await
            .unwrap();
        assert_eq!(updated, 0);

        clock.advance(ChronoDuration::seconds(5));
        scheduler.tick().await.unwrap();
        assert_eq!(store.len("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn outage_is_reported_then_recovered() {
        let (store, clock, scheduler) = setup(1.0);
        push(&store, &clock, Priority::LOW).await;

        store.set_unavailable(true);
        assert!(matches!(
            scheduler.tick().await,
            Err(DroverError::BrokerUnavailable(_))
        ));

        store.set_unavailable(false);
        clock.advance(ChronoDuration::seconds(3));
        assert_eq!(scheduler.tick().await.unwrap().updated, 1);
        let snapshot = store.snapshot("q").await.unwrap();
        assert!((snapshot[0].1 - 4.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let (_store, _clock, scheduler) = setup(0.1);
        let cancel = CancellationToken::new();
        let join = tokio::spawn(Arc::new(scheduler).run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), join)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
