//! MemoryStore - 開発・テスト用の StoreAdapter
//!
//! Redis の sorted set / list と同じ意味論を 1 プロセス内で再現する。
//!
//! # 実装詳細
//! - すべての変更は std Mutex の同期クリティカルセクション内で完結
//!   （ロックを持ったまま await しない）
//! - blocking pop は tokio Notify で待つ。`enable()` してから中身を見るので
//!   push の通知を取りこぼさない
//! - 同点の並びは Redis と同じく member の辞書順（大きい方が先に pop）

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use ordered_float::OrderedFloat;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::ports::{StoreAdapter, StoreError};

type Score = OrderedFloat<f64>;

#[derive(Default)]
struct Collection {
    ranked: BTreeSet<(Score, String)>,
    scores: HashMap<String, Score>,
    fifo: VecDeque<String>,
}

impl Collection {
    fn insert_sorted(&mut self, member: &str, score: Score) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.ranked.remove(&(old, member.to_string()));
        }
        self.ranked.insert((score, member.to_string()));
    }

    fn pop_max(&mut self) -> Option<(String, f64)> {
        let (score, member) = self.ranked.pop_last()?;
        self.scores.remove(&member);
        Some((member, score.into_inner()))
    }
}

/// In-process store with the same atomicity contract as the Redis adapter.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Collection>>,
    notify: Notify,
    closed: AtomicBool,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a substrate outage: every call fails with `Unavailable`
    /// until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store closed".to_string()));
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Collection>>, StoreError> {
        self.collections
            .lock()
            .map_err(|_| StoreError::Unavailable("store state poisoned".to_string()))
    }

    /// Shared wait loop for both pop flavours.
    async fn pop_blocking<T>(
        &self,
        cancel: &CancellationToken,
        mut try_pop: impl FnMut(&mut HashMap<String, Collection>) -> Option<T>,
    ) -> Result<T, StoreError> {
        loop {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check()?;
            let hit = {
                let mut all = self.lock()?;
                try_pop(&mut *all)
            };
            if let Some(hit) = hit {
                return Ok(hit);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StoreError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    async fn push_sorted(
        &self,
        collection: &str,
        member: &str,
        score: f64,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.lock()?
            .entry(collection.to_string())
            .or_default()
            .insert_sorted(member, OrderedFloat(score));
        self.notify.notify_waiters();
        Ok(())
    }

    async fn push_fifo(&self, collection: &str, member: &str) -> Result<(), StoreError> {
        self.check()?;
        self.lock()?
            .entry(collection.to_string())
            .or_default()
            .fifo
            .push_back(member.to_string());
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop_max_blocking(
        &self,
        collection: &str,
        cancel: &CancellationToken,
    ) -> Result<(String, f64), StoreError> {
        self.pop_blocking(cancel, |all| all.get_mut(collection)?.pop_max())
            .await
    }

    async fn pop_fifo_blocking(
        &self,
        collection: &str,
        cancel: &CancellationToken,
    ) -> Result<String, StoreError> {
        self.pop_blocking(cancel, |all| all.get_mut(collection)?.fifo.pop_front())
            .await
    }

    async fn rescore_batch(
        &self,
        collection: &str,
        updates: &[(String, f64)],
    ) -> Result<usize, StoreError> {
        self.check()?;
        let mut all = self.lock()?;
        let Some(col) = all.get_mut(collection) else {
            return Ok(0);
        };

        let mut updated = 0;
        for (member, score) in updates {
            // popped members are gone from `scores`; never resurrect them
            if col.scores.contains_key(member) {
                col.insert_sorted(member, OrderedFloat(*score));
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn snapshot(&self, collection: &str) -> Result<Vec<(String, f64)>, StoreError> {
        self.check()?;
        let all = self.lock()?;
        Ok(all
            .get(collection)
            .map(|col| {
                col.ranked
                    .iter()
                    .rev()
                    .map(|(score, member)| (member.clone(), score.into_inner()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn len(&self, collection: &str) -> Result<usize, StoreError> {
        self.check()?;
        let all = self.lock()?;
        Ok(all
            .get(collection)
            .map(|col| col.ranked.len() + col.fifo.len())
            .unwrap_or(0))
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn pop_max_returns_highest_score() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        store.push_sorted("q", "a", 1.0).await.unwrap();
        store.push_sorted("q", "b", 10.0).await.unwrap();
        store.push_sorted("q", "c", 5.0).await.unwrap();

        let (m, s) = store.pop_max_blocking("q", &cancel).await.unwrap();
        assert_eq!((m.as_str(), s), ("b", 10.0));
        let (m, _) = store.pop_max_blocking("q", &cancel).await.unwrap();
        assert_eq!(m, "c");
    }

    #[tokio::test]
    async fn equal_scores_pop_greatest_member_first() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        store.push_sorted("q", "1|x", 3.0).await.unwrap();
        store.push_sorted("q", "9|y", 3.0).await.unwrap();

        let (m, _) = store.pop_max_blocking("q", &cancel).await.unwrap();
        assert_eq!(m, "9|y");
    }

    #[tokio::test]
    async fn fifo_keeps_push_order() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        for m in ["a", "b", "c"] {
            store.push_fifo("q", m).await.unwrap();
        }
        for expected in ["a", "b", "c"] {
            assert_eq!(store.pop_fifo_blocking("q", &cancel).await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn push_wakes_a_blocked_pop() {
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();

        let waiter = tokio::spawn({
            let store = store.clone();
            let cancel = cancel.clone();
            async move { store.pop_fifo_blocking("q", &cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        store.push_fifo("q", "late").await.unwrap();

        let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(popped, "late");
    }

    #[tokio::test]
    async fn cancel_unblocks_pop_without_consuming() {
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();

        let waiter = tokio::spawn({
            let store = store.clone();
            let cancel = cancel.clone();
            async move { store.pop_max_blocking("q", &cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res, Err(StoreError::Cancelled));

        // a cancelled token refuses even when data is there
        store.push_sorted("q", "m", 1.0).await.unwrap();
        assert_eq!(
            store.pop_max_blocking("q", &cancel).await,
            Err(StoreError::Cancelled)
        );
        assert_eq!(store.len("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rescore_skips_popped_members() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        store.push_sorted("q", "a", 1.0).await.unwrap();
        store.push_sorted("q", "b", 2.0).await.unwrap();
        let (popped, _) = store.pop_max_blocking("q", &cancel).await.unwrap();
        assert_eq!(popped, "b");

        let updated = store
            .rescore_batch("q", &[("a".into(), 7.0), ("b".into(), 9.0)])
            .await
            .unwrap();
        assert_eq!(updated, 1);
        assert_eq!(store.snapshot("q").await.unwrap(), vec![("a".to_string(), 7.0)]);
    }

    #[tokio::test]
    async fn outage_and_close_surface_as_unavailable() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.push_fifo("q", "x").await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        store.push_fifo("q", "x").await.unwrap();

        store.close().await.unwrap();
        store.close().await.unwrap();
        assert!(matches!(store.len("q").await, Err(StoreError::Unavailable(_))));
    }
}
