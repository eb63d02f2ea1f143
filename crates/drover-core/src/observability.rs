use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::domain::{Task, TaskId, TaskStatus};
use crate::error::DroverError;

/// Last known state of one task as seen by the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub status: TaskStatus,
    pub error: Option<String>,
    /// Failed because no handler was registered.
    pub dropped: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCounts {
    pub active: usize,
    pub completed: usize,
    /// Handler failures. Dropped tasks are counted separately.
    pub failed: usize,
    pub dropped: usize,
}

#[derive(Debug, Default)]
struct Board {
    active: HashMap<TaskId, TaskRecord>,
    /// Most recent terminal records, oldest first.
    recent: VecDeque<(TaskId, TaskRecord)>,
    completed: usize,
    failed: usize,
    dropped: usize,
}

/// In-process status of the tasks the pool is working on.
///
/// Transitions are monotonic (`Pending → Active → Completed | Failed`);
/// anything else is rejected with `InvalidTransition`.
///
/// メモリは有界: Active の間だけ per-task record を持ち、終わったものは
/// 件数に畳んで直近 `recent_capacity` 件だけ残す。
#[derive(Debug)]
pub struct StatusBoard {
    inner: Mutex<Board>,
    recent_capacity: usize,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub const DEFAULT_RECENT_CAPACITY: usize = 1024;

    pub fn new() -> Self {
        Self::with_recent_capacity(Self::DEFAULT_RECENT_CAPACITY)
    }

    /// Keep at most `recent_capacity` finished records for `get`.
    pub fn with_recent_capacity(recent_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Board::default()),
            recent_capacity,
        }
    }

    /// Start tracking `task` at its current status.
    pub fn track(&self, task: &Task) -> Result<(), DroverError> {
        self.update(task.id(), task.status(), None, false)
    }

    pub fn complete(&self, id: TaskId) -> Result<(), DroverError> {
        self.update(id, TaskStatus::Completed, None, false)
    }

    pub fn fail(&self, id: TaskId, error: impl Into<String>) -> Result<(), DroverError> {
        self.update(id, TaskStatus::Failed, Some(error.into()), false)
    }

    /// Failed with no handler to run it.
    pub fn drop_task(&self, id: TaskId, reason: impl Into<String>) -> Result<(), DroverError> {
        self.update(id, TaskStatus::Failed, Some(reason.into()), true)
    }

    /// Active tasks, or finished ones still in the recent window.
    pub fn get(&self, id: TaskId) -> Option<TaskRecord> {
        let board = self.lock();
        board.active.get(&id).cloned().or_else(|| {
            board
                .recent
                .iter()
                .rev()
                .find(|(rid, _)| *rid == id)
                .map(|(_, record)| record.clone())
        })
    }

    /// Per-task records currently held in memory.
    pub fn retained(&self) -> usize {
        let board = self.lock();
        board.active.len() + board.recent.len()
    }

    pub fn counts(&self) -> PoolCounts {
        let board = self.lock();
        PoolCounts {
            active: board.active.len(),
            completed: board.completed,
            failed: board.failed,
            dropped: board.dropped,
        }
    }

    fn update(
        &self,
        id: TaskId,
        next: TaskStatus,
        error: Option<String>,
        dropped: bool,
    ) -> Result<(), DroverError> {
        let mut board = self.lock();

        let current = match board.active.get(&id) {
            Some(record) => Some(record.status),
            None => board
                .recent
                .iter()
                .rev()
                .find(|(rid, _)| *rid == id)
                .map(|(_, record)| record.status),
        };
        if let Some(from) = current
            && !from.can_transition_to(next)
        {
            return Err(DroverError::InvalidTransition { from, to: next });
        }
        let record = TaskRecord {
            status: next,
            error,
            dropped,
        };
        if !next.is_terminal() {
            board.active.insert(id, record);
            return Ok(());
        }

        board.active.remove(&id);
        match (next, dropped) {
            (TaskStatus::Completed, _) => board.completed += 1,
            (_, true) => board.dropped += 1,
            _ => board.failed += 1,
        }
        if self.recent_capacity > 0 {
            if board.recent.len() >= self.recent_capacity {
                board.recent.pop_front();
            }
            board.recent.push_back((id, record));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Board> {
        // 書き込みは全部 1 ステップで完結するので poison しても中身は整合している
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Priority, TaskType};

    fn active_task() -> Task {
        let mut task = Task::new(TaskType::new("echo").unwrap(), Priority::LOW, Vec::new());
        task.transition(TaskStatus::Active).unwrap();
        task
    }

    #[test]
    fn counts_follow_terminal_states() {
        let board = StatusBoard::new();
        let (a, b, c, d) = (active_task(), active_task(), active_task(), active_task());
        for t in [&a, &b, &c, &d] {
            board.track(t).unwrap();
        }
        board.complete(a.id()).unwrap();
        board.fail(b.id(), "boom").unwrap();
        board.drop_task(c.id(), "no handler").unwrap();

        assert_eq!(
            board.counts(),
            PoolCounts {
                active: 1,
                completed: 1,
                failed: 1,
                dropped: 1
            }
        );
        assert_eq!(board.get(b.id()).unwrap().error.as_deref(), Some("boom"));
        assert!(board.get(c.id()).unwrap().dropped);
        assert_eq!(board.get(d.id()).unwrap().status, TaskStatus::Active);
    }

    #[test]
    fn terminal_states_are_final() {
        let board = StatusBoard::new();
        let task = active_task();
        board.track(&task).unwrap();
        board.complete(task.id()).unwrap();

        let err = board.fail(task.id(), "late").unwrap_err();
        assert!(matches!(
            err,
            DroverError::InvalidTransition {
                from: TaskStatus::Completed,
                to: TaskStatus::Failed
            }
        ));
        assert_eq!(board.get(task.id()).unwrap().status, TaskStatus::Completed);
        assert_eq!(board.counts().failed, 0);
    }

    #[test]
    fn finished_tasks_do_not_accumulate() {
        let board = StatusBoard::with_recent_capacity(16);
        let mut last = None;
        for _ in 0..10_000 {
            let task = active_task();
            board.track(&task).unwrap();
            board.complete(task.id()).unwrap();
            last = Some(task.id());
        }

        assert_eq!(board.retained(), 16);
        assert_eq!(board.counts().completed, 10_000);
        assert_eq!(board.counts().active, 0);
        // the newest finished record is still visible
        assert_eq!(board.get(last.unwrap()).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn active_records_leave_when_finished() {
        let board = StatusBoard::with_recent_capacity(0);
        let task = active_task();
        board.track(&task).unwrap();
        assert_eq!(board.retained(), 1);

        board.fail(task.id(), "boom").unwrap();
        assert_eq!(board.retained(), 0);
        assert!(board.get(task.id()).is_none());
        assert_eq!(board.counts().failed, 1);
    }
}
