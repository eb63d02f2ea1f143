//! Store port - 永続化基盤（Redis または InMemory）の抽象化
//!
//! Broker はこの trait だけに依存する。メンバーは不透明な文字列で、
//! すべての操作は単一メンバー単位で atomic であることを前提とする。
//!
//! Two collection shapes:
//! - sorted: member + score, popped highest score first. Equal scores rank by
//!   member bytes (the lexicographically greatest member pops first).
//! - fifo: members popped in push order.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation cancelled")]
    Cancelled,
}

#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Insert (or overwrite the score of) a member in a sorted collection.
    async fn push_sorted(&self, collection: &str, member: &str, score: f64)
    -> Result<(), StoreError>;

    /// Append a member to a fifo collection.
    async fn push_fifo(&self, collection: &str, member: &str) -> Result<(), StoreError>;

    /// Remove and return the highest-scored member, waiting until one exists.
    ///
    /// Exactly one caller wins each member. Returns `Cancelled` once the token
    /// fires; a member is never removed on that path.
    async fn pop_max_blocking(
        &self,
        collection: &str,
        cancel: &CancellationToken,
    ) -> Result<(String, f64), StoreError>;

    /// Remove and return the oldest member of a fifo collection, waiting until
    /// one exists. Same cancellation contract as `pop_max_blocking`.
    async fn pop_fifo_blocking(
        &self,
        collection: &str,
        cancel: &CancellationToken,
    ) -> Result<String, StoreError>;

    /// Update scores of members that are still present. Members that were
    /// popped in the meantime are skipped, never re-inserted.
    ///
    /// Returns how many members were updated.
    async fn rescore_batch(
        &self,
        collection: &str,
        updates: &[(String, f64)],
    ) -> Result<usize, StoreError>;

    /// Every member of a sorted collection with its current score.
    async fn snapshot(&self, collection: &str) -> Result<Vec<(String, f64)>, StoreError>;

    /// Number of pending members (sorted or fifo).
    async fn len(&self, collection: &str) -> Result<usize, StoreError>;

    /// Release connections. Idempotent.
    async fn close(&self) -> Result<(), StoreError>;
}
