//! RedisStore - 本番用の StoreAdapter
//!
//! - sorted collection: ZADD / BZPOPMAX / ZADD XX（存在するメンバーだけ更新）
//! - fifo collection:   LPUSH / BRPOP
//!
//! Blocking pops run on dedicated multiplexed connections so they do not
//! stall the shared `ConnectionManager`. Those connections are kept in an
//! idle list and reused, so there is at most one per concurrent consumer.
//! Pops use a bounded server timeout and check the cancellation token between
//! polls. A pop that is already in flight is never abandoned, because Redis
//! may have removed the member.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, FromRedisValue};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ports::{StoreAdapter, StoreError};

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

fn closed() -> StoreError {
    StoreError::Unavailable("store closed".to_string())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct RedisStore {
    client: redis::Client,
    /// `None` after `close`.
    redis: Mutex<Option<ConnectionManager>>,
    /// Blocking-pop connections not currently in use.
    idle: Mutex<Vec<MultiplexedConnection>>,
    block_timeout: Duration,
}

impl RedisStore {
    /// Connects and pings the server.
    pub async fn connect(redis_url: &str, block_timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let mut redis = ConnectionManager::new(client.clone()).await?;
        let _: String = redis::cmd("PING").query_async(&mut redis).await?;
        debug!(redis_url, "connected to redis");

        Ok(Self {
            client,
            redis: Mutex::new(Some(redis)),
            idle: Mutex::new(Vec::new()),
            block_timeout,
        })
    }

    fn conn(&self) -> Result<ConnectionManager, StoreError> {
        lock(&self.redis).clone().ok_or_else(closed)
    }

    fn is_closed(&self) -> bool {
        lock(&self.redis).is_none()
    }

    /// Reuse an idle blocking connection or open a new one.
    async fn checkout(&self) -> Result<MultiplexedConnection, StoreError> {
        if self.is_closed() {
            return Err(closed());
        }
        if let Some(conn) = lock(&self.idle).pop() {
            return Ok(conn);
        }
        debug!("opening blocking connection");
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn checkin(&self, conn: MultiplexedConnection) {
        if !self.is_closed() {
            lock(&self.idle).push(conn);
        }
    }

    /// Number of blocking connections waiting for reuse.
    pub fn idle_connections(&self) -> usize {
        lock(&self.idle).len()
    }

    fn block_secs(&self) -> f64 {
        // 0 would mean "block forever" to Redis
        self.block_timeout.as_secs_f64().max(0.01)
    }

    /// Poll `command collection timeout` until it returns a value or `cancel`
    /// fires. A connection that saw an error is dropped, not reused.
    async fn blocking_pop<T: FromRedisValue>(
        &self,
        command: &str,
        collection: &str,
        cancel: &CancellationToken,
    ) -> Result<T, StoreError> {
        let mut conn = self.checkout().await?;
        let res = loop {
            if cancel.is_cancelled() {
                break Err(StoreError::Cancelled);
            }
            let reply: Option<T> = redis::cmd(command)
                .arg(collection)
                .arg(self.block_secs())
                .query_async(&mut conn)
                .await?;
            if let Some(reply) = reply {
                break Ok(reply);
            }
        };
        self.checkin(conn);
        res
    }
}

#[async_trait]
impl StoreAdapter for RedisStore {
    async fn push_sorted(
        &self,
        collection: &str,
        member: &str,
        score: f64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        conn.zadd::<_, _, _, ()>(collection, member, score).await?;
        Ok(())
    }

    async fn push_fifo(&self, collection: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        conn.lpush::<_, _, ()>(collection, member).await?;
        Ok(())
    }

    async fn pop_max_blocking(
        &self,
        collection: &str,
        cancel: &CancellationToken,
    ) -> Result<(String, f64), StoreError> {
        // [key, member, score] or nil on timeout
        let (_, member, score): (String, String, f64) =
            self.blocking_pop("BZPOPMAX", collection, cancel).await?;
        Ok((member, score))
    }

    async fn pop_fifo_blocking(
        &self,
        collection: &str,
        cancel: &CancellationToken,
    ) -> Result<String, StoreError> {
        // LPUSH + BRPOP = FIFO
        let (_, member): (String, String) = self.blocking_pop("BRPOP", collection, cancel).await?;
        Ok(member)
    }

    async fn rescore_batch(
        &self,
        collection: &str,
        updates: &[(String, f64)],
    ) -> Result<usize, StoreError> {
        if updates.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;

        // XX: never add a member that a consumer already popped
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (member, score) in updates {
            pipe.cmd("ZADD")
                .arg(collection)
                .arg("XX")
                .arg("CH")
                .arg(*score)
                .arg(member);
        }
        let changed: Vec<usize> = pipe.query_async(&mut conn).await?;
        Ok(changed.into_iter().sum())
    }

    async fn snapshot(&self, collection: &str) -> Result<Vec<(String, f64)>, StoreError> {
        let mut conn = self.conn()?;
        let mut members: Vec<(String, f64)> = conn.zrange_withscores(collection, 0, -1).await?;
        members.reverse();
        Ok(members)
    }

    async fn len(&self, collection: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn()?;
        let kind: String = redis::cmd("TYPE").arg(collection).query_async(&mut conn).await?;
        let len: usize = match kind.as_str() {
            "zset" => conn.zcard(collection).await?,
            "list" => conn.llen(collection).await?,
            _ => 0,
        };
        Ok(len)
    }

    async fn close(&self) -> Result<(), StoreError> {
        // dropping the last handles closes the sockets
        let manager = lock(&self.redis).take();
        let idle = std::mem::take(&mut *lock(&self.idle));
        if manager.is_some() {
            debug!(blocking_connections = idle.len(), "redis store closed");
        }
        Ok(())
    }
}
