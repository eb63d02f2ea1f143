//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **MemoryStore**: 開発・テスト用（1 プロセス内）
//! - **RedisStore**: 本番用（sorted set / list）

pub mod memory_store;
pub mod redis_store;

pub use self::memory_store::MemoryStore;
pub use self::redis_store::RedisStore;

use std::sync::Arc;

use crate::config::{StoreConfig, StoreKind};
use crate::ports::{StoreAdapter, StoreError};

/// Open the store named by `config`.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn StoreAdapter>, StoreError> {
    Ok(match config.kind {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::Redis => {
            Arc::new(RedisStore::connect(&config.redis_url, config.block_timeout()).await?)
        }
    })
}
