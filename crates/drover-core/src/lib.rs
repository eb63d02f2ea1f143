//! drover-core
//!
//! Task broker and worker pool with priority aging.
//!
//! # モジュール構成
//! - **domain**: Task, TaskId, Priority, TaskStatus, wire codec
//! - **ports**: 抽象化レイヤー（StoreAdapter, Clock, IdGenerator）
//! - **impls**: StoreAdapter の実装（MemoryStore, RedisStore）
//! - **broker**: Broker trait と FIFO / priority-aging 実装、aging scheduler
//! - **runtime**: TaskHandler と HandlerRegistry
//! - **worker**: WorkerPool（N 個の consumer loop）
//! - **producer**: Producer（Task を組み立てて enqueue）
//! - **observability**: StatusBoard と PoolCounts
//! - **config**: YAML 設定

pub mod broker;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod producer;
pub mod runtime;
pub mod worker;

pub use crate::broker::{Broker, QueueBroker};
pub use crate::config::DroverConfig;
pub use crate::domain::{Priority, Task, TaskId, TaskStatus, TaskType};
pub use crate::error::{DroverError, HandlerError};
pub use crate::producer::Producer;
pub use crate::runtime::{FnHandler, HandlerRegistry, TaskHandler};
pub use crate::worker::{PoolReport, WorkerPool, WorkerState};
