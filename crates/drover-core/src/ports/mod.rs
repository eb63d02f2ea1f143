//! Ports - 抽象化レイヤー
//!
//! 外部システム（Redis などの永続化基盤、時計、ID 発行）への
//! インターフェースを定義し、実装の詳細を隠蔽する。
//! 実装は `impls` に置く。

pub mod clock;
pub mod id_generator;
pub mod store;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::store::{StoreAdapter, StoreError};
