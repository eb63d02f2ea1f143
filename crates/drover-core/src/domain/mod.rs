//! Domain model: task, its id, status and wire codec.

pub mod codec;
pub mod ids;
pub mod status;
pub mod task;

pub use self::ids::TaskId;
pub use self::status::TaskStatus;
pub use self::task::{Priority, Task, TaskType};
