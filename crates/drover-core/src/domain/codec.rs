//! Wire codec: Task <-> stored record.
//!
//! The record is flat JSON with stable field names
//! (`id`, `type`, `payload`, `priority`, `created_at`, `status`).
//! `payload` is standard base64, `created_at` is RFC 3339 with full
//! sub-second precision.

use super::Task;
use crate::error::DroverError;

pub fn encode(task: &Task) -> Result<String, DroverError> {
    Ok(serde_json::to_string(task)?)
}

pub fn decode(record: &str) -> Result<Task, DroverError> {
    Ok(serde_json::from_str(record)?)
}
