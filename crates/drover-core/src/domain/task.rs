use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use super::{TaskId, TaskStatus};
use crate::error::DroverError;

/// Handler selector. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Result<Self, DroverError> {
        let s = s.into();
        if s.trim().is_empty() {
            return Err(DroverError::Validation("task type is required".to_string()));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TaskType {
    type Error = DroverError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<TaskType> for String {
    fn from(t: TaskType) -> Self {
        t.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Base priority. Higher is more urgent.
///
/// The named levels are the common ones; any integer is a valid level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(i64);

impl Priority {
    pub const LOW: Priority = Priority(1);
    pub const MEDIUM: Priority = Priority(5);
    pub const HIGH: Priority = Priority(10);

    pub const fn new(level: i64) -> Self {
        Self(level)
    }

    pub fn level(self) -> i64 {
        self.0
    }

    /// Score used by sorted collections (wait time = 0).
    pub fn base_score(self) -> f64 {
        self.0 as f64
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::MEDIUM
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Priority::LOW => f.write_str("low"),
            Priority::MEDIUM => f.write_str("medium"),
            Priority::HIGH => f.write_str("high"),
            Priority(n) => write!(f, "{n}"),
        }
    }
}

impl FromStr for Priority {
    type Err = DroverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::LOW),
            "medium" => Ok(Priority::MEDIUM),
            "high" => Ok(Priority::HIGH),
            other => other
                .parse::<i64>()
                .map(Priority)
                .map_err(|_| DroverError::Validation(format!("unknown priority: {s}"))),
        }
    }
}

/// One unit of work.
///
/// Everything except `status` is fixed at construction. `created_at` in
/// particular is the only input to aging and is never rewritten.
///
/// The serde shape is the wire record stored in the broker (see `codec`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    #[serde(rename = "type")]
    task_type: TaskType,
    #[serde(with = "payload_base64")]
    payload: Vec<u8>,
    priority: Priority,
    created_at: DateTime<Utc>,
    status: TaskStatus,
}

impl Task {
    /// New pending task stamped with a fresh id and the current time.
    pub fn new(task_type: TaskType, priority: Priority, payload: impl Into<Vec<u8>>) -> Self {
        Self::new_at(
            TaskId::from_ulid(Ulid::new()),
            task_type,
            priority,
            payload,
            Utc::now(),
        )
    }

    /// New pending task with an explicit id and creation time.
    pub fn new_at(
        id: TaskId,
        task_type: TaskType,
        priority: Priority,
        payload: impl Into<Vec<u8>>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_type,
            payload: payload.into(),
            priority,
            created_at,
            status: TaskStatus::Pending,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Seconds since creation, clamped at zero for clocks that run behind.
    pub fn waited_seconds(&self, now: DateTime<Utc>) -> f64 {
        let waited = now.signed_duration_since(self.created_at);
        match waited.to_std() {
            Ok(d) => d.as_secs_f64(),
            Err(_) => 0.0,
        }
    }

    /// Checks that the task may enter a broker.
    pub fn validate(&self) -> Result<(), DroverError> {
        if self.task_type.as_str().trim().is_empty() {
            return Err(DroverError::Validation("task type is required".to_string()));
        }
        if self.status != TaskStatus::Pending {
            return Err(DroverError::Validation(format!(
                "task {} must be pending to enqueue, was {}",
                self.id, self.status
            )));
        }
        Ok(())
    }

    pub fn transition(&mut self, next: TaskStatus) -> Result<(), DroverError> {
        if !self.status.can_transition_to(next) {
            return Err(DroverError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

mod payload_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
