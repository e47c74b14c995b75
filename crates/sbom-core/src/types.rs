use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::{AsRefStr, Display, EnumString, IntoStaticStr};

use crate::error::TaskIdError;

/// Longest id accepted by [`TaskId::parse`].
pub const MAX_TASK_ID_LEN: usize = 128;

/// Opaque, immutable handle of a task.
///
/// Ids double as file-name components in the blob store, so only ASCII
/// alphanumerics, `-` and `_` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Fresh collision-resistant id (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn parse(raw: &str) -> Result<Self, TaskIdError> {
        if raw.is_empty() {
            return Err(TaskIdError::Empty);
        }
        if raw.len() > MAX_TASK_ID_LEN {
            return Err(TaskIdError::TooLong { len: raw.len() });
        }
        if let Some(c) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(TaskIdError::InvalidChar(c));
        }
        Ok(Self(raw.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TaskId {
    type Err = TaskIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of a task in the ledger.
///
/// The string forms are exactly the values of the `sbom_task_status`
/// Postgres enum.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Display,
    EnumString,
    AsRefStr,
    IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    /// Accepted and waiting for a worker.
    Queued,
    /// Claimed by exactly one worker.
    Running,
    /// Finished; the result blob is published.
    Done,
    /// Finished unsuccessfully; `error` carries the diagnostic.
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::Done,
        TaskStatus::Failed,
    ];

    /// `done` and `failed` are terminal; only the retention sweep removes
    /// a task from a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// A row of the task ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    /// Time of the last transition.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    /// Present only when `status` is [`TaskStatus::Failed`].
    pub error: Option<String>,
    /// How many times the task has been claimed.
    pub attempts: i32,
}

/// What the janitor does with a task stuck in `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum RunningTimeoutAction {
    #[default]
    Fail,
    Requeue,
}

/// Number of ledger rows in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub queued: i64,
    pub running: i64,
    pub done: i64,
    pub failed: i64,
}

impl StatusCounts {
    pub fn add(&mut self, status: TaskStatus, n: i64) {
        match status {
            TaskStatus::Queued => self.queued += n,
            TaskStatus::Running => self.running += n,
            TaskStatus::Done => self.done += n,
            TaskStatus::Failed => self.failed += n,
        }
    }

    pub fn total(&self) -> i64 {
        self.queued + self.running + self.done + self.failed
    }
}
