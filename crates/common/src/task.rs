use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unsupported type: {0}")]
    UnknownKind(String),
    #[error("unknown status: {0}")]
    UnknownStatus(String),
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error("unknown log kind: {0}")]
    UnknownLogKind(String),
}

/// Store-assigned task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What an agent does with a task payload. Adding a variant forces every
/// executor mapping to handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Message,
    Command,
}

impl TaskKind {
    pub const ALL: [TaskKind; 2] = [TaskKind::Message, TaskKind::Command];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Message => "message",
            TaskKind::Command => "command",
        }
    }
}

impl FromStr for TaskKind {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "message" => Ok(TaskKind::Message),
            "command" => Ok(TaskKind::Command),
            other => Err(ParseError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity space a task target belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Delivered to agents polling `/api/tasks` by host name.
    #[default]
    Host,
    /// Read by user-facing clients through `/api/notify_tasks`.
    User,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Host => "host",
            Channel::User => "user",
        }
    }
}

impl FromStr for Channel {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "host" => Ok(Channel::Host),
            "user" => Ok(Channel::User),
            other => Err(ParseError::UnknownChannel(other.to_string())),
        }
    }
}

/// Task lifecycle: `pending -> dispatched -> {success, error}`.
///
/// `dispatched -> pending` exists only for the reclaim sweep; nothing else
/// moves a task backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Dispatched,
    Success,
    Error,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Dispatched,
        TaskStatus::Success,
        TaskStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
        }
    }

    /// Forward transitions allowed for normal operation.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Dispatched)
                | (TaskStatus::Dispatched, TaskStatus::Success)
                | (TaskStatus::Dispatched, TaskStatus::Error)
        )
    }

    /// The administrative reset taken by the reclaim sweep.
    pub fn can_reclaim(&self) -> bool {
        matches!(self, TaskStatus::Dispatched)
    }
}

impl FromStr for TaskStatus {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(TaskStatus::Pending),
            "dispatched" => Ok(TaskStatus::Dispatched),
            "success" => Ok(TaskStatus::Success),
            "error" => Ok(TaskStatus::Error),
            other => Err(ParseError::UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status carried by an outcome or a confirmation report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    Success,
    Error,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        TaskStatus::from(*self).as_str()
    }
}

impl From<TerminalStatus> for TaskStatus {
    fn from(value: TerminalStatus) -> Self {
        match value {
            TerminalStatus::Success => TaskStatus::Success,
            TerminalStatus::Error => TaskStatus::Error,
        }
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a task history entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Dispatched,
    Reclaimed,
    Success,
    Error,
    /// Free-text note attached by a user or extension.
    Observation,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Dispatched => "dispatched",
            LogKind::Reclaimed => "reclaimed",
            LogKind::Success => "success",
            LogKind::Error => "error",
            LogKind::Observation => "observation",
        }
    }
}

impl FromStr for LogKind {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "dispatched" => Ok(LogKind::Dispatched),
            "reclaimed" => Ok(LogKind::Reclaimed),
            "success" => Ok(LogKind::Success),
            "error" => Ok(LogKind::Error),
            "observation" => Ok(LogKind::Observation),
            other => Err(ParseError::UnknownLogKind(other.to_string())),
        }
    }
}

impl From<TerminalStatus> for LogKind {
    fn from(value: TerminalStatus) -> Self {
        match value {
            TerminalStatus::Success => LogKind::Success,
            TerminalStatus::Error => LogKind::Error,
        }
    }
}

/// One row of a task's history, oldest first in `GET /api/task_logs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLog {
    pub id: u64,
    pub task_id: TaskId,
    /// Host or user that caused the entry.
    pub by: String,
    pub status: LogKind,
    #[serde(default)]
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(default)]
    pub channel: Channel,
    pub target: String,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub payload: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub dispatched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
}

/// Self-contained result of running one task on an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub status: TerminalStatus,
    pub message: String,
}

impl Outcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: TerminalStatus::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: TerminalStatus::Error,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TerminalStatus::Success
    }
}
