//! Task persistence.
//!
//! Every status change goes through a conditional update inside the engine,
//! so the `pending -> dispatched -> terminal` machine holds no matter how
//! many requests race on the same rows.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use taskd_common::{LogKind, NewTask, Task, TaskId, TaskLog, TaskStatus, TerminalStatus};

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("task store lock poisoned")]
    Poisoned,
}

/// Result of a conditional `dispatched -> terminal` update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Applied(Task),
    NotFound,
    /// The task had already left `dispatched` (duplicate or late report).
    NotDispatched(TaskStatus),
    /// The reporting host is not the task's target.
    TargetMismatch,
}

/// Bounds for the calendar view. Unset bounds do not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub target: Option<String>,
}

pub trait TaskStore: Send + Sync {
    fn insert(&self, task: NewTask, now: DateTime<Utc>) -> Result<Task, StoreError>;

    fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Atomically moves every pending host task addressed to `host` to
    /// `dispatched` and returns the claimed tasks in id order.
    fn claim_pending(&self, host: &str, now: DateTime<Utc>) -> Result<Vec<Task>, StoreError>;

    /// Applies a terminal status only if the task is still `dispatched`
    /// (and, when `expected_target` is set, addressed to that identity).
    fn complete(
        &self,
        id: TaskId,
        expected_target: Option<&str>,
        status: TerminalStatus,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Completion, StoreError>;

    /// Returns tasks dispatched strictly before `cutoff` to `pending`.
    fn reclaim_dispatched_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, StoreError>;

    /// User-channel tasks for `username`, newest first.
    fn list_for_user(&self, username: &str) -> Result<Vec<Task>, StoreError>;

    /// Tasks with a due date inside the filter, earliest first.
    fn list_scheduled(&self, filter: &ScheduleFilter) -> Result<Vec<Task>, StoreError>;

    /// Appends to a task's history. `None` when the task does not exist.
    fn append_log(
        &self,
        task_id: TaskId,
        by: &str,
        kind: LogKind,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskLog>, StoreError>;

    /// History of one task, oldest first.
    fn list_logs(&self, task_id: TaskId) -> Result<Vec<TaskLog>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    Memory,
    Sqlite { path: PathBuf },
}

pub fn open_store(config: &StoreConfig) -> Result<Box<dyn TaskStore>, StoreError> {
    match config {
        StoreConfig::Memory => Ok(Box::new(MemoryStore::new())),
        StoreConfig::Sqlite { path } => Ok(Box::new(SqliteStore::open(path)?)),
    }
}
