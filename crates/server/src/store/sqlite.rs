//! SQLite engine.
//!
//! Claims and completions are single conditional `UPDATE ... RETURNING`
//! statements, so two processes sharing the database file still cannot
//! dispatch or complete the same row twice.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use taskd_common::{
    Channel, LogKind, NewTask, Task, TaskId, TaskKind, TaskLog, TaskStatus, TerminalStatus,
};

use super::{Completion, ScheduleFilter, StoreError, TaskStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    channel       TEXT    NOT NULL DEFAULT 'host',
    target        TEXT    NOT NULL,
    title         TEXT    NOT NULL DEFAULT '',
    kind          TEXT    NOT NULL,
    payload       TEXT    NOT NULL DEFAULT '',
    status        TEXT    NOT NULL DEFAULT 'pending',
    message       TEXT,
    created_at    INTEGER NOT NULL,
    dispatched_at INTEGER,
    completed_at  INTEGER,
    due_at        INTEGER
);
CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks (channel, target, status);
CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks (due_at);
CREATE TABLE IF NOT EXISTS task_logs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id     INTEGER NOT NULL REFERENCES tasks (id),
    by_identity TEXT    NOT NULL,
    kind        TEXT    NOT NULL,
    message     TEXT    NOT NULL DEFAULT '',
    at          INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_logs_task ON task_logs (task_id, at);
";

const LOG_COLUMNS: &str = "id, task_id, by_identity, kind, message, at";

const COLUMNS: &str = "id, channel, target, title, kind, payload, status, message, \
                       created_at, dispatched_at, completed_at, due_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl TaskStore for SqliteStore {
    fn insert(&self, task: NewTask, now: DateTime<Utc>) -> Result<Task, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "INSERT INTO tasks (channel, target, title, kind, payload, status, created_at, due_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, '{pending}', ?6, ?7) RETURNING {COLUMNS}",
            pending = TaskStatus::Pending.as_str(),
        );
        let task = conn.query_row(
            &sql,
            params![
                task.channel.as_str(),
                task.target,
                task.title,
                task.kind.as_str(),
                task.payload,
                now.timestamp_millis(),
                task.due_at.map(|at| at.timestamp_millis()),
            ],
            row_to_task,
        )?;
        Ok(task)
    }

    fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let conn = self.lock()?;
        Ok(select_by_id(&conn, id)?)
    }

    fn claim_pending(&self, host: &str, now: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "UPDATE tasks SET status = '{dispatched}', dispatched_at = ?1 \
             WHERE channel = '{host}' AND target = ?2 AND status IN ({from}) \
             RETURNING {COLUMNS}",
            dispatched = TaskStatus::Dispatched.as_str(),
            host = Channel::Host.as_str(),
            from = statuses_leading_to(TaskStatus::Dispatched),
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut tasks = stmt
            .query_map(params![now.timestamp_millis(), host], row_to_task)?
            .collect::<Result<Vec<_>, _>>()?;
        tasks.sort_by_key(|task| task.id);
        Ok(tasks)
    }

    fn complete(
        &self,
        id: TaskId,
        expected_target: Option<&str>,
        status: TerminalStatus,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Completion, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "UPDATE tasks SET status = ?1, message = ?2, completed_at = ?3 \
             WHERE id = ?4 AND status IN ({from}) AND (?5 IS NULL OR target = ?5) \
             RETURNING {COLUMNS}",
            from = statuses_leading_to(status.into()),
        );
        let applied = conn
            .query_row(
                &sql,
                params![
                    status.as_str(),
                    message,
                    now.timestamp_millis(),
                    id.0 as i64,
                    expected_target,
                ],
                row_to_task,
            )
            .optional()?;

        if let Some(task) = applied {
            return Ok(Completion::Applied(task));
        }

        Ok(match select_by_id(&conn, id)? {
            None => Completion::NotFound,
            Some(task) if !task.status.can_transition_to(status.into()) => {
                Completion::NotDispatched(task.status)
            }
            Some(_) => Completion::TargetMismatch,
        })
    }

    fn reclaim_dispatched_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "UPDATE tasks SET status = '{pending}', dispatched_at = NULL \
             WHERE status IN ({from}) AND dispatched_at < ?1 \
             RETURNING {COLUMNS}",
            pending = TaskStatus::Pending.as_str(),
            from = status_list(TaskStatus::ALL.into_iter().filter(TaskStatus::can_reclaim)),
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut tasks = stmt
            .query_map(params![cutoff.timestamp_millis()], row_to_task)?
            .collect::<Result<Vec<_>, _>>()?;
        tasks.sort_by_key(|task| task.id);
        Ok(tasks)
    }

    fn list_for_user(&self, username: &str) -> Result<Vec<Task>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {COLUMNS} FROM tasks WHERE channel = '{user}' AND target = ?1 \
             ORDER BY created_at DESC, id DESC",
            user = Channel::User.as_str(),
        );
        let mut stmt = conn.prepare(&sql)?;
        let tasks = stmt
            .query_map(params![username], row_to_task)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    fn list_scheduled(&self, filter: &ScheduleFilter) -> Result<Vec<Task>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {COLUMNS} FROM tasks WHERE due_at IS NOT NULL \
             AND (?1 IS NULL OR due_at >= ?1) \
             AND (?2 IS NULL OR due_at <= ?2) \
             AND (?3 IS NULL OR target = ?3) \
             ORDER BY due_at ASC, id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let tasks = stmt
            .query_map(
                params![
                    filter.start.map(|at| at.timestamp_millis()),
                    filter.end.map(|at| at.timestamp_millis()),
                    filter.target.as_deref(),
                ],
                row_to_task,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    fn append_log(
        &self,
        task_id: TaskId,
        by: &str,
        kind: LogKind,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskLog>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "INSERT INTO task_logs (task_id, by_identity, kind, message, at) \
             SELECT id, ?2, ?3, ?4, ?5 FROM tasks WHERE id = ?1 \
             RETURNING {LOG_COLUMNS}"
        );
        let entry = conn
            .query_row(
                &sql,
                params![
                    task_id.0 as i64,
                    by,
                    kind.as_str(),
                    message,
                    now.timestamp_millis(),
                ],
                row_to_log,
            )
            .optional()?;
        Ok(entry)
    }

    fn list_logs(&self, task_id: TaskId) -> Result<Vec<TaskLog>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM task_logs WHERE task_id = ?1 ORDER BY at ASC, id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let logs = stmt
            .query_map(params![task_id.0 as i64], row_to_log)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(logs)
    }
}

/// SQL list of the statuses allowed to move to `next`.
fn statuses_leading_to(next: TaskStatus) -> String {
    status_list(
        TaskStatus::ALL
            .into_iter()
            .filter(|status| status.can_transition_to(next)),
    )
}

fn status_list(statuses: impl Iterator<Item = TaskStatus>) -> String {
    statuses
        .map(|status| format!("'{}'", status.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn select_by_id(conn: &Connection, id: TaskId) -> rusqlite::Result<Option<Task>> {
    let sql = format!("SELECT {COLUMNS} FROM tasks WHERE id = ?1");
    conn.query_row(&sql, params![id.0 as i64], row_to_task)
        .optional()
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: TaskId(row.get::<_, i64>(0)? as u64),
        channel: parse_column::<Channel>(row, 1)?,
        target: row.get(2)?,
        title: row.get(3)?,
        kind: parse_column::<TaskKind>(row, 4)?,
        payload: row.get(5)?,
        status: parse_column::<TaskStatus>(row, 6)?,
        message: row.get(7)?,
        created_at: millis_to_datetime(8, row.get(8)?)?,
        dispatched_at: optional_millis(row, 9)?,
        completed_at: optional_millis(row, 10)?,
        due_at: optional_millis(row, 11)?,
    })
}

fn row_to_log(row: &Row<'_>) -> rusqlite::Result<TaskLog> {
    Ok(TaskLog {
        id: row.get::<_, i64>(0)? as u64,
        task_id: TaskId(row.get::<_, i64>(1)? as u64),
        by: row.get(2)?,
        status: parse_column::<LogKind>(row, 3)?,
        message: row.get(4)?,
        at: millis_to_datetime(5, row.get(5)?)?,
    })
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = taskd_common::ParseError>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn optional_millis(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|millis| millis_to_datetime(idx, millis))
        .transpose()
}

fn millis_to_datetime(idx: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::contract;
    use tempfile::tempdir;

    #[test]
    fn claim_moves_only_matching_pending() {
        contract::claim_moves_only_matching_pending(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn completion_is_idempotent() {
        contract::completion_is_idempotent(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn completion_checks_target() {
        contract::completion_checks_target(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn reclaim_only_touches_stale_dispatches() {
        contract::reclaim_only_touches_stale_dispatches(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn user_and_calendar_views() {
        contract::user_and_calendar_views(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn history_is_per_task_and_ordered() {
        contract::history_is_per_task_and_ordered(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn concurrent_claims_never_overlap() {
        let dir = tempdir().expect("tempdir");
        let store = SqliteStore::open(&dir.path().join("tasks.db")).expect("open store");
        contract::concurrent_claims_never_overlap(Arc::new(store));
    }

    #[test]
    fn two_handles_on_one_file_do_not_double_dispatch() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("shared.db");
        let first = SqliteStore::open(&path).expect("open first");
        let second = SqliteStore::open(&path).expect("open second");

        let now = Utc::now();
        for i in 0..10 {
            first
                .insert(
                    contract::host_task("HOST1", TaskKind::Message, &format!("m{i}")),
                    now,
                )
                .unwrap();
        }

        let a = first.claim_pending("HOST1", now).unwrap();
        let b = second.claim_pending("HOST1", now).unwrap();
        assert_eq!(a.len() + b.len(), 10);
        assert!(a.iter().all(|task| !b.iter().any(|other| other.id == task.id)));
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("tasks.db");
        let id = {
            let store = SqliteStore::open(&path).expect("open");
            store
                .insert(
                    contract::host_task("HOST1", TaskKind::Command, "true"),
                    Utc::now(),
                )
                .unwrap()
                .id
        };

        let reopened = SqliteStore::open(&path).expect("reopen");
        let task = reopened.get(id).unwrap().expect("task persisted");
        assert_eq!(task.kind, TaskKind::Command);
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn status_lists_come_from_the_status_machine() {
        assert_eq!(statuses_leading_to(TaskStatus::Dispatched), "'pending'");
        assert_eq!(statuses_leading_to(TaskStatus::Success), "'dispatched'");
        assert_eq!(statuses_leading_to(TaskStatus::Error), "'dispatched'");
        assert_eq!(
            status_list(TaskStatus::ALL.into_iter().filter(TaskStatus::can_reclaim)),
            "'dispatched'"
        );
    }

    #[test]
    fn corrupt_status_is_reported_not_panicked() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = store
            .insert(
                contract::host_task("HOST1", TaskKind::Message, "x"),
                Utc::now(),
            )
            .unwrap();
        store
            .lock()
            .unwrap()
            .execute(
                "UPDATE tasks SET status = 'exploded' WHERE id = ?1",
                params![task.id.0 as i64],
            )
            .unwrap();
        assert!(matches!(store.get(task.id), Err(StoreError::Sqlite(_))));
    }
}
