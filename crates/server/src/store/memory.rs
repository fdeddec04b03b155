use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use taskd_common::{Channel, LogKind, NewTask, Task, TaskId, TaskLog, TaskStatus, TerminalStatus};

use super::{Completion, ScheduleFilter, StoreError, TaskStore};

/// Process-local store. Every operation runs under one lock, which makes
/// each read-and-transition atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    tasks: BTreeMap<TaskId, Task>,
    next_log_id: u64,
    logs: Vec<TaskLog>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl TaskStore for MemoryStore {
    fn insert(&self, task: NewTask, now: DateTime<Utc>) -> Result<Task, StoreError> {
        let mut inner = self.lock()?;
        inner.next_id += 1;
        let id = TaskId(inner.next_id);
        let task = Task {
            id,
            channel: task.channel,
            target: task.target,
            title: task.title,
            kind: task.kind,
            payload: task.payload,
            status: TaskStatus::Pending,
            message: None,
            created_at: now,
            dispatched_at: None,
            completed_at: None,
            due_at: task.due_at,
        };
        inner.tasks.insert(id, task.clone());
        Ok(task)
    }

    fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.lock()?.tasks.get(&id).cloned())
    }

    fn claim_pending(&self, host: &str, now: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
        let mut inner = self.lock()?;
        let claimed = inner
            .tasks
            .values_mut()
            .filter(|task| {
                task.channel == Channel::Host
                    && task.target == host
                    && task.status.can_transition_to(TaskStatus::Dispatched)
            })
            .map(|task| {
                task.status = TaskStatus::Dispatched;
                task.dispatched_at = Some(now);
                task.clone()
            })
            .collect();
        Ok(claimed)
    }

    fn complete(
        &self,
        id: TaskId,
        expected_target: Option<&str>,
        status: TerminalStatus,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Completion, StoreError> {
        let mut inner = self.lock()?;
        let Some(task) = inner.tasks.get_mut(&id) else {
            return Ok(Completion::NotFound);
        };

        let next = TaskStatus::from(status);
        if !task.status.can_transition_to(next) {
            return Ok(Completion::NotDispatched(task.status));
        }
        if expected_target.is_some_and(|target| target != task.target) {
            return Ok(Completion::TargetMismatch);
        }

        task.status = next;
        task.message = Some(message.to_string());
        task.completed_at = Some(now);
        Ok(Completion::Applied(task.clone()))
    }

    fn reclaim_dispatched_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
        let mut inner = self.lock()?;
        let reclaimed = inner
            .tasks
            .values_mut()
            .filter(|task| {
                task.status.can_reclaim() && task.dispatched_at.is_some_and(|at| at < cutoff)
            })
            .map(|task| {
                task.status = TaskStatus::Pending;
                task.dispatched_at = None;
                task.clone()
            })
            .collect();
        Ok(reclaimed)
    }

    fn list_for_user(&self, username: &str) -> Result<Vec<Task>, StoreError> {
        let inner = self.lock()?;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|task| task.channel == Channel::User && task.target == username)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(tasks)
    }

    fn list_scheduled(&self, filter: &ScheduleFilter) -> Result<Vec<Task>, StoreError> {
        let inner = self.lock()?;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|task| {
                let Some(due) = task.due_at else {
                    return false;
                };
                filter.start.map_or(true, |start| due >= start)
                    && filter.end.map_or(true, |end| due <= end)
                    && filter
                        .target
                        .as_deref()
                        .map_or(true, |target| task.target == target)
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.due_at.cmp(&b.due_at).then(a.id.cmp(&b.id)));
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
        let mut inner = self.lock()?;
        if !inner.tasks.contains_key(&task_id) {
            return Ok(None);
        }
        inner.next_log_id += 1;
        let entry = TaskLog {
            id: inner.next_log_id,
            task_id,
            by: by.to_string(),
            status: kind,
            message: message.to_string(),
            at: now,
        };
        inner.logs.push(entry.clone());
        Ok(Some(entry))
    }

    fn list_logs(&self, task_id: TaskId) -> Result<Vec<TaskLog>, StoreError> {
        let inner = self.lock()?;
        let mut logs: Vec<TaskLog> = inner
            .logs
            .iter()
            .filter(|entry| entry.task_id == task_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| a.at.cmp(&b.at).then(a.id.cmp(&b.id)));
        Ok(logs)
    }
}
