//! `taskd` server: hands pending tasks to authenticated hosts and records
//! their reports.
//!
//! [`TaskServer`] holds the protocol logic and is transport-agnostic; the
//! axum layer in `http_server` only maps requests onto it.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use taskd_common::{
    Channel, ConfirmAck, ConfirmRequest, LogKind, NewTask, ObservationRequest, SecretRing, Task,
    TaskId, TaskLog, UserTaskView,
};

mod auth;
pub mod calendar;
pub mod config;
pub mod events;
mod http_server;
pub mod journal;
pub mod reclaim;
pub mod store;

use crate::auth::{AdminAuth, HostAuthenticator, PanelAuth};
use crate::calendar::{CalendarEvent, CalendarQuery};
use crate::events::{EventHub, ADMIN_STREAM};
use crate::journal::{Journal, JournalEvent};
use crate::store::{Completion, StoreError, TaskStore};

pub use http_server::{router, run_http_transport, serve_listener};

/// Whether confirmations must prove the reporting host's identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmAuth {
    #[default]
    Required,
    /// Accept unauthenticated reports from agents that predate tokens on
    /// the confirm path.
    Off,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct TaskServer {
    store: Arc<dyn TaskStore>,
    hosts: HostAuthenticator,
    admin: AdminAuth,
    panel: PanelAuth,
    confirm_auth: ConfirmAuth,
    journal: Option<Journal>,
    events: EventHub,
}

impl TaskServer {
    pub fn new(store: Arc<dyn TaskStore>, secrets: SecretRing) -> Self {
        Self {
            store,
            hosts: HostAuthenticator::new(secrets),
            admin: AdminAuth::new(Vec::new()),
            panel: PanelAuth::default(),
            confirm_auth: ConfirmAuth::default(),
            journal: None,
            events: EventHub::default(),
        }
    }

    pub fn with_admin_tokens(mut self, tokens: impl IntoIterator<Item = String>) -> Self {
        self.admin = AdminAuth::new(tokens);
        self
    }

    pub fn with_panel_token(mut self, token: Option<String>) -> Self {
        self.panel = PanelAuth::new(token);
        self
    }

    pub fn with_confirm_auth(mut self, confirm_auth: ConfirmAuth) -> Self {
        self.confirm_auth = confirm_auth;
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub(crate) fn admin(&self) -> &AdminAuth {
        &self.admin
    }

    /// Authenticates `host` and claims every pending task addressed to it.
    /// Claimed tasks are `dispatched` before this returns.
    pub fn fetch_pending(&self, host: &str, token: Option<&str>) -> Result<Vec<Task>, ServiceError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(ServiceError::BadRequest("missing host".into()));
        }
        if !self.hosts.authenticate(host, token) {
            tracing::warn!(host, "rejected task fetch with invalid token");
            return Err(ServiceError::Unauthorized);
        }

        let tasks = self.store.claim_pending(host, Utc::now())?;
        if !tasks.is_empty() {
            tracing::info!(host, count = tasks.len(), "dispatched tasks");
        }
        for task in &tasks {
            self.history(task.id, host, LogKind::Dispatched, "");
            self.record(
                JournalEvent::Dispatch,
                task.id,
                host,
                json!({ "type": task.kind.as_str() }),
            );
        }
        if !tasks.is_empty() {
            self.events.publish(ADMIN_STREAM, json!({ "type": "changed" }));
        }
        Ok(tasks)
    }

    /// Applies a host's terminal report. Reports that cannot apply (unknown
    /// task, already terminal, wrong host) are acknowledged with
    /// `applied: false` and change nothing.
    pub fn confirm(
        &self,
        report: &ConfirmRequest,
        bearer: Option<&str>,
    ) -> Result<ConfirmAck, ServiceError> {
        let host = report.host.trim();
        let expected_target = match self.confirm_auth {
            ConfirmAuth::Required => {
                let token = report.token.as_deref().or(bearer);
                if !self.hosts.authenticate(host, token) {
                    tracing::warn!(host, task_id = %report.task_id, "rejected unauthenticated confirmation");
                    return Err(ServiceError::Unauthorized);
                }
                Some(host)
            }
            ConfirmAuth::Off => None,
        };

        let completion = self.store.complete(
            report.task_id,
            expected_target,
            report.status,
            &report.message,
            Utc::now(),
        )?;

        let applied = match completion {
            Completion::Applied(task) => {
                tracing::info!(
                    host,
                    task_id = %task.id,
                    status = %task.status,
                    "task confirmed"
                );
                self.history(task.id, host, report.status.into(), &report.message);
                self.record(
                    JournalEvent::Confirm,
                    task.id,
                    host,
                    json!({ "status": report.status.as_str(), "message": report.message }),
                );
                self.events.publish_with_admin(
                    stream_for(&task),
                    json!({
                        "type": "completed",
                        "task": { "id": task.id, "status": task.status, "message": task.message },
                    }),
                );
                true
            }
            Completion::NotFound => {
                tracing::warn!(host, task_id = %report.task_id, "confirmation for unknown task");
                false
            }
            Completion::NotDispatched(current) => {
                tracing::info!(
                    host,
                    task_id = %report.task_id,
                    current = %current,
                    "ignored confirmation for task not in dispatched"
                );
                self.record(
                    JournalEvent::ConfirmIgnored,
                    report.task_id,
                    host,
                    json!({ "reason": "not_dispatched", "current": current.as_str() }),
                );
                false
            }
            Completion::TargetMismatch => {
                tracing::warn!(host, task_id = %report.task_id, "confirmation from a host that is not the target");
                self.record(
                    JournalEvent::ConfirmIgnored,
                    report.task_id,
                    host,
                    json!({ "reason": "target_mismatch" }),
                );
                false
            }
        };

        Ok(ConfirmAck {
            ok: true,
            task_id: report.task_id,
            applied,
        })
    }

    pub fn notify_tasks(&self, username: &str) -> Result<Vec<UserTaskView>, ServiceError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(ServiceError::BadRequest("missing username".into()));
        }
        let tasks = self.store.list_for_user(username)?;
        Ok(tasks.iter().map(UserTaskView::from).collect())
    }

    pub fn calendar_events(&self, query: &CalendarQuery) -> Result<Vec<CalendarEvent>, ServiceError> {
        let tasks = self.store.list_scheduled(&query.to_filter())?;
        Ok(tasks.iter().filter_map(CalendarEvent::from_task).collect())
    }

    pub fn enqueue(&self, task: NewTask) -> Result<Task, ServiceError> {
        let mut task = task;
        task.target = task.target.trim().to_string();
        if task.target.is_empty() {
            return Err(ServiceError::BadRequest("missing target".into()));
        }
        if task.title.trim().is_empty() {
            task.title = task.kind.to_string();
        }

        let task = self.store.insert(task, Utc::now())?;
        tracing::info!(
            task_id = %task.id,
            target = %task.target,
            channel = task.channel.as_str(),
            kind = %task.kind,
            "task enqueued"
        );
        self.record(
            JournalEvent::Enqueue,
            task.id,
            &task.target,
            json!({ "type": task.kind.as_str(), "channel": task.channel.as_str() }),
        );
        self.events.publish_with_admin(
            stream_for(&task),
            json!({ "type": "new", "task": UserTaskView::from(&task) }),
        );
        Ok(task)
    }

    /// Attaches a free-text note to a task's history.
    pub fn add_observation(
        &self,
        note: &ObservationRequest,
        panel_token: Option<&str>,
    ) -> Result<TaskLog, ServiceError> {
        if !self.panel.allows(panel_token) {
            return Err(ServiceError::Forbidden);
        }
        let username = note.username.trim();
        let message = note.message.trim();
        if username.is_empty() || message.is_empty() {
            return Err(ServiceError::BadRequest("username and message are required".into()));
        }

        let task = self
            .store
            .get(note.task_id)?
            .ok_or_else(|| ServiceError::NotFound("task not found".into()))?;
        let entry = self
            .store
            .append_log(task.id, username, LogKind::Observation, message, Utc::now())?
            .ok_or_else(|| ServiceError::NotFound("task not found".into()))?;

        tracing::info!(task_id = %task.id, user = username, "observation added");
        self.record(
            JournalEvent::Observation,
            task.id,
            username,
            json!({ "message": message }),
        );

        let payload = json!({
            "type": "new_observation",
            "task_id": task.id,
            "message": message,
            "user": username,
        });
        let addressee = stream_for(&task);
        self.events.publish(addressee, payload.clone());
        if addressee != ADMIN_STREAM {
            self.events.publish(ADMIN_STREAM, payload);
        }
        Ok(entry)
    }

    /// History of a task. Only the task's target and the admin stream may
    /// read it.
    pub fn task_logs(&self, task_id: TaskId, username: &str) -> Result<Vec<TaskLog>, ServiceError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(ServiceError::BadRequest("missing username".into()));
        }
        let task = self
            .store
            .get(task_id)?
            .ok_or_else(|| ServiceError::NotFound("task not found".into()))?;
        if username != ADMIN_STREAM && username != task.target {
            return Err(ServiceError::Forbidden);
        }
        Ok(self.store.list_logs(task_id)?)
    }

    /// Returns tasks stuck in `dispatched` for longer than `lease` to
    /// `pending` so the next poll delivers them again.
    pub fn reclaim_stale(&self, lease: Duration) -> Result<Vec<Task>, ServiceError> {
        let reclaimed = self.store.reclaim_dispatched_before(Utc::now() - lease)?;
        for task in &reclaimed {
            tracing::warn!(
                task_id = %task.id,
                host = %task.target,
                "reclaimed unconfirmed task"
            );
            self.history(
                task.id,
                &task.target,
                LogKind::Reclaimed,
                &format!("unconfirmed after {}s", lease.num_seconds()),
            );
            self.record(
                JournalEvent::Reclaim,
                task.id,
                &task.target,
                json!({ "lease_secs": lease.num_seconds() }),
            );
        }
        if !reclaimed.is_empty() {
            self.events.publish(ADMIN_STREAM, json!({ "type": "changed" }));
        }
        Ok(reclaimed)
    }

    /// History rows trail the transition they describe; a failed append is
    /// logged and the transition stands.
    fn history(&self, task_id: TaskId, by: &str, kind: LogKind, message: &str) {
        if let Err(err) = self.store.append_log(task_id, by, kind, message, Utc::now()) {
            tracing::error!(task_id = %task_id, kind = kind.as_str(), "task history append failed: {err}");
        }
    }

    fn record(&self, event: JournalEvent, task_id: TaskId, identity: &str, meta: serde_json::Value) {
        let Some(journal) = &self.journal else {
            return;
        };
        if let Err(err) = journal.append(event, task_id, identity, meta) {
            tracing::error!(event = event.as_str(), task_id = %task_id, "journal append failed: {err:#}");
        }
    }
}

/// Stream that hears about `task`: its user, or the admin stream for host
/// tasks.
fn stream_for(task: &Task) -> &str {
    match task.channel {
        Channel::User => &task.target,
        Channel::Host => ADMIN_STREAM,
    }
}
